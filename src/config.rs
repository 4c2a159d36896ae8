use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::sandbox::modules::ModuleName;
use crate::sandbox::types::{PrivilegeTier, ResourceLimits};
use crate::sandbox::watchdog::{FailStop, WatchdogSettings};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

/// The `[sandbox]` table. Read once at start; every field has a default.
#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSettings {
    /// Wall-clock limit for standard callers, in seconds (fractions allowed)
    pub standard_timeout_secs: f64,
    /// Wall-clock limit for privileged callers, in seconds
    pub privileged_timeout_secs: f64,
    /// Process-wide resident memory ceiling
    pub memory_ceiling_bytes: u64,
    /// Modules pre-imported into every namespace
    pub allowed_modules: Vec<ModuleName>,
    pub memory_poll_interval_ms: u64,
    /// What a memory ceiling breach stops: the whole process or only the sandbox
    pub fail_stop: FailStop,
    /// Delay between a breach and process exit, so in-flight callers see `MemoryAborted`
    pub shutdown_grace_ms: u64,
    /// How long a timed-out execution thread gets to unwind before it is detached
    pub teardown_grace_ms: u64,
    /// Allocation cap of each snippet's Lua state
    pub script_memory_bytes: usize,
    pub max_output_bytes: usize,
    /// VM instructions between two governor checks
    pub instruction_quantum: u32,
    pub print_separator: String,
    pub print_terminator: String,
}

fn default_standard_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_privileged_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            standard_timeout_secs: default_standard_timeout().as_secs_f64(),
            privileged_timeout_secs: default_privileged_timeout().as_secs_f64(),
            memory_ceiling_bytes: 1 << 28,
            allowed_modules: ModuleName::ALL.to_vec(),
            memory_poll_interval_ms: 200,
            fail_stop: FailStop::Process,
            shutdown_grace_ms: 100,
            teardown_grace_ms: 250,
            script_memory_bytes: 64 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            instruction_quantum: 1000,
            print_separator: " ".to_string(),
            print_terminator: "\n".to_string(),
        }
    }
}

impl SandboxSettings {
    /// Resolves the limits that apply to a caller of the given tier.
    pub fn limits_for(&self, tier: PrivilegeTier) -> ResourceLimits {
        let timeout = match tier {
            PrivilegeTier::Standard => Duration::try_from_secs_f64(self.standard_timeout_secs)
                .unwrap_or_else(|_| default_standard_timeout()),
            PrivilegeTier::Privileged => Duration::try_from_secs_f64(self.privileged_timeout_secs)
                .unwrap_or_else(|_| default_privileged_timeout()),
        };
        ResourceLimits {
            timeout,
            memory_ceiling_bytes: self.memory_ceiling_bytes,
        }
    }

    pub fn watchdog_settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            ceiling_bytes: self.memory_ceiling_bytes,
            poll_interval: Duration::from_millis(self.memory_poll_interval_ms),
            fail_stop: self.fail_stop,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, secs) in [
            ("standard_timeout_secs", self.standard_timeout_secs),
            ("privileged_timeout_secs", self.privileged_timeout_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                bail!("sandbox.{name} must be a positive number of seconds, got {secs}");
            }
        }
        if self.standard_timeout_secs > self.privileged_timeout_secs {
            bail!(
                "sandbox.standard_timeout_secs ({}) exceeds privileged_timeout_secs ({})",
                self.standard_timeout_secs,
                self.privileged_timeout_secs
            );
        }
        if self.memory_ceiling_bytes == 0 {
            bail!("sandbox.memory_ceiling_bytes must be non-zero");
        }
        if self.memory_poll_interval_ms == 0 {
            bail!("sandbox.memory_poll_interval_ms must be non-zero");
        }
        if self.instruction_quantum == 0 {
            bail!("sandbox.instruction_quantum must be non-zero");
        }
        if self.script_memory_bytes == 0 || self.max_output_bytes == 0 {
            bail!("sandbox.script_memory_bytes and sandbox.max_output_bytes must be non-zero");
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        // Expand environment variables like ${SANDBOX_MEMORY_CEILING}
        let expanded = shellexpand::env(&content)?;
        let config: Config =
            toml::from_str(&expanded).with_context(|| format!("parsing config file {path}"))?;
        config.sandbox.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(content: &str) -> anyhow::Result<Config> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        Config::load(file.path().to_str().unwrap())
    }

    #[test]
    fn test_defaults() {
        let settings = SandboxSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.allowed_modules.len(), 9);
        assert_eq!(settings.fail_stop, FailStop::Process);
        assert_eq!(
            settings.limits_for(PrivilegeTier::Standard).timeout,
            Duration::from_secs(5)
        );
        assert_eq!(
            settings.limits_for(PrivilegeTier::Privileged).timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_memory_ceiling_is_tier_independent() {
        let settings = SandboxSettings::default();
        assert_eq!(
            settings.limits_for(PrivilegeTier::Standard).memory_ceiling_bytes,
            settings.limits_for(PrivilegeTier::Privileged).memory_ceiling_bytes
        );
        assert_eq!(settings.watchdog_settings().ceiling_bytes, 268_435_456);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = load_str("").unwrap();
        assert_eq!(config.sandbox.instruction_quantum, 1000);
        assert_eq!(config.sandbox.print_terminator, "\n");
    }

    #[test]
    fn test_load_overrides() {
        let config = load_str(
            r#"
            [sandbox]
            standard_timeout_secs = 2
            privileged_timeout_secs = 5.5
            allowed_modules = ["math", "re"]
            fail_stop = "sandbox"
            "#,
        )
        .unwrap();
        let settings = config.sandbox;
        assert_eq!(settings.allowed_modules, vec![ModuleName::Math, ModuleName::Re]);
        assert_eq!(settings.fail_stop, FailStop::Sandbox);
        assert_eq!(
            settings.limits_for(PrivilegeTier::Privileged).timeout,
            Duration::from_millis(5500)
        );
        assert_eq!(settings.memory_poll_interval_ms, 200);
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("EXEC_SANDBOX_TEST_CEILING", "1048576");
        let config = load_str(
            r#"
            [sandbox]
            memory_ceiling_bytes = ${EXEC_SANDBOX_TEST_CEILING}
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.memory_ceiling_bytes, 1_048_576);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let err = load_str("[sandbox]\nstandard_timeout_secs = 20\n").unwrap_err();
        assert!(err.to_string().contains("exceeds privileged_timeout_secs"));

        assert!(load_str("[sandbox]\ninstruction_quantum = 0\n").is_err());
        assert!(load_str("[sandbox]\nprivileged_timeout_secs = -1\n").is_err());
        assert!(load_str("[sandbox]\nallowed_modules = [\"os\"]\n").is_err());
        assert!(load_str("[sandbox]\nunknown_knob = 1\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load("/nonexistent/exec-sandbox.toml").unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
