use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use exec_sandbox::config::Config;
use exec_sandbox::sandbox::{ExecutionOutcome, PrivilegeTier, Sandbox, SandboxRequest};

fn print_help() {
    println!(
        "\
exec-sandbox v{}

Runs one untrusted Lua snippet inside the execution sandbox and prints
the outcome.

USAGE:
    exec-sandbox [OPTIONS] [SNIPPET_PATH]

ARGUMENTS:
    SNIPPET_PATH    File holding the snippet [default: read from stdin]

OPTIONS:
    -c, --config <PATH>       TOML configuration file with a [sandbox] table
    -p, --privileged          Run with the privileged tier limits
        --caller <ID>         Caller identifier used in logs [default: cli]
        --image-out <PATH>    Write the image (PNG) or animation (GIF) here
        --json                Print the outcome as JSON
    -h, --help                Print this help message and exit
    -V, --version             Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, exec_sandbox=debug,warn)

EXIT STATUS:
    0 completed, 1 failed, 2 timed out, 3 memory aborted

EXAMPLES:
    echo 'print(math.pi)' | exec-sandbox
    exec-sandbox --privileged --image-out out.png draw.lua
    RUST_LOG=debug exec-sandbox --json snippet.lua",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config: Option<String>,
    privileged: bool,
    caller: Option<String>,
    image_out: Option<PathBuf>,
    json: bool,
    snippet: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Run(CliArgs),
    Help,
    Version,
}

impl CliArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Command> {
        let mut parsed = CliArgs::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--help" | "-h" => return Ok(Command::Help),
                "--version" | "-V" => return Ok(Command::Version),
                "--config" | "-c" => parsed.config = Some(value_for(&arg, args.next())?),
                "--privileged" | "-p" => parsed.privileged = true,
                "--caller" => parsed.caller = Some(value_for(&arg, args.next())?),
                "--image-out" => parsed.image_out = Some(value_for(&arg, args.next())?.into()),
                "--json" => parsed.json = true,
                flag if flag.starts_with('-') && flag != "-" => bail!("unknown option: {flag}"),
                path => {
                    if parsed.snippet.is_some() {
                        bail!("unexpected extra argument: {path}");
                    }
                    if path != "-" {
                        parsed.snippet = Some(path.into());
                    }
                }
            }
        }
        Ok(Command::Run(parsed))
    }

    fn tier(&self) -> PrivilegeTier {
        if self.privileged {
            PrivilegeTier::Privileged
        } else {
            PrivilegeTier::Standard
        }
    }
}

fn value_for(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| anyhow!("{flag} needs a value"))
}

fn read_snippet(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading snippet {}", path.display())),
        None => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("reading snippet from stdin")?;
            Ok(code)
        }
    }
}

fn exit_status(outcome: &ExecutionOutcome) -> u8 {
    match outcome {
        ExecutionOutcome::Completed { .. } => 0,
        ExecutionOutcome::Failed { .. } => 1,
        ExecutionOutcome::TimedOut { .. } => 2,
        ExecutionOutcome::MemoryAborted => 3,
    }
}

/// Encoded attachment for the outcome: the animation if there is one,
/// otherwise the still image.
fn attachment(outcome: &ExecutionOutcome) -> Result<Option<(&'static str, Vec<u8>)>> {
    if let ExecutionOutcome::Completed {
        animation: Some(animation),
        ..
    } = outcome
    {
        return Ok(Some(("image/gif", animation.encode_gif()?)));
    }
    match outcome.image() {
        Some(image) => Ok(Some(("image/png", image.encode_png()?))),
        None => Ok(None),
    }
}

fn render_json(outcome: &ExecutionOutcome, attachment: Option<&(&str, Vec<u8>)>) -> serde_json::Value {
    let mut value = json!({
        "outcome": outcome.label(),
        "text": outcome.text(),
    });
    match outcome {
        ExecutionOutcome::Completed { duration, .. } => {
            value["duration_ms"] = json!(duration.as_millis() as u64);
        }
        ExecutionOutcome::Failed { kind, message, .. } => {
            value["error"] = json!({ "kind": kind.as_str(), "message": message });
        }
        ExecutionOutcome::TimedOut { timeout, .. } => {
            value["timeout_ms"] = json!(timeout.as_millis() as u64);
        }
        ExecutionOutcome::MemoryAborted => {}
    }
    if let Some((mime, bytes)) = attachment {
        value["attachment"] = json!({ "mime": mime, "base64": BASE64.encode(bytes) });
    }
    value
}

fn render_plain(outcome: &ExecutionOutcome) {
    print!("{}", outcome.text());
    match outcome {
        ExecutionOutcome::Completed { .. } => {}
        ExecutionOutcome::Failed { kind, message, .. } => eprintln!("{kind}: {message}"),
        ExecutionOutcome::TimedOut { timeout, .. } => {
            eprintln!("Timed out after {:.1}s", timeout.as_secs_f64());
        }
        ExecutionOutcome::MemoryAborted => eprintln!("Aborted: sandbox memory ceiling exceeded"),
    }
}

async fn run(args: CliArgs) -> Result<u8> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None => Config::default(),
    };
    let code = read_snippet(args.snippet.as_ref())?;

    let sandbox = Sandbox::new(config.sandbox)?;
    let caller = args.caller.clone().unwrap_or_else(|| "cli".to_string());
    let request = SandboxRequest::new(code, args.tier(), caller);
    let outcome = sandbox.execute(request).await?;

    let attachment = attachment(&outcome)?;
    if let (Some(path), Some((mime, bytes))) = (&args.image_out, &attachment) {
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        info!("Wrote {mime} to {}", path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&render_json(&outcome, attachment.as_ref()))?);
    } else {
        render_plain(&outcome);
    }
    Ok(exit_status(&outcome))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print_help();
            return ExitCode::SUCCESS;
        }
        Ok(Command::Version) => {
            println!("exec-sandbox v{}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("error: {e}\n\nRun with --help for usage.");
            return ExitCode::from(64);
        }
    };

    // Initialize logging (RUST_LOG=debug for debug mode); logs go to stderr
    // so stdout stays the snippet's output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("exec_sandbox=info")),
        )
        .init();

    match run(args).await {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(70)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_sandbox::sandbox::{ErrorKind, PixelBuffer, Rgba};
    use std::time::Duration;

    fn parse(args: &[&str]) -> Result<Command> {
        CliArgs::parse(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn test_parse_defaults_to_stdin() {
        assert_eq!(parse(&[]).unwrap(), Command::Run(CliArgs::default()));
        assert_eq!(parse(&["-"]).unwrap(), Command::Run(CliArgs::default()));
    }

    #[test]
    fn test_parse_all_options() {
        let command = parse(&[
            "--config",
            "sandbox.toml",
            "-p",
            "--caller",
            "room@chat/alice",
            "--image-out",
            "out.png",
            "--json",
            "snippet.lua",
        ])
        .unwrap();
        let Command::Run(args) = command else {
            panic!("expected Run");
        };
        assert_eq!(args.config.as_deref(), Some("sandbox.toml"));
        assert_eq!(args.tier(), PrivilegeTier::Privileged);
        assert_eq!(args.caller.as_deref(), Some("room@chat/alice"));
        assert_eq!(args.image_out, Some(PathBuf::from("out.png")));
        assert!(args.json);
        assert_eq!(args.snippet, Some(PathBuf::from("snippet.lua")));
    }

    #[test]
    fn test_parse_help_and_version_win() {
        assert_eq!(parse(&["a.lua", "--help"]).unwrap(), Command::Help);
        assert_eq!(parse(&["-V"]).unwrap(), Command::Version);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--frobnicate"]).is_err());
        assert!(parse(&["a.lua", "b.lua"]).is_err());
    }

    #[test]
    fn test_exit_status_per_outcome() {
        let timed_out = ExecutionOutcome::TimedOut {
            partial_text: String::new(),
            image: None,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(exit_status(&timed_out), 2);
        assert_eq!(exit_status(&ExecutionOutcome::MemoryAborted), 3);
    }

    #[test]
    fn test_json_rendering() {
        let failed = ExecutionOutcome::Failed {
            kind: ErrorKind::NameError,
            message: "name 'os' is not defined".to_string(),
            partial_text: "before\n".to_string(),
        };
        let value = render_json(&failed, None);
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["text"], "before\n");
        assert_eq!(value["error"]["kind"], "NameError");

        let image = PixelBuffer::new(2, 2, Rgba::new(1, 2, 3, 255)).unwrap();
        let completed = ExecutionOutcome::Completed {
            text: String::new(),
            image: Some(image),
            animation: None,
            duration: Duration::from_millis(12),
        };
        let attachment = attachment(&completed).unwrap();
        let value = render_json(&completed, attachment.as_ref());
        assert_eq!(value["attachment"]["mime"], "image/png");
        let png = BASE64
            .decode(value["attachment"]["base64"].as_str().unwrap())
            .unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
}
