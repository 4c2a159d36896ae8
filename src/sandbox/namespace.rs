//! Builds the only environment a snippet can see.
//!
//! The VM's own globals are never exposed. The snippet chunk is compiled
//! against a fresh table populated from an allow-list; any other name reads
//! as `NameError`, exactly as for a name that never existed.

use std::time::Instant;

use mlua::{
    Function, Lua, LuaOptions, MultiValue, RegistryKey, StdLib, Table, Value,
};
use tracing::debug;

use super::capture::{render_print, SharedCapture};
use super::error::{is_fatal, snippet_message, SandboxError, SnippetError};
use super::governor::RunGuard;
use super::patterns;
use super::modules::{self, graphics, ModuleContext, ModuleName, PixelBudget, Surface};
use super::types::ErrorKind;
use crate::config::SandboxSettings;

const LOADED_KEY: &str = "sandbox.loaded";
const OUTPUT_METHODS_KEY: &str = "sandbox.output";

/// Default frame delay for `output.add_frame`, in milliseconds.
const DEFAULT_FRAME_DELAY: i64 = 200;

/// Globals copied as-is from the base library.
const PLAIN_BUILTINS: [&str; 13] = [
    "assert",
    "error",
    "ipairs",
    "next",
    "pairs",
    "rawequal",
    "rawlen",
    "select",
    "setmetatable",
    "getmetatable",
    "tonumber",
    "tostring",
    "type",
];

/// A Lua state plus the environment table a snippet runs in.
/// Built per request and never shared.
pub struct CapabilityNamespace {
    lua: Lua,
    env: RegistryKey,
}

impl CapabilityNamespace {
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn env(&self) -> mlua::Result<Table<'_>> {
        self.lua.registry_value(&self.env)
    }
}

pub struct NamespaceBuilder<'a> {
    settings: &'a SandboxSettings,
    capture: SharedCapture,
    guard: RunGuard,
}

fn step<T>(module: &'static str, result: mlua::Result<T>) -> Result<T, SandboxError> {
    result.map_err(|source| SandboxError::Namespace { module, source })
}

impl<'a> NamespaceBuilder<'a> {
    pub fn new(settings: &'a SandboxSettings, capture: SharedCapture, guard: RunGuard) -> Self {
        Self {
            settings,
            capture,
            guard,
        }
    }

    pub fn build(self) -> Result<CapabilityNamespace, SandboxError> {
        let lua = step(
            "vm",
            Lua::new_with(
                StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8,
                LuaOptions::default(),
            ),
        )?;
        // Building the namespace allocates against the same cap as the snippet.
        step("vm", lua.set_memory_limit(self.settings.script_memory_bytes))?;
        let env = self.populate(&lua)?;
        Ok(CapabilityNamespace { lua, env })
    }

    fn populate(&self, lua: &Lua) -> Result<RegistryKey, SandboxError> {
        let globals = lua.globals();
        let env = step("builtins", lua.create_table())?;

        step("string", lock_string_library(lua, &globals, &self.guard))?;
        step("builtins", install_builtins(lua, &globals, &env))?;
        step("print", self.install_print(lua, &env))?;
        step("pcall", install_protected_calls(lua, &env))?;

        let ctx = ModuleContext {
            guard: self.guard.clone(),
            started: Instant::now(),
            pixels: PixelBudget::new(self.settings.script_memory_bytes as u64),
        };
        let loaded = step("require", lua.create_table())?;
        for &name in &self.settings.allowed_modules {
            let module = step(name.as_str(), modules::open(lua, name, &ctx))?;
            step(name.as_str(), env.set(name.as_str(), module.clone()))?;
            step(name.as_str(), loaded.set(name.as_str(), module))?;
        }
        step("require", lua.set_named_registry_value(LOADED_KEY, loaded))?;
        step(
            "require",
            install_require(lua, &env, &self.settings.allowed_modules),
        )?;

        step("output", self.install_output(lua, &env, &ctx.pixels))?;
        step("builtins", protect_environment(lua, &env))?;

        debug!(
            "Namespace built with modules: {:?}",
            self.settings.allowed_modules
        );
        step("builtins", lua.create_registry_value(env))
    }

    fn install_print<'lua>(&self, lua: &'lua Lua, env: &Table<'lua>) -> mlua::Result<()> {
        let capture = self.capture.clone();
        let sep = self.settings.print_separator.clone();
        let terminator = self.settings.print_terminator.clone();
        env.set(
            "print",
            lua.create_function(move |lua, values: MultiValue| {
                let fragment = render_print(&render_values(lua, values)?, &sep, &terminator);
                Ok(capture.append_text(&fragment)?)
            })?,
        )
    }

    fn install_output<'lua>(
        &self,
        lua: &'lua Lua,
        env: &Table<'lua>,
        budget: &PixelBudget,
    ) -> mlua::Result<()> {
        let methods = lua.create_table()?;

        let capture = self.capture.clone();
        methods.set(
            "print_with",
            lua.create_function(
                move |lua, (sep, terminator, values): (Option<String>, Option<String>, MultiValue)| {
                    let fragment = render_print(
                        &render_values(lua, values)?,
                        sep.as_deref().unwrap_or(" "),
                        terminator.as_deref().unwrap_or("\n"),
                    );
                    Ok(capture.append_text(&fragment)?)
                },
            )?,
        )?;

        let capture = self.capture.clone();
        methods.set(
            "add_frame",
            lua.create_function(move |_, (image, delay): (Value, Value)| {
                let delay = frame_delay(delay)?;
                let pixels = graphics::surface_pixels(&image)?;
                Ok(capture.lock().add_frame(pixels, delay)?)
            })?,
        )?;
        lua.set_named_registry_value(OUTPUT_METHODS_KEY, methods)?;

        let meta = lua.create_table()?;
        let capture = self.capture.clone();
        let budget = budget.clone();
        meta.set(
            "__index",
            lua.create_function(move |lua, (_, key): (Value, Value)| {
                let key = output_key(&key)?;
                match key.as_str() {
                    "text" => {
                        let text = capture.lock().text().to_string();
                        Ok(Value::String(lua.create_string(&text)?))
                    }
                    "loops" => Ok(Value::Integer(capture.lock().loops())),
                    "img" => {
                        let image = capture.lock().image().cloned();
                        match image {
                            Some(buffer) => {
                                let surface = Surface::from_buffer(lua, &budget, buffer)?;
                                Ok(Value::UserData(lua.create_userdata(surface)?))
                            }
                            None => Ok(Value::Nil),
                        }
                    }
                    "print_with" | "add_frame" => {
                        let methods: Table = lua.named_registry_value(OUTPUT_METHODS_KEY)?;
                        methods.get(key.as_str())
                    }
                    _ => Err(no_attribute(&key)),
                }
            })?,
        )?;

        let capture = self.capture.clone();
        meta.set(
            "__newindex",
            lua.create_function(move |_, (_, key, value): (Value, Value, Value)| {
                let key = output_key(&key)?;
                match key.as_str() {
                    "text" => {
                        let text = match value {
                            Value::String(s) => s.to_string_lossy().into_owned(),
                            Value::Integer(i) => i.to_string(),
                            Value::Number(n) => n.to_string(),
                            other => {
                                return Err(SnippetError::type_error(format!(
                                    "output.text must be a string, not '{}'",
                                    other.type_name()
                                ))
                                .into())
                            }
                        };
                        Ok(capture.lock().replace_text(text)?)
                    }
                    "img" => {
                        let image = match value {
                            Value::Nil => None,
                            other => Some(graphics::surface_pixels(&other)?),
                        };
                        Ok(capture.lock().set_image(image)?)
                    }
                    "loops" => {
                        let loops = match value {
                            Value::Integer(i) => i,
                            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => n as i64,
                            _ => {
                                return Err(SnippetError::type_error(
                                    "please set the loops to an integer value",
                                )
                                .into())
                            }
                        };
                        Ok(capture.lock().set_loops(loops)?)
                    }
                    "print_with" | "add_frame" => Err(SnippetError::new(
                        ErrorKind::AttributeError,
                        format!("'output' object attribute '{key}' is read-only"),
                    )
                    .into()),
                    _ => Err(no_attribute(&key)),
                }
            })?,
        )?;
        meta.set("__metatable", false)?;

        let output = lua.create_table()?;
        output.set_metatable(Some(meta));
        env.set("output", output)
    }
}

/// `tostring` of every value, honouring `__tostring`.
fn render_values(lua: &Lua, values: MultiValue) -> mlua::Result<Vec<String>> {
    let tostring: Function = lua.globals().get("tostring")?;
    values
        .into_iter()
        .map(|value| {
            let text: mlua::String = tostring.call(value)?;
            Ok(text.to_string_lossy().into_owned())
        })
        .collect()
}

fn output_key(key: &Value) -> mlua::Result<String> {
    match key {
        Value::String(s) => Ok(s.to_string_lossy().into_owned()),
        other => Err(SnippetError::new(
            ErrorKind::AttributeError,
            format!("'output' object has no attribute of type {}", other.type_name()),
        )
        .into()),
    }
}

fn no_attribute(key: &str) -> mlua::Error {
    SnippetError::new(
        ErrorKind::AttributeError,
        format!("'output' object has no attribute '{key}'"),
    )
    .into()
}

/// Validates an `add_frame` delay: a number in `0..=65535`, default 200.
fn frame_delay(delay: Value) -> mlua::Result<u16> {
    let delay = match delay {
        Value::Nil => DEFAULT_FRAME_DELAY,
        Value::Integer(i) => i,
        Value::Number(n) if n.is_nan() => {
            return Err(SnippetError::value_error("frame delay cannot be NaN").into())
        }
        // Saturating cast: huge floats land above the limit below.
        Value::Number(n) => n.trunc() as i64,
        other => {
            return Err(SnippetError::type_error(format!(
                "argument delay must be int not '{}'",
                other.type_name()
            ))
            .into())
        }
    };
    if delay > i64::from(u16::MAX) {
        return Err(SnippetError::value_error(
            "that would take a lot of time, please choose a number between 0 and 65535",
        )
        .into());
    }
    if delay < 0 {
        return Err(SnippetError::value_error(
            "negative time? That does not make sense, please choose between 0 and 65535",
        )
        .into());
    }
    Ok(delay as u16)
}

/// Strips `string.dump` and hides the string metatable, which is shared by
/// every string value and therefore reachable without any global.
fn lock_string_library<'lua>(
    lua: &'lua Lua,
    globals: &Table<'lua>,
    guard: &RunGuard,
) -> mlua::Result<()> {
    let string: Table = globals.get("string")?;
    string.set("dump", Value::Nil)?;
    patterns::install(lua, &string, guard)?;
    let getmetatable: Function = globals.get("getmetatable")?;
    let meta: Table = getmetatable.call(lua.create_string("")?)?;
    meta.set("__metatable", false)
}

fn install_builtins<'lua>(
    lua: &'lua Lua,
    globals: &Table<'lua>,
    env: &Table<'lua>,
) -> mlua::Result<()> {
    for name in PLAIN_BUILTINS {
        env.set(name, globals.get::<_, Value>(name)?)?;
    }
    let table: Table = globals.get("table")?;
    let utf8: Table = globals.get("utf8")?;
    env.set("unpack", table.get::<_, Value>("unpack")?)?;
    env.set("table", modules::copy_table(lua, &table)?)?;
    env.set("utf8", modules::copy_table(lua, &utf8)?)?;
    env.set("_VERSION", globals.get::<_, Value>("_VERSION")?)?;
    env.set("_G", env.clone())
}

/// `pcall`/`xpcall` that hand snippet errors back as `false, message` but
/// let interruptions and allocator exhaustion through.
fn install_protected_calls<'lua>(lua: &'lua Lua, env: &Table<'lua>) -> mlua::Result<()> {
    env.set(
        "pcall",
        lua.create_function(|lua, (f, args): (Value, MultiValue)| {
            match call_value(f, args) {
                Ok(results) => Ok(prepend(Value::Boolean(true), results)),
                Err(err) if is_fatal(&err) => Err(err),
                Err(err) => {
                    let message = Value::String(lua.create_string(snippet_message(&err))?);
                    Ok(MultiValue::from_vec(vec![Value::Boolean(false), message]))
                }
            }
        })?,
    )?;

    env.set(
        "xpcall",
        lua.create_function(|lua, (f, handler, args): (Value, Function, MultiValue)| {
            match call_value(f, args) {
                Ok(results) => Ok(prepend(Value::Boolean(true), results)),
                Err(err) if is_fatal(&err) => Err(err),
                Err(err) => {
                    let message = Value::String(lua.create_string(snippet_message(&err))?);
                    match handler.call::<_, MultiValue>(message) {
                        Ok(handled) => Ok(prepend(Value::Boolean(false), handled)),
                        Err(err) if is_fatal(&err) => Err(err),
                        Err(err) => {
                            let message =
                                Value::String(lua.create_string(snippet_message(&err))?);
                            Ok(MultiValue::from_vec(vec![Value::Boolean(false), message]))
                        }
                    }
                }
            }
        })?,
    )
}

fn call_value<'lua>(f: Value<'lua>, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    match f {
        Value::Function(f) => f.call(args),
        other => Err(SnippetError::type_error(format!(
            "attempt to call a {} value",
            other.type_name()
        ))
        .into()),
    }
}

fn prepend<'lua>(first: Value<'lua>, rest: MultiValue<'lua>) -> MultiValue<'lua> {
    let mut values = vec![first];
    values.extend(rest);
    MultiValue::from_vec(values)
}

fn install_require<'lua>(
    lua: &'lua Lua,
    env: &Table<'lua>,
    allowed: &[ModuleName],
) -> mlua::Result<()> {
    let available = allowed
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    env.set(
        "require",
        lua.create_function(move |lua, name: String| {
            let loaded: Table = lua.named_registry_value(LOADED_KEY)?;
            match loaded.raw_get::<_, Value>(name.as_str())? {
                Value::Nil => Err(SnippetError::new(
                    ErrorKind::ImportError,
                    format!(
                        "no module named '{name}' (the sandbox only provides pre-imported modules: {available})"
                    ),
                )
                .into()),
                module => Ok(module),
            }
        })?,
    )
}

/// Undefined names raise `NameError`; the metatable cannot be read or
/// replaced from inside the snippet.
fn protect_environment<'lua>(lua: &'lua Lua, env: &Table<'lua>) -> mlua::Result<()> {
    let meta = lua.create_table()?;
    meta.set(
        "__index",
        lua.create_function(|_, (_, key): (Value, Value)| -> mlua::Result<()> {
            let name = match &key {
                Value::String(s) => s.to_string_lossy().into_owned(),
                other => format!("<{}>", other.type_name()),
            };
            Err(SnippetError::new(
                ErrorKind::NameError,
                format!("name '{name}' is not defined"),
            )
            .into())
        })?,
    )?;
    meta.set("__metatable", false)?;
    env.set_metatable(Some(meta));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::error::{classify, Classified};
    use crate::sandbox::watchdog::testing::idle_watchdog;

    fn build_with(guard: RunGuard) -> (CapabilityNamespace, SharedCapture) {
        let settings = SandboxSettings::default();
        let capture = SharedCapture::new(settings.max_output_bytes);
        let namespace = NamespaceBuilder::new(&settings, capture.clone(), guard)
            .build()
            .unwrap();
        (namespace, capture)
    }

    fn build() -> (CapabilityNamespace, SharedCapture) {
        build_with(RunGuard::new(idle_watchdog()))
    }

    fn run(namespace: &CapabilityNamespace, code: &str) -> mlua::Result<()> {
        namespace
            .lua()
            .load(code)
            .set_environment(namespace.env()?)
            .exec()
    }

    fn kind_of(result: mlua::Result<()>) -> ErrorKind {
        match classify(&result.unwrap_err()) {
            Classified::Failure(kind, _) => kind,
            Classified::Interrupted => panic!("unexpected interruption"),
        }
    }

    #[test]
    fn test_build_fails_within_tiny_memory_limit() {
        let settings = SandboxSettings {
            script_memory_bytes: 1024,
            ..SandboxSettings::default()
        };
        let capture = SharedCapture::new(settings.max_output_bytes);
        let result = NamespaceBuilder::new(&settings, capture, RunGuard::new(idle_watchdog())).build();
        assert!(matches!(result, Err(SandboxError::Namespace { .. })));
    }

    #[test]
    fn test_string_methods_use_guarded_patterns() {
        let guard = RunGuard::new(idle_watchdog());
        let (namespace, capture) = build_with(guard.clone());
        run(&namespace, r#"print(("a,b"):gsub(",", ";"))"#).unwrap();
        guard.cancel();
        let err = run(
            &namespace,
            r#"local s = string.rep("a", 40) return s:match(string.rep("a*", 40) .. "b")"#,
        )
        .unwrap_err();
        assert_eq!(classify(&err), Classified::Interrupted);
        assert_eq!(capture.freeze().unwrap().text, "a;b 1\n");
    }

    #[test]
    fn test_denied_names_are_name_errors() {
        let (namespace, _) = build();
        for name in [
            "load",
            "loadstring",
            "dofile",
            "loadfile",
            "collectgarbage",
            "rawget",
            "rawset",
            "debug",
            "io",
            "os",
            "package",
            "coroutine",
            "never_defined",
        ] {
            let result = run(&namespace, &format!("local x = {name}"));
            assert_eq!(kind_of(result), ErrorKind::NameError, "{name}");
        }
    }

    #[test]
    fn test_escape_hatches_are_closed() {
        let (namespace, _) = build();
        run(
            &namespace,
            r#"
            assert(string.dump == nil)
            assert(("x").dump == nil)
            assert(getmetatable("") == false)
            assert(getmetatable(_G) == false)
            assert(_G == _G._G)
            "#,
        )
        .unwrap();
        assert!(run(&namespace, "setmetatable(_G, {})").is_err());
    }

    #[test]
    fn test_require_only_resolves_allowed_modules() {
        let (namespace, _) = build();
        run(&namespace, r#"assert(require("math") == math)"#).unwrap();
        assert_eq!(kind_of(run(&namespace, r#"require("os")"#)), ErrorKind::ImportError);
    }

    #[test]
    fn test_restricted_module_list() {
        let settings = SandboxSettings {
            allowed_modules: vec![ModuleName::Math],
            ..SandboxSettings::default()
        };
        let capture = SharedCapture::new(1024);
        let namespace = NamespaceBuilder::new(&settings, capture, RunGuard::new(idle_watchdog()))
            .build()
            .unwrap();
        run(&namespace, "local x = math.pi").unwrap();
        assert_eq!(kind_of(run(&namespace, "local x = re")), ErrorKind::NameError);
        assert_eq!(kind_of(run(&namespace, r#"require("re")"#)), ErrorKind::ImportError);
    }

    #[test]
    fn test_print_and_output_text() {
        let (namespace, capture) = build();
        run(
            &namespace,
            r#"
            print("a", 1, nil)
            output.print_with(", ", "!", "x", "y")
            output.text = output.text .. "z"
            "#,
        )
        .unwrap();
        assert_eq!(capture.lock().text(), "a 1 nil\nx, y!z");
    }

    #[test]
    fn test_output_rejects_unknown_attributes() {
        let (namespace, _) = build();
        for code in ["output.foo = 1", "local x = output.bar", "output.add_frame = 1"] {
            assert_eq!(kind_of(run(&namespace, code)), ErrorKind::AttributeError, "{code}");
        }
        assert_eq!(kind_of(run(&namespace, "output.text = {}")), ErrorKind::TypeError);
    }

    #[test]
    fn test_add_frame_validation() {
        let (namespace, capture) = build();
        let cases = [
            ("output.add_frame(graphics.Surface(2, 2), 70000)", ErrorKind::ValueError),
            ("output.add_frame(graphics.Surface(2, 2), -1)", ErrorKind::ValueError),
            (r#"output.add_frame(graphics.Surface(2, 2), "soon")"#, ErrorKind::TypeError),
            ("output.add_frame({}, 10)", ErrorKind::TypeError),
        ];
        for (code, kind) in cases {
            assert_eq!(kind_of(run(&namespace, code)), kind, "{code}");
        }

        run(
            &namespace,
            r#"
            local s = graphics.Surface(2, 2, "red")
            output.add_frame(s)
            output.add_frame(s, 50.9)
            output.loops = 3
            assert(output.loops == 3)
            "#,
        )
        .unwrap();
        let animation = capture.freeze().unwrap().animation.unwrap();
        let delays: Vec<u16> = animation.frames.iter().map(|f| f.delay_ms).collect();
        assert_eq!(delays, [200, 50]);
        assert_eq!(animation.loops, 3);
    }

    #[test]
    fn test_img_assignment_copies_pixels() {
        let (namespace, capture) = build();
        run(
            &namespace,
            r#"
            local s = graphics.Surface(2, 2, "red")
            output.img = s
            s:fill("blue")
            assert(output.img:get_at(0, 0).r == 255)
            "#,
        )
        .unwrap();
        let image = capture.freeze().unwrap().image.unwrap();
        assert_eq!(image.get(1, 1).map(|c| c.r), Some(255));
    }

    #[test]
    fn test_pcall_returns_snippet_errors() {
        let (namespace, _) = build();
        run(
            &namespace,
            r#"
            local ok, msg = pcall(function() error("boom", 0) end)
            assert(not ok and msg == "boom", msg)
            local ok2, msg2 = pcall(function() return undefined_name end)
            assert(not ok2 and msg2 == "NameError: name 'undefined_name' is not defined", msg2)
            local ok3, a, b = pcall(function(x, y) return x + y, "done" end, 1, 2)
            assert(ok3 and a == 3 and b == "done")
            local ok4, handled = xpcall(function() error("inner", 0) end, function(m) return "handled " .. m end)
            assert(not ok4 and handled == "handled inner", handled)
            "#,
        )
        .unwrap();
    }

    #[test]
    fn test_pcall_does_not_swallow_interruption() {
        let guard = RunGuard::new(idle_watchdog());
        let (namespace, _) = build_with(guard.clone());
        guard.cancel();
        let err = run(&namespace, "pcall(time.sleep, 1)").unwrap_err();
        assert_eq!(classify(&err), Classified::Interrupted);
    }

    #[test]
    fn test_frame_delay_bounds() {
        assert_eq!(frame_delay(Value::Nil).unwrap(), 200);
        assert_eq!(frame_delay(Value::Integer(0)).unwrap(), 0);
        assert_eq!(frame_delay(Value::Integer(65535)).unwrap(), 65535);
        assert!(frame_delay(Value::Number(f64::INFINITY)).is_err());
        assert!(frame_delay(Value::Boolean(true)).is_err());
    }
}
