//! Pre-approved modules a snippet can reach. Each one is built fresh for
//! every request into the request's own Lua state.

mod cmath;
pub mod graphics;
mod itertools;
mod math;
mod random;
mod re;
mod strings;
mod time;

use std::time::Instant;

use mlua::{Lua, Table};
use serde::Deserialize;

use super::governor::RunGuard;

pub use graphics::{PixelBudget, Surface};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleName {
    Math,
    Cmath,
    Random,
    Re,
    Time,
    Timeit,
    String,
    Itertools,
    Graphics,
}

impl ModuleName {
    pub const ALL: [ModuleName; 9] = [
        ModuleName::Math,
        ModuleName::Cmath,
        ModuleName::Random,
        ModuleName::Re,
        ModuleName::Time,
        ModuleName::Timeit,
        ModuleName::String,
        ModuleName::Itertools,
        ModuleName::Graphics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleName::Math => "math",
            ModuleName::Cmath => "cmath",
            ModuleName::Random => "random",
            ModuleName::Re => "re",
            ModuleName::Time => "time",
            ModuleName::Timeit => "timeit",
            ModuleName::String => "string",
            ModuleName::Itertools => "itertools",
            ModuleName::Graphics => "graphics",
        }
    }
}

/// Per-request state the modules close over.
#[derive(Clone)]
pub struct ModuleContext {
    pub guard: RunGuard,
    /// Reference point for `time.monotonic` and friends.
    pub started: Instant,
    pub pixels: PixelBudget,
}

/// Builds the table for one module.
pub fn open<'lua>(lua: &'lua Lua, name: ModuleName, ctx: &ModuleContext) -> mlua::Result<Table<'lua>> {
    match name {
        ModuleName::Math => math::open(lua),
        ModuleName::Cmath => cmath::open(lua),
        ModuleName::Random => random::open(lua),
        ModuleName::Re => re::open(lua),
        ModuleName::Time => time::open_time(lua, ctx),
        ModuleName::Timeit => time::open_timeit(lua, ctx),
        ModuleName::String => strings::open(lua),
        ModuleName::Itertools => itertools::open(lua),
        ModuleName::Graphics => graphics::open(lua, ctx),
    }
}

/// Shallow copy of a table, so a snippet mutating its module cannot reach
/// the VM's own library tables.
pub(crate) fn copy_table<'lua>(lua: &'lua Lua, source: &Table<'lua>) -> mlua::Result<Table<'lua>> {
    let copy = lua.create_table()?;
    for pair in source.clone().pairs::<mlua::Value, mlua::Value>() {
        let (key, value) = pair?;
        copy.raw_set(key, value)?;
    }
    Ok(copy)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_names() {
        let names: Vec<_> = ModuleName::ALL.iter().map(|m| m.as_str()).collect();
        assert_eq!(
            names,
            ["math", "cmath", "random", "re", "time", "timeit", "string", "itertools", "graphics"]
        );
    }

    #[test]
    fn test_copy_table_is_detached() {
        let lua = Lua::new();
        let source = lua.create_table().unwrap();
        source.set("a", 1).unwrap();
        let copy = copy_table(&lua, &source).unwrap();
        copy.set("a", 2).unwrap();
        assert_eq!(source.get::<_, i64>("a").unwrap(), 1);
        assert_eq!(copy.get::<_, i64>("a").unwrap(), 2);
    }
}
