use mlua::{Lua, Table};

use crate::sandbox::error::SnippetError;
use crate::sandbox::types::ErrorKind;

const PRELUDE: &str = include_str!("itertools.lua");

/// Runs the prelude in a private environment holding only what it uses.
pub(super) fn open(lua: &Lua) -> mlua::Result<Table<'_>> {
    let globals = lua.globals();
    let env = lua.create_table()?;
    for name in ["type", "select"] {
        env.set(name, globals.get::<_, mlua::Value>(name)?)?;
    }

    let base: Table = globals.get("table")?;
    let table = lua.create_table()?;
    table.set("unpack", base.get::<_, mlua::Value>("unpack")?)?;
    env.set("table", table)?;

    env.set(
        "raise",
        lua.create_function(|_, (kind, message): (String, String)| -> mlua::Result<()> {
            let kind = ErrorKind::from_name(&kind).unwrap_or(ErrorKind::RuntimeError);
            Err(SnippetError::new(kind, message).into())
        })?,
    )?;

    lua.load(PRELUDE)
        .set_name("=itertools")
        .set_environment(env)
        .call(())
}

#[cfg(test)]
mod tests {
    use crate::sandbox::error::{classify, Classified};
    use crate::sandbox::modules::testing::lua_with;
    use crate::sandbox::modules::ModuleName;
    use crate::sandbox::types::ErrorKind;

    fn eval(script: &str) -> String {
        lua_with(ModuleName::Itertools).load(script).eval().unwrap()
    }

    #[test]
    fn test_infinite_producers_with_islice() {
        assert_eq!(
            eval("return table.concat(itertools.collect(itertools.islice(itertools.count(5, 2), 3)), ',')"),
            "5,7,9"
        );
        assert_eq!(
            eval("return table.concat(itertools.collect(itertools.islice(itertools.cycle({'a', 'b'}), 5)), '')"),
            "ababa"
        );
        assert_eq!(
            eval("return table.concat(itertools.collect(itertools.islice(itertools.range(10), 2, 8, 3)), ',')"),
            "2,5"
        );
    }

    #[test]
    fn test_transformers() {
        assert_eq!(
            eval(
                r#"
                local evens = itertools.filter(function(x) return x % 2 == 0 end, itertools.range(1, 10))
                local squares = itertools.map(function(x) return x * x end, evens)
                return table.concat(itertools.collect(itertools.accumulate(squares)), ',')
                "#
            ),
            "4,20,56,120"
        );
        assert_eq!(
            eval("return tostring(itertools.reduce(function(a, b) return a * b end, {1, 2, 3, 4}))"),
            "24"
        );
        assert_eq!(
            eval(
                r#"
                local out = {}
                for i, a, b in itertools.enumerate(itertools.zip({1, 2, 3}, {"x", "y"})) do
                    out[#out + 1] = i .. ":" .. tostring(a)
                end
                return table.concat(out, " ")
                "#
            ),
            "1:1 2:2"
        );
    }

    #[test]
    fn test_combinatorics_counts() {
        assert_eq!(
            eval(
                r#"
                local function count(it) local n = 0 for _ in it do n = n + 1 end return n end
                return table.concat({
                    count(itertools.permutations({1, 2, 3})),
                    count(itertools.permutations({1, 2, 3, 4}, 2)),
                    count(itertools.combinations({1, 2, 3, 4, 5}, 3)),
                    count(itertools.product({1, 2}, {"a", "b", "c"})),
                }, ",")
                "#
            ),
            "6,12,10,6"
        );
        assert_eq!(
            eval(
                r#"
                local rows = {}
                for c in itertools.combinations({"a", "b", "c"}, 2) do
                    rows[#rows + 1] = table.concat(c)
                end
                return table.concat(rows, " ")
                "#
            ),
            "ab ac bc"
        );
    }

    #[test]
    fn test_errors_carry_kinds() {
        let lua = lua_with(ModuleName::Itertools);
        let err = lua.load("itertools.reduce(function() end, {})").exec().unwrap_err();
        assert!(matches!(classify(&err), Classified::Failure(ErrorKind::TypeError, _)));
        let err = lua.load("itertools.collect(42)").exec().unwrap_err();
        assert!(matches!(classify(&err), Classified::Failure(ErrorKind::TypeError, _)));
    }
}
