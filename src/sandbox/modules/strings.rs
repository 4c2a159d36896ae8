use mlua::{Lua, Table, Value, Variadic};

const ASCII_LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const ASCII_UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const HEXDIGITS: &str = "0123456789abcdefABCDEF";
const OCTDIGITS: &str = "01234567";
const PUNCTUATION: &str = r##"!"#$%&'()*+,-./:;<=>?@[\]^_`{|}~"##;
const WHITESPACE: &str = " \t\n\r\x0b\x0c";

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn capwords(text: &str, sep: Option<&str>) -> String {
    match sep {
        Some(sep) => text.split(sep).map(capitalize).collect::<Vec<_>>().join(sep),
        None => text.split_whitespace().map(capitalize).collect::<Vec<_>>().join(" "),
    }
}

fn split(text: &str, sep: Option<&str>, maxsplit: Option<usize>) -> Vec<String> {
    match (sep, maxsplit) {
        (Some(sep), Some(n)) => text.splitn(n + 1, sep).map(str::to_string).collect(),
        (Some(sep), None) => text.split(sep).map(str::to_string).collect(),
        (None, None) => text.split_whitespace().map(str::to_string).collect(),
        (None, Some(n)) => {
            let mut parts = Vec::new();
            let mut rest = text.trim_start();
            while !rest.is_empty() {
                if parts.len() == n {
                    parts.push(rest.trim_end().to_string());
                    break;
                }
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                parts.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            parts
        }
    }
}

fn strip<'a>(text: &'a str, chars: Option<&str>, leading: bool, trailing: bool) -> &'a str {
    let is_stripped = |c: char| match chars {
        Some(set) => set.contains(c),
        None => c.is_whitespace(),
    };
    let mut out = text;
    if leading {
        out = out.trim_start_matches(is_stripped);
    }
    if trailing {
        out = out.trim_end_matches(is_stripped);
    }
    out
}

fn piece_text(value: Value) -> mlua::Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(crate::sandbox::error::SnippetError::type_error(format!(
            "sequence item: expected str instance, {} found",
            other.type_name()
        ))
        .into()),
    }
}

/// Extends the VM's own `string` table, which is also the method table of
/// every string value. `string.dump` is removed by the namespace builder.
pub(super) fn open(lua: &Lua) -> mlua::Result<Table<'_>> {
    let string: Table = lua.globals().get("string")?;

    string.set("ascii_lowercase", ASCII_LOWERCASE)?;
    string.set("ascii_uppercase", ASCII_UPPERCASE)?;
    string.set("ascii_letters", format!("{ASCII_LOWERCASE}{ASCII_UPPERCASE}"))?;
    string.set("digits", DIGITS)?;
    string.set("hexdigits", HEXDIGITS)?;
    string.set("octdigits", OCTDIGITS)?;
    string.set("punctuation", PUNCTUATION)?;
    string.set("whitespace", WHITESPACE)?;
    string.set(
        "printable",
        format!("{DIGITS}{ASCII_LOWERCASE}{ASCII_UPPERCASE}{PUNCTUATION}{WHITESPACE}"),
    )?;

    string.set(
        "capwords",
        lua.create_function(|_, (text, sep): (String, Option<String>)| {
            Ok(capwords(&text, sep.as_deref()))
        })?,
    )?;
    string.set(
        "split",
        lua.create_function(
            |_, (text, sep, maxsplit): (String, Option<String>, Option<usize>)| {
                Ok(split(&text, sep.as_deref().filter(|s| !s.is_empty()), maxsplit))
            },
        )?,
    )?;
    string.set(
        "strip",
        lua.create_function(|_, (text, chars): (String, Option<String>)| {
            Ok(strip(&text, chars.as_deref(), true, true).to_string())
        })?,
    )?;
    string.set(
        "lstrip",
        lua.create_function(|_, (text, chars): (String, Option<String>)| {
            Ok(strip(&text, chars.as_deref(), true, false).to_string())
        })?,
    )?;
    string.set(
        "rstrip",
        lua.create_function(|_, (text, chars): (String, Option<String>)| {
            Ok(strip(&text, chars.as_deref(), false, true).to_string())
        })?,
    )?;
    string.set(
        "join",
        lua.create_function(|_, (sep, items): (String, Table)| {
            let mut pieces = Vec::new();
            for value in items.sequence_values::<Value>() {
                pieces.push(piece_text(value?)?);
            }
            Ok(pieces.join(&sep))
        })?,
    )?;
    string.set(
        "startswith",
        lua.create_function(|_, (text, prefixes): (String, Variadic<String>)| {
            Ok(prefixes.iter().any(|p| text.starts_with(p.as_str())))
        })?,
    )?;
    string.set(
        "endswith",
        lua.create_function(|_, (text, suffixes): (String, Variadic<String>)| {
            Ok(suffixes.iter().any(|s| text.ends_with(s.as_str())))
        })?,
    )?;

    Ok(string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::modules::testing::lua_with;
    use crate::sandbox::modules::ModuleName;

    #[test]
    fn test_capwords() {
        assert_eq!(capwords("hello   wORLD", None), "Hello World");
        assert_eq!(capwords("a-b-c", Some("-")), "A-B-C");
    }

    #[test]
    fn test_split_variants() {
        assert_eq!(split("  a b  c ", None, None), ["a", "b", "c"]);
        assert_eq!(split("a,b,,c", Some(","), None), ["a", "b", "", "c"]);
        assert_eq!(split("a,b,c", Some(","), Some(1)), ["a", "b,c"]);
        assert_eq!(split(" a b  c ", None, Some(1)), ["a", "b  c"]);
    }

    #[test]
    fn test_strip() {
        assert_eq!(strip("  x  ", None, true, true), "x");
        assert_eq!(strip("xxhixx", Some("x"), true, false), "hixx");
    }

    #[test]
    fn test_string_methods_from_lua() {
        let lua = lua_with(ModuleName::String);
        let (joined, upper, starts): (String, String, bool) = lua
            .load(
                r#"
                local s = "  padded  "
                return string.join("-", {"a", 1, "b"}), ("abc"):upper(), s:strip():startswith("pad")
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(joined, "a-1-b");
        assert_eq!(upper, "ABC");
        assert!(starts);
        let digits: String = lua.load("return string.digits").eval().unwrap();
        assert_eq!(digits, "0123456789");
    }
}
