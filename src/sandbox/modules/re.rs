//! Regular expressions over the `regex` crate. Patterns are compiled with
//! a size limit, so a snippet cannot build a pathological automaton, and
//! cached per request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use mlua::{Function, Lua, Table, Value};
use regex::{Captures, Regex, RegexBuilder};

use crate::sandbox::error::SnippetError;

const MAX_COMPILED_SIZE: usize = 1 << 20;
const MAX_CACHED_PATTERNS: usize = 64;

#[derive(Default)]
struct PatternCache {
    compiled: Mutex<HashMap<String, Regex>>,
}

impl PatternCache {
    fn get(&self, pattern: &str) -> mlua::Result<Regex> {
        let mut compiled = self.compiled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(re) = compiled.get(pattern) {
            return Ok(re.clone());
        }
        let re = RegexBuilder::new(pattern)
            .size_limit(MAX_COMPILED_SIZE)
            .build()
            .map_err(|e| SnippetError::value_error(format!("invalid pattern: {e}")))?;
        if compiled.len() >= MAX_CACHED_PATTERNS {
            compiled.clear();
        }
        compiled.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

/// Builds `{ text, start, stop, groups = {...}, named = {...} }`.
/// Positions are 1-based and inclusive like `string.find`; groups that did
/// not participate are `false`.
fn match_table<'lua>(lua: &'lua Lua, re: &Regex, caps: &Captures) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    if let Some(whole) = caps.get(0) {
        table.set("text", whole.as_str())?;
        table.set("start", whole.start() + 1)?;
        table.set("stop", whole.end())?;
    }

    let groups = lua.create_table()?;
    for index in 1..caps.len() {
        match caps.get(index) {
            Some(group) => groups.raw_set(index, group.as_str())?,
            None => groups.raw_set(index, false)?,
        }
    }
    table.set("groups", groups)?;

    let named = lua.create_table()?;
    for name in re.capture_names().flatten() {
        match caps.name(name) {
            Some(group) => named.set(name, group.as_str())?,
            None => named.set(name, false)?,
        }
    }
    table.set("named", named)?;
    Ok(table)
}

fn replacement_text(value: Value) -> mlua::Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(SnippetError::type_error(format!(
            "replacement function must return a string, got {}",
            other.type_name()
        ))
        .into()),
    }
}

pub(super) fn open(lua: &Lua) -> mlua::Result<Table<'_>> {
    let re_mod = lua.create_table()?;
    let cache = Arc::new(PatternCache::default());

    let c = cache.clone();
    re_mod.set(
        "search",
        lua.create_function(move |lua, (pattern, text): (String, String)| {
            let re = c.get(&pattern)?;
            match re.captures(&text) {
                Some(caps) => Ok(Value::Table(match_table(lua, &re, &caps)?)),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let c = cache.clone();
    re_mod.set(
        "match",
        lua.create_function(move |lua, (pattern, text): (String, String)| {
            let re = c.get(&format!(r"\A(?:{pattern})"))?;
            match re.captures(&text) {
                Some(caps) => Ok(Value::Table(match_table(lua, &re, &caps)?)),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let c = cache.clone();
    re_mod.set(
        "fullmatch",
        lua.create_function(move |lua, (pattern, text): (String, String)| {
            let re = c.get(&format!(r"\A(?:{pattern})\z"))?;
            match re.captures(&text) {
                Some(caps) => Ok(Value::Table(match_table(lua, &re, &caps)?)),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let c = cache.clone();
    re_mod.set(
        "findall",
        lua.create_function(move |lua, (pattern, text): (String, String)| {
            let re = c.get(&pattern)?;
            let found = lua.create_table()?;
            for (n, caps) in re.captures_iter(&text).enumerate() {
                let group = |i: usize| caps.get(i).map_or("", |m| m.as_str());
                match caps.len() {
                    1 => found.raw_set(n + 1, group(0))?,
                    2 => found.raw_set(n + 1, group(1))?,
                    len => {
                        let row = lua.create_table()?;
                        for i in 1..len {
                            row.raw_set(i, group(i))?;
                        }
                        found.raw_set(n + 1, row)?;
                    }
                }
            }
            Ok(found)
        })?,
    )?;

    let c = cache.clone();
    re_mod.set(
        "sub",
        lua.create_function(
            move |lua, (pattern, repl, text, count): (String, Value, String, Option<usize>)| {
                let re = c.get(&pattern)?;
                let limit = count.unwrap_or(0);
                match repl {
                    Value::String(template) => {
                        let template = template.to_str()?;
                        Ok(re.replacen(&text, limit, template).into_owned())
                    }
                    Value::Function(f) => substitute_with(lua, &re, &text, limit, f),
                    other => Err(SnippetError::type_error(format!(
                        "replacement must be a string or a function, got {}",
                        other.type_name()
                    ))
                    .into()),
                }
            },
        )?,
    )?;

    let c = cache;
    re_mod.set(
        "split",
        lua.create_function(move |lua, (pattern, text, maxsplit): (String, String, Option<usize>)| {
            let re = c.get(&pattern)?;
            let parts = lua.create_table()?;
            let pieces: Vec<&str> = match maxsplit {
                Some(n) if n > 0 => re.splitn(&text, n + 1).collect(),
                _ => re.split(&text).collect(),
            };
            for (i, piece) in pieces.into_iter().enumerate() {
                parts.raw_set(i + 1, piece)?;
            }
            Ok(parts)
        })?,
    )?;

    re_mod.set(
        "escape",
        lua.create_function(|_, text: String| Ok(regex::escape(&text)))?,
    )?;

    Ok(re_mod)
}

fn substitute_with<'lua>(
    lua: &'lua Lua,
    re: &Regex,
    text: &str,
    limit: usize,
    f: Function<'lua>,
) -> mlua::Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (n, caps) in re.captures_iter(text).enumerate() {
        if limit != 0 && n >= limit {
            break;
        }
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&text[last..whole.start()]);
        let replacement: Value = f.call(match_table(lua, re, &caps)?)?;
        out.push_str(&replacement_text(replacement)?);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}
