//! Lua string patterns that stay interruptible.
//!
//! The instruction hook only fires while the VM runs bytecode, never inside
//! a C function, so the stock `string.find` family can backtrack for as long
//! as a pattern allows. These replacements keep Lua 5.4 pattern semantics
//! over bytes and poll the [`RunGuard`] while they match.

use mlua::{Function, Lua, MultiValue, Table, Value};

use super::error::SnippetError;
use super::governor::RunGuard;

const MAX_CAPTURES: usize = 32;
/// Nesting limit of the matcher's recursion.
const MAX_MATCH_DEPTH: usize = 200;
const ESCAPE: u8 = b'%';
const SPECIALS: &[u8] = b"^$*+?.([%-";
/// Matching work between two guard checks.
const CHECK_INTERVAL: usize = 1024;

fn pattern_error(message: impl Into<String>) -> mlua::Error {
    SnippetError::value_error(message).into()
}

struct Budget<'a> {
    guard: &'a RunGuard,
    spent: usize,
}

impl<'a> Budget<'a> {
    fn new(guard: &'a RunGuard) -> Self {
        Self { guard, spent: 0 }
    }

    fn charge(&mut self, cost: usize) -> mlua::Result<()> {
        self.spent = self.spent.saturating_add(cost).saturating_add(1);
        if self.spent >= CHECK_INTERVAL {
            self.spent = 0;
            self.guard.checkpoint()?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CaptureLen {
    Unfinished,
    Position,
    Closed(usize),
}

#[derive(Clone, Copy)]
struct Capture {
    start: usize,
    len: CaptureLen,
}

enum Captured<'a> {
    Text(&'a [u8]),
    Position(usize),
}

impl Captured<'_> {
    fn to_value<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Value<'lua>> {
        match self {
            Captured::Text(bytes) => lua.create_string(bytes).map(Value::String),
            Captured::Position(at) => Ok(Value::Integer(*at as i64)),
        }
    }
}

fn captured_values<'lua>(lua: &'lua Lua, captured: &[Captured<'_>]) -> mlua::Result<Vec<Value<'lua>>> {
    captured.iter().map(|c| c.to_value(lua)).collect()
}

fn match_class(c: u8, class: u8) -> bool {
    let res = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'g' => c.is_ascii_graphic(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => matches!(c, b' ' | b'\t'..=b'\r'),
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        _ => return class == c,
    };
    if class.is_ascii_uppercase() {
        !res
    } else {
        res
    }
}

/// `pat[p]` is the opening `[` and `pat[close]` its closing `]`.
fn match_bracket_class(c: u8, pat: &[u8], mut p: usize, close: usize) -> bool {
    let mut found = true;
    if pat.get(p + 1) == Some(&b'^') {
        found = false;
        p += 1;
    }
    loop {
        p += 1;
        if p >= close {
            return !found;
        }
        if pat[p] == ESCAPE {
            p += 1;
            if match_class(c, pat.get(p).copied().unwrap_or(0)) {
                return found;
            }
        } else if pat.get(p + 1) == Some(&b'-') && p + 2 < close {
            p += 2;
            if pat[p - 2] <= c && c <= pat[p] {
                return found;
            }
        } else if pat[p] == c {
            return found;
        }
    }
}

/// Backtracking matcher over one subject and one (unanchored) pattern.
struct Matcher<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    depth: usize,
    level: usize,
    captures: [Capture; MAX_CAPTURES],
    budget: Budget<'a>,
}

impl<'a> Matcher<'a> {
    fn new(src: &'a [u8], pat: &'a [u8], guard: &'a RunGuard) -> Self {
        Self {
            src,
            pat,
            depth: MAX_MATCH_DEPTH,
            level: 0,
            captures: [Capture {
                start: 0,
                len: CaptureLen::Unfinished,
            }; MAX_CAPTURES],
            budget: Budget::new(guard),
        }
    }

    fn reset(&mut self) {
        self.level = 0;
        self.depth = MAX_MATCH_DEPTH;
    }

    /// Pattern byte at `p`, or NUL past the end.
    fn pat_at(&self, p: usize) -> u8 {
        self.pat.get(p).copied().unwrap_or(0)
    }

    fn class_end(&self, mut p: usize) -> mlua::Result<usize> {
        let first = self.pat_at(p);
        p += 1;
        match first {
            ESCAPE => {
                if p >= self.pat.len() {
                    return Err(pattern_error("malformed pattern (ends with '%')"));
                }
                Ok(p + 1)
            }
            b'[' => {
                if self.pat_at(p) == b'^' {
                    p += 1;
                }
                loop {
                    if p >= self.pat.len() {
                        return Err(pattern_error("malformed pattern (missing ']')"));
                    }
                    let c = self.pat[p];
                    p += 1;
                    if c == ESCAPE && p < self.pat.len() {
                        p += 1;
                    }
                    if self.pat_at(p) == b']' {
                        return Ok(p + 1);
                    }
                }
            }
            _ => Ok(p),
        }
    }

    fn single_match(&self, s: usize, p: usize, ep: usize) -> bool {
        let Some(&c) = self.src.get(s) else {
            return false;
        };
        match self.pat[p] {
            b'.' => true,
            ESCAPE => match_class(c, self.pat_at(p + 1)),
            b'[' => match_bracket_class(c, self.pat, p, ep - 1),
            literal => literal == c,
        }
    }

    /// End of the match of `pat[p..]` starting at `src[s]`, if any.
    fn do_match(&mut self, s: usize, p: usize) -> mlua::Result<Option<usize>> {
        if self.depth == 0 {
            return Err(pattern_error("pattern too complex"));
        }
        self.depth -= 1;
        let result = self.match_here(s, p);
        self.depth += 1;
        result
    }

    fn match_here(&mut self, mut s: usize, mut p: usize) -> mlua::Result<Option<usize>> {
        loop {
            self.budget.charge(0)?;
            if p == self.pat.len() {
                return Ok(Some(s));
            }
            match self.pat[p] {
                b'(' => {
                    return if self.pat_at(p + 1) == b')' {
                        self.start_capture(s, p + 2, CaptureLen::Position)
                    } else {
                        self.start_capture(s, p + 1, CaptureLen::Unfinished)
                    };
                }
                b')' => return self.end_capture(s, p + 1),
                b'$' if p + 1 == self.pat.len() => {
                    return Ok((s == self.src.len()).then_some(s));
                }
                ESCAPE if self.pat_at(p + 1) == b'b' => match self.match_balance(s, p + 2)? {
                    Some(end) => {
                        s = end;
                        p += 4;
                    }
                    None => return Ok(None),
                },
                ESCAPE if self.pat_at(p + 1) == b'f' => {
                    p += 2;
                    if self.pat_at(p) != b'[' {
                        return Err(pattern_error("missing '[' after '%f' in pattern"));
                    }
                    let ep = self.class_end(p)?;
                    let previous = if s == 0 { 0 } else { self.src[s - 1] };
                    let current = self.src.get(s).copied().unwrap_or(0);
                    if match_bracket_class(previous, self.pat, p, ep - 1)
                        || !match_bracket_class(current, self.pat, p, ep - 1)
                    {
                        return Ok(None);
                    }
                    p = ep;
                }
                ESCAPE if self.pat_at(p + 1).is_ascii_digit() => {
                    match self.match_capture(s, self.pat_at(p + 1))? {
                        Some(end) => {
                            s = end;
                            p += 2;
                        }
                        None => return Ok(None),
                    }
                }
                _ => {
                    let ep = self.class_end(p)?;
                    let quantifier = self.pat_at(ep);
                    if !self.single_match(s, p, ep) {
                        if matches!(quantifier, b'*' | b'?' | b'-') {
                            p = ep + 1;
                            continue;
                        }
                        return Ok(None);
                    }
                    match quantifier {
                        b'?' => {
                            if let Some(end) = self.do_match(s + 1, ep + 1)? {
                                return Ok(Some(end));
                            }
                            p = ep + 1;
                        }
                        b'+' => return self.max_expand(s + 1, p, ep),
                        b'*' => return self.max_expand(s, p, ep),
                        b'-' => return self.min_expand(s, p, ep),
                        _ => {
                            s += 1;
                            p = ep;
                        }
                    }
                }
            }
        }
    }

    fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> mlua::Result<Option<usize>> {
        let mut count = 0;
        while self.single_match(s + count, p, ep) {
            self.budget.charge(0)?;
            count += 1;
        }
        loop {
            if let Some(end) = self.do_match(s + count, ep + 1)? {
                return Ok(Some(end));
            }
            if count == 0 {
                return Ok(None);
            }
            count -= 1;
        }
    }

    fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> mlua::Result<Option<usize>> {
        loop {
            if let Some(end) = self.do_match(s, ep + 1)? {
                return Ok(Some(end));
            }
            if !self.single_match(s, p, ep) {
                return Ok(None);
            }
            s += 1;
        }
    }

    fn start_capture(&mut self, s: usize, p: usize, len: CaptureLen) -> mlua::Result<Option<usize>> {
        if self.level >= MAX_CAPTURES {
            return Err(pattern_error("too many captures"));
        }
        self.captures[self.level] = Capture { start: s, len };
        self.level += 1;
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.level -= 1;
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> mlua::Result<Option<usize>> {
        let open = (0..self.level)
            .rev()
            .find(|&l| self.captures[l].len == CaptureLen::Unfinished)
            .ok_or_else(|| pattern_error("invalid pattern capture"))?;
        self.captures[open].len = CaptureLen::Closed(s - self.captures[open].start);
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.captures[open].len = CaptureLen::Unfinished;
        }
        Ok(result)
    }

    fn match_balance(&mut self, s: usize, p: usize) -> mlua::Result<Option<usize>> {
        if p + 1 >= self.pat.len() {
            return Err(pattern_error("malformed pattern (missing arguments to '%b')"));
        }
        let (open, close) = (self.pat[p], self.pat[p + 1]);
        if self.src.get(s) != Some(&open) {
            return Ok(None);
        }
        let src = self.src;
        let mut depth = 1usize;
        for (i, &c) in src.iter().enumerate().skip(s + 1) {
            self.budget.charge(0)?;
            if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(i + 1));
                }
            } else if c == open {
                depth += 1;
            }
        }
        Ok(None)
    }

    /// Back-reference `%1`..`%9` at `src[s]`.
    fn match_capture(&mut self, s: usize, digit: u8) -> mlua::Result<Option<usize>> {
        let index = usize::from(digit - b'0');
        if index == 0 || index > self.level || self.captures[index - 1].len == CaptureLen::Unfinished {
            return Err(pattern_error(format!("invalid capture index %{index}")));
        }
        let Capture { start, len } = self.captures[index - 1];
        let CaptureLen::Closed(len) = len else {
            return Ok(None);
        };
        self.budget.charge(len)?;
        let src = self.src;
        let matched = src.len() - s >= len && src[start..start + len] == src[s..s + len];
        Ok(matched.then_some(s + len))
    }

    /// Capture `i` of the last match; with no captures, index 0 is the whole
    /// match `src[s..e]`.
    fn capture(&self, i: usize, s: usize, e: usize) -> mlua::Result<Captured<'a>> {
        let src = self.src;
        if i >= self.level {
            if i != 0 {
                return Err(pattern_error(format!("invalid capture index %{}", i + 1)));
            }
            return Ok(Captured::Text(&src[s..e]));
        }
        let Capture { start, len } = self.captures[i];
        match len {
            CaptureLen::Unfinished => Err(pattern_error("unfinished capture")),
            CaptureLen::Position => Ok(Captured::Position(start + 1)),
            CaptureLen::Closed(len) => Ok(Captured::Text(&src[start..start + len])),
        }
    }

    fn all_captures(&self, whole: Option<(usize, usize)>) -> mlua::Result<Vec<Captured<'a>>> {
        let count = if self.level == 0 && whole.is_some() {
            1
        } else {
            self.level
        };
        let (s, e) = whole.unwrap_or((0, 0));
        (0..count).map(|i| self.capture(i, s, e)).collect()
    }

    /// Appends a string replacement with `%0`..`%9` and `%%` expanded.
    fn expand(&mut self, template: &[u8], s: usize, e: usize, out: &mut Vec<u8>) -> mlua::Result<()> {
        let before = out.len();
        let mut rest = template;
        while let Some(at) = rest.iter().position(|&c| c == ESCAPE) {
            out.extend_from_slice(&rest[..at]);
            match rest.get(at + 1).copied() {
                Some(ESCAPE) => out.push(ESCAPE),
                Some(b'0') => out.extend_from_slice(&self.src[s..e]),
                Some(d) if d.is_ascii_digit() => match self.capture(usize::from(d - b'1'), s, e)? {
                    Captured::Text(bytes) => out.extend_from_slice(bytes),
                    Captured::Position(at) => out.extend_from_slice(at.to_string().as_bytes()),
                },
                _ => return Err(pattern_error("invalid use of '%' in replacement string")),
            }
            rest = &rest[at + 2..];
        }
        out.extend_from_slice(rest);
        self.budget.charge(out.len() - before)
    }
}

/// Resolves Lua's 1-based, possibly negative start position.
fn start_position(init: Option<i64>, len: usize) -> usize {
    match init.unwrap_or(1) {
        pos if pos > 0 => usize::try_from(pos).unwrap_or(usize::MAX),
        0 => 1,
        pos if pos.unsigned_abs() > len as u64 => 1,
        pos => len - pos.unsigned_abs() as usize + 1,
    }
}

fn split_anchor(pat: &[u8]) -> (bool, &[u8]) {
    match pat.split_first() {
        Some((b'^', rest)) => (true, rest),
        _ => (false, pat),
    }
}

fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

fn find_plain(
    budget: &mut Budget<'_>,
    haystack: &[u8],
    needle: &[u8],
    from: usize,
) -> mlua::Result<Option<usize>> {
    if needle.len() > haystack.len() - from {
        return Ok(None);
    }
    for at in from..=haystack.len() - needle.len() {
        budget.charge(needle.len())?;
        if haystack[at..at + needle.len()] == *needle {
            return Ok(Some(at));
        }
    }
    Ok(None)
}

fn not_found<'lua>() -> MultiValue<'lua> {
    MultiValue::from_vec(vec![Value::Nil])
}

/// Shared body of `string.find` and `string.match`.
fn find_or_match<'lua>(
    lua: &'lua Lua,
    guard: &RunGuard,
    find: bool,
    subject: &[u8],
    pattern: &[u8],
    init: Option<i64>,
    plain: bool,
) -> mlua::Result<MultiValue<'lua>> {
    let init = start_position(init, subject.len()) - 1;
    if init > subject.len() {
        return Ok(not_found());
    }
    if find && (plain || !pattern.iter().any(|c| SPECIALS.contains(c))) {
        let mut budget = Budget::new(guard);
        return Ok(match find_plain(&mut budget, subject, pattern, init)? {
            Some(at) => MultiValue::from_vec(vec![
                Value::Integer(at as i64 + 1),
                Value::Integer((at + pattern.len()) as i64),
            ]),
            None => not_found(),
        });
    }

    let (anchor, pattern) = split_anchor(pattern);
    let mut matcher = Matcher::new(subject, pattern, guard);
    let mut start = init;
    loop {
        matcher.reset();
        if let Some(end) = matcher.do_match(start, 0)? {
            let values = if find {
                let mut values = vec![Value::Integer(start as i64 + 1), Value::Integer(end as i64)];
                values.extend(captured_values(lua, &matcher.all_captures(None)?)?);
                values
            } else {
                captured_values(lua, &matcher.all_captures(Some((start, end)))?)?
            };
            return Ok(MultiValue::from_vec(values));
        }
        if anchor || start >= subject.len() {
            return Ok(not_found());
        }
        start += 1;
    }
}

fn gmatch<'lua>(
    lua: &'lua Lua,
    guard: RunGuard,
    subject: &[u8],
    pattern: &[u8],
    init: Option<i64>,
) -> mlua::Result<Function<'lua>> {
    let subject = subject.to_vec();
    let pattern = pattern.to_vec();
    let mut next = (start_position(init, subject.len()) - 1).min(subject.len() + 1);
    let mut last_match = None;
    lua.create_function_mut(move |lua, ()| {
        let mut matcher = Matcher::new(&subject, &pattern, &guard);
        while next <= subject.len() {
            let start = next;
            matcher.reset();
            if let Some(end) = matcher.do_match(start, 0)? {
                if Some(end) != last_match {
                    next = end;
                    last_match = Some(end);
                    let captured = matcher.all_captures(Some((start, end)))?;
                    return Ok(MultiValue::from_vec(captured_values(lua, &captured)?));
                }
            }
            next += 1;
        }
        Ok(MultiValue::new())
    })
}

enum Replacement<'lua> {
    Text(mlua::String<'lua>),
    Table(Table<'lua>),
    Function(Function<'lua>),
}

impl<'lua> Replacement<'lua> {
    fn from_value(lua: &'lua Lua, value: Value<'lua>) -> mlua::Result<Self> {
        let type_name = value.type_name();
        let text = match value {
            Value::Table(table) => return Ok(Replacement::Table(table)),
            Value::Function(function) => return Ok(Replacement::Function(function)),
            Value::String(_) | Value::Integer(_) | Value::Number(_) => lua.coerce_string(value)?,
            _ => None,
        };
        text.map(Replacement::Text).ok_or_else(|| {
            SnippetError::type_error(format!(
                "bad argument #3 to 'gsub' (string/function/table expected, got {type_name})"
            ))
            .into()
        })
    }

    /// Appends the replacement for the match `src[s..e]`. Returns whether the
    /// original text was changed.
    fn apply(
        &self,
        lua: &'lua Lua,
        matcher: &mut Matcher<'_>,
        s: usize,
        e: usize,
        out: &mut Vec<u8>,
    ) -> mlua::Result<bool> {
        let value: Value = match self {
            Replacement::Text(template) => {
                matcher.expand(template.as_bytes(), s, e, out)?;
                return Ok(true);
            }
            Replacement::Table(table) => table.get(matcher.capture(0, s, e)?.to_value(lua)?)?,
            Replacement::Function(function) => {
                let captured = matcher.all_captures(Some((s, e)))?;
                function.call(MultiValue::from_vec(captured_values(lua, &captured)?))?
            }
        };
        if !is_truthy(&value) {
            out.extend_from_slice(&matcher.src[s..e]);
            return Ok(false);
        }
        let type_name = value.type_name();
        let text = match value {
            Value::String(_) | Value::Integer(_) | Value::Number(_) => lua.coerce_string(value)?,
            _ => None,
        };
        match text {
            Some(text) => {
                out.extend_from_slice(text.as_bytes());
                Ok(true)
            }
            None => Err(SnippetError::type_error(format!(
                "invalid replacement value (a {type_name})"
            ))
            .into()),
        }
    }
}

fn gsub<'lua>(
    lua: &'lua Lua,
    guard: &RunGuard,
    subject: mlua::String<'lua>,
    pattern: &[u8],
    replacement: Value<'lua>,
    max_n: Option<i64>,
) -> mlua::Result<(mlua::String<'lua>, i64)> {
    let replacement = Replacement::from_value(lua, replacement)?;
    let src = subject.as_bytes();
    let max_n = max_n.unwrap_or(src.len() as i64 + 1);
    let (anchor, pattern) = split_anchor(pattern);
    let mut matcher = Matcher::new(src, pattern, guard);
    let mut out = Vec::new();
    let mut changed = false;
    let mut count = 0i64;
    let mut at = 0;
    let mut last_match = None;
    while count < max_n {
        matcher.reset();
        match matcher.do_match(at, 0)? {
            Some(end) if Some(end) != last_match => {
                count += 1;
                changed |= replacement.apply(lua, &mut matcher, at, end, &mut out)?;
                at = end;
                last_match = Some(end);
            }
            _ if at < src.len() => {
                out.push(src[at]);
                at += 1;
            }
            _ => break,
        }
        if anchor {
            break;
        }
    }
    if !changed {
        return Ok((subject, count));
    }
    out.extend_from_slice(&src[at..]);
    Ok((lua.create_string(&out)?, count))
}

/// Replaces `find`, `match`, `gmatch` and `gsub` in the VM's `string` table,
/// which is also what the `s:find(...)` method form resolves to.
pub fn install<'lua>(lua: &'lua Lua, string: &Table<'lua>, guard: &RunGuard) -> mlua::Result<()> {
    let g = guard.clone();
    string.set(
        "find",
        lua.create_function(
            move |lua, (s, p, init, plain): (mlua::String, mlua::String, Option<i64>, Option<Value>)| {
                let plain = plain.as_ref().is_some_and(is_truthy);
                find_or_match(lua, &g, true, s.as_bytes(), p.as_bytes(), init, plain)
            },
        )?,
    )?;

    let g = guard.clone();
    string.set(
        "match",
        lua.create_function(
            move |lua, (s, p, init): (mlua::String, mlua::String, Option<i64>)| {
                find_or_match(lua, &g, false, s.as_bytes(), p.as_bytes(), init, false)
            },
        )?,
    )?;

    let g = guard.clone();
    string.set(
        "gmatch",
        lua.create_function(
            move |lua, (s, p, init): (mlua::String, mlua::String, Option<i64>)| {
                gmatch(lua, g.clone(), s.as_bytes(), p.as_bytes(), init)
            },
        )?,
    )?;

    let g = guard.clone();
    string.set(
        "gsub",
        lua.create_function(
            move |lua, (s, p, repl, n): (mlua::String, mlua::String, Value, Option<i64>)| {
                gsub(lua, &g, s, p.as_bytes(), repl, n)
            },
        )?,
    )
}
