//! `time` and `timeit`. Both block the execution thread, so every wait
//! goes through the run guard and stays interruptible.

use std::time::{Duration, Instant};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, Timelike, Utc};
use mlua::{Function, Lua, Table};

use super::ModuleContext;
use crate::sandbox::error::SnippetError;
use crate::sandbox::governor::RunGuard;

const DEFAULT_TIMEIT_NUMBER: u64 = 1000;
const DEFAULT_REPEAT: u64 = 5;

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

fn timestamp(seconds: Option<f64>) -> mlua::Result<DateTime<Utc>> {
    let seconds = seconds.unwrap_or_else(now_seconds);
    if !seconds.is_finite() {
        return Err(SnippetError::value_error("timestamp out of range").into());
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
        .ok_or_else(|| SnippetError::value_error("timestamp out of range").into())
}

pub(super) fn open_time<'lua>(lua: &'lua Lua, ctx: &ModuleContext) -> mlua::Result<Table<'lua>> {
    let time = lua.create_table()?;

    time.set("time", lua.create_function(|_, ()| Ok(now_seconds()))?)?;

    let started = ctx.started;
    let elapsed = lua.create_function(move |_, ()| Ok(started.elapsed().as_secs_f64()))?;
    time.set("monotonic", elapsed.clone())?;
    time.set("perf_counter", elapsed)?;

    let guard = ctx.guard.clone();
    time.set(
        "sleep",
        lua.create_function(move |_, seconds: f64| {
            let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
                SnippetError::value_error("sleep length must be a non-negative number")
            })?;
            guard.sleep(duration)
        })?,
    )?;

    time.set(
        "strftime",
        lua.create_function(|_, (format, seconds): (String, Option<f64>)| {
            let items: Vec<Item> = StrftimeItems::new(&format).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                return Err(SnippetError::value_error(format!("invalid format string: {format}")).into());
            }
            Ok(timestamp(seconds)?.format_with_items(items.into_iter()).to_string())
        })?,
    )?;

    time.set(
        "gmtime",
        lua.create_function(|lua, seconds: Option<f64>| {
            let at = timestamp(seconds)?;
            let parts = lua.create_table()?;
            parts.set("year", at.year())?;
            parts.set("month", at.month())?;
            parts.set("day", at.day())?;
            parts.set("hour", at.hour())?;
            parts.set("min", at.minute())?;
            parts.set("sec", at.second())?;
            parts.set("wday", at.weekday().number_from_monday())?;
            parts.set("yday", at.ordinal())?;
            Ok(parts)
        })?,
    )?;

    Ok(time)
}

fn time_calls(guard: &RunGuard, f: &Function, number: u64) -> mlua::Result<f64> {
    let start = Instant::now();
    for _ in 0..number {
        guard.checkpoint()?;
        f.call::<_, ()>(())?;
    }
    Ok(start.elapsed().as_secs_f64())
}

pub(super) fn open_timeit<'lua>(lua: &'lua Lua, ctx: &ModuleContext) -> mlua::Result<Table<'lua>> {
    let timeit = lua.create_table()?;

    let guard = ctx.guard.clone();
    timeit.set(
        "timeit",
        lua.create_function(move |_, (f, number): (Function, Option<u64>)| {
            time_calls(&guard, &f, number.unwrap_or(DEFAULT_TIMEIT_NUMBER))
        })?,
    )?;

    // `repeat` is a Lua keyword: snippets call it as timeit["repeat"](...).
    let guard = ctx.guard.clone();
    timeit.set(
        "repeat",
        lua.create_function(
            move |lua, (f, repeat, number): (Function, Option<u64>, Option<u64>)| {
                let results = lua.create_table()?;
                for i in 0..repeat.unwrap_or(DEFAULT_REPEAT) {
                    let seconds = time_calls(&guard, &f, number.unwrap_or(DEFAULT_TIMEIT_NUMBER))?;
                    results.raw_set(i + 1, seconds)?;
                }
                Ok(results)
            },
        )?,
    )?;

    let started = ctx.started;
    timeit.set(
        "default_timer",
        lua.create_function(move |_, ()| Ok(started.elapsed().as_secs_f64()))?,
    )?;

    Ok(timeit)
}
