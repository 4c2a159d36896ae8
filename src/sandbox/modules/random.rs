use std::sync::{Arc, Mutex, PoisonError};

use mlua::{Lua, Table, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sandbox::error::SnippetError;
use crate::sandbox::types::ErrorKind;

type SharedRng = Arc<Mutex<StdRng>>;

fn with_rng<T>(rng: &SharedRng, f: impl FnOnce(&mut StdRng) -> T) -> T {
    let mut guard = rng.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

fn sequence_len(table: &Table) -> usize {
    table.raw_len()
}

pub(super) fn open(lua: &Lua) -> mlua::Result<Table<'_>> {
    let random = lua.create_table()?;
    let rng: SharedRng = Arc::new(Mutex::new(StdRng::from_entropy()));

    let r = rng.clone();
    random.set(
        "seed",
        lua.create_function(move |_, seed: Option<i64>| {
            let fresh = match seed {
                Some(seed) => StdRng::seed_from_u64(seed as u64),
                None => StdRng::from_entropy(),
            };
            with_rng(&r, |rng| *rng = fresh);
            Ok(())
        })?,
    )?;

    let r = rng.clone();
    random.set(
        "random",
        lua.create_function(move |_, ()| Ok(with_rng(&r, |rng| rng.gen::<f64>())))?,
    )?;

    let r = rng.clone();
    random.set(
        "uniform",
        lua.create_function(move |_, (a, b): (f64, f64)| {
            Ok(a + (b - a) * with_rng(&r, |rng| rng.gen::<f64>()))
        })?,
    )?;

    let r = rng.clone();
    random.set(
        "randint",
        lua.create_function(move |_, (a, b): (i64, i64)| {
            if a > b {
                return Err(SnippetError::value_error(format!(
                    "empty range for randint({a}, {b})"
                ))
                .into());
            }
            Ok(with_rng(&r, |rng| rng.gen_range(a..=b)))
        })?,
    )?;

    let r = rng.clone();
    random.set(
        "choice",
        lua.create_function(move |_, seq: Table| {
            let len = sequence_len(&seq);
            if len == 0 {
                return Err(SnippetError::new(
                    ErrorKind::IndexError,
                    "cannot choose from an empty sequence",
                )
                .into());
            }
            let index = with_rng(&r, |rng| rng.gen_range(1..=len));
            seq.raw_get::<_, Value>(index)
        })?,
    )?;

    let r = rng.clone();
    random.set(
        "shuffle",
        lua.create_function(move |_, seq: Table| {
            let len = sequence_len(&seq);
            for i in (2..=len).rev() {
                let j = with_rng(&r, |rng| rng.gen_range(1..=i));
                let a: Value = seq.raw_get(i)?;
                let b: Value = seq.raw_get(j)?;
                seq.raw_set(i, b)?;
                seq.raw_set(j, a)?;
            }
            Ok(())
        })?,
    )?;

    let r = rng.clone();
    random.set(
        "sample",
        lua.create_function(move |lua, (seq, k): (Table, i64)| {
            let len = sequence_len(&seq);
            if k < 0 || k as usize > len {
                return Err(SnippetError::value_error(
                    "sample larger than population or is negative",
                )
                .into());
            }
            let picked = with_rng(&r, |rng| rand::seq::index::sample(rng, len, k as usize));
            let out = lua.create_table()?;
            for (slot, index) in picked.into_iter().enumerate() {
                out.raw_set(slot + 1, seq.raw_get::<_, Value>(index + 1)?)?;
            }
            Ok(out)
        })?,
    )?;

    let r = rng;
    random.set(
        "gauss",
        lua.create_function(move |_, (mu, sigma): (Option<f64>, Option<f64>)| {
            let (u1, u2) = with_rng(&r, |rng| (rng.gen::<f64>(), rng.gen::<f64>()));
            // Box-Muller; 1 - u1 keeps the logarithm finite.
            let z = (-2.0 * (1.0 - u1).ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
            Ok(mu.unwrap_or(0.0) + sigma.unwrap_or(1.0) * z)
        })?,
    )?;

    Ok(random)
}
