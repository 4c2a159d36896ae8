use std::f64::consts;

use mlua::{Lua, Table, Value, Variadic};

use super::copy_table;
use crate::sandbox::error::SnippetError;
use crate::sandbox::types::ErrorKind;

fn overflow(what: &str) -> mlua::Error {
    SnippetError::new(ErrorKind::OverflowError, format!("{what} result too large")).into()
}

fn non_negative(name: &str, n: i64) -> mlua::Result<()> {
    if n < 0 {
        return Err(SnippetError::value_error(format!("{name}() not defined for negative values")).into());
    }
    Ok(())
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    a = a.unsigned_abs() as i64;
    b = b.unsigned_abs() as i64;
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn factorial(n: i64) -> Option<i64> {
    (2..=n).try_fold(1i64, |acc, k| acc.checked_mul(k))
}

fn perm(n: i64, k: i64) -> Option<i64> {
    if k > n {
        return Some(0);
    }
    // 0 <= n - k <= n, so v + 1 never exceeds n
    ((n - k)..n).try_fold(1i64, |acc, v| acc.checked_mul(v + 1))
}

fn comb(n: i64, k: i64) -> Option<i64> {
    if k > n {
        return Some(0);
    }
    let k = k.min(n - k);
    let mut acc: i128 = 1;
    for i in 0..k {
        // Exact at every step: acc is C(n, i) * (n - i) / (i + 1).
        acc = acc * i128::from(n - i) / i128::from(i + 1);
        if acc > i128::from(i64::MAX) {
            return None;
        }
    }
    Some(acc as i64)
}

fn isqrt(n: i64) -> i64 {
    let mut root = (n as f64).sqrt() as i64;
    while root.checked_mul(root).map_or(true, |sq| sq > n) {
        root -= 1;
    }
    while (root + 1).checked_mul(root + 1).is_some_and(|sq| sq <= n) {
        root += 1;
    }
    root
}

pub(super) fn open(lua: &Lua) -> mlua::Result<Table<'_>> {
    let base: Table = lua.globals().get("math")?;
    let math = copy_table(lua, &base)?;

    math.set("tau", consts::TAU)?;
    math.set("e", consts::E)?;
    math.set("inf", f64::INFINITY)?;
    math.set("nan", f64::NAN)?;

    math.set(
        "gcd",
        lua.create_function(|_, values: Variadic<i64>| {
            Ok(values.iter().fold(0, |acc, &v| gcd(acc, v)))
        })?,
    )?;
    math.set(
        "lcm",
        lua.create_function(|_, values: Variadic<i64>| {
            values.iter().try_fold(1i64, |acc, &v| {
                if acc == 0 || v == 0 {
                    return Ok(0);
                }
                (acc / gcd(acc, v))
                    .checked_mul(v.abs())
                    .ok_or_else(|| overflow("lcm"))
            })
        })?,
    )?;
    math.set(
        "factorial",
        lua.create_function(|_, n: i64| {
            non_negative("factorial", n)?;
            factorial(n).ok_or_else(|| overflow("factorial"))
        })?,
    )?;
    math.set(
        "comb",
        lua.create_function(|_, (n, k): (i64, i64)| {
            non_negative("comb", n.min(k))?;
            comb(n, k).ok_or_else(|| overflow("comb"))
        })?,
    )?;
    math.set(
        "perm",
        lua.create_function(|_, (n, k): (i64, Option<i64>)| {
            let k = k.unwrap_or(n);
            non_negative("perm", n.min(k))?;
            perm(n, k).ok_or_else(|| overflow("perm"))
        })?,
    )?;
    math.set(
        "isqrt",
        lua.create_function(|_, n: i64| {
            non_negative("isqrt", n)?;
            Ok(isqrt(n))
        })?,
    )?;
    math.set(
        "hypot",
        lua.create_function(|_, values: Variadic<f64>| {
            Ok(values.iter().map(|v| v * v).sum::<f64>().sqrt())
        })?,
    )?;
    math.set(
        "isclose",
        lua.create_function(
            |_, (a, b, rel_tol, abs_tol): (f64, f64, Option<f64>, Option<f64>)| {
                let rel_tol = rel_tol.unwrap_or(1e-9);
                let abs_tol = abs_tol.unwrap_or(0.0);
                if rel_tol < 0.0 || abs_tol < 0.0 {
                    return Err(SnippetError::value_error("tolerances must be non-negative").into());
                }
                if a == b {
                    return Ok(true);
                }
                if a.is_infinite() || b.is_infinite() {
                    return Ok(false);
                }
                let diff = (a - b).abs();
                Ok(diff <= (rel_tol * b.abs()).max(rel_tol * a.abs()) || diff <= abs_tol)
            },
        )?,
    )?;
    math.set(
        "trunc",
        lua.create_function(|_, x: f64| {
            if x.is_nan() {
                return Err(SnippetError::value_error("cannot convert float NaN to integer").into());
            }
            let t = x.trunc();
            if t < i64::MIN as f64 || t >= i64::MAX as f64 {
                return Err(overflow("trunc"));
            }
            Ok(Value::Integer(t as i64))
        })?,
    )?;
    math.set(
        "copysign",
        lua.create_function(|_, (x, y): (f64, f64)| Ok(x.copysign(y)))?,
    )?;
    math.set(
        "log2",
        lua.create_function(|_, x: f64| {
            if x <= 0.0 {
                return Err(SnippetError::value_error("math domain error").into());
            }
            Ok(x.log2())
        })?,
    )?;
    math.set(
        "log10",
        lua.create_function(|_, x: f64| {
            if x <= 0.0 {
                return Err(SnippetError::value_error("math domain error").into());
            }
            Ok(x.log10())
        })?,
    )?;
    math.set("isnan", lua.create_function(|_, x: f64| Ok(x.is_nan()))?)?;
    math.set("isinf", lua.create_function(|_, x: f64| Ok(x.is_infinite()))?)?;
    math.set("isfinite", lua.create_function(|_, x: f64| Ok(x.is_finite()))?)?;
    math.set("degrees", lua.create_function(|_, x: f64| Ok(x.to_degrees()))?)?;
    math.set("radians", lua.create_function(|_, x: f64| Ok(x.to_radians()))?)?;

    Ok(math)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::error::{classify, Classified};
    use crate::sandbox::modules::testing::lua_with;
    use crate::sandbox::modules::ModuleName;

    #[test]
    fn test_integer_helpers() {
        assert_eq!(gcd(12, -18), 6);
        assert_eq!(factorial(0), Some(1));
        assert_eq!(factorial(20), Some(2_432_902_008_176_640_000));
        assert_eq!(factorial(21), None);
        assert_eq!(comb(5, 2), Some(10));
        assert_eq!(comb(2, 5), Some(0));
        assert_eq!(perm(5, 2), Some(20));
        assert_eq!(perm(i64::MAX, 0), Some(1));
        assert_eq!(perm(i64::MAX, 1), Some(i64::MAX));
        assert_eq!(perm(i64::MAX, 2), None);
        assert_eq!(isqrt(15), 3);
        assert_eq!(isqrt(16), 4);
        assert_eq!(isqrt(i64::MAX), 3_037_000_499);
    }

    #[test]
    fn test_module_functions() {
        let lua = lua_with(ModuleName::Math);
        let (g, l, h, t): (i64, i64, f64, i64) = lua
            .load("return math.gcd(12, 18, 27), math.lcm(4, 6), math.hypot(3, 4), math.trunc(-2.7)")
            .eval()
            .unwrap();
        assert_eq!((g, l, h, t), (3, 12, 5.0, -2));

        let floor: i64 = lua.load("return math.floor(2.5)").eval().unwrap();
        assert_eq!(floor, 2);
        assert!(lua.load("return math.isclose(0.1 + 0.2, 0.3)").eval::<bool>().unwrap());
    }

    #[test]
    fn test_factorial_overflow_and_domain() {
        let lua = lua_with(ModuleName::Math);
        let err = lua.load("return math.factorial(25)").eval::<i64>().unwrap_err();
        assert!(matches!(classify(&err), Classified::Failure(ErrorKind::OverflowError, _)));
        let err = lua.load("return math.factorial(-1)").eval::<i64>().unwrap_err();
        assert!(matches!(classify(&err), Classified::Failure(ErrorKind::ValueError, _)));
    }

    #[test]
    fn test_perm_at_integer_bounds() {
        let lua = lua_with(ModuleName::Math);
        let one: i64 = lua.load("return math.perm(math.maxinteger, 0)").eval().unwrap();
        assert_eq!(one, 1);
        let err = lua
            .load("return math.perm(math.maxinteger, 2)")
            .eval::<i64>()
            .unwrap_err();
        assert!(matches!(classify(&err), Classified::Failure(ErrorKind::OverflowError, _)));
    }
}
