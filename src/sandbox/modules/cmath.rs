//! Complex numbers as userdata with arithmetic metamethods. Plain Lua
//! numbers are accepted anywhere a complex is expected.

use std::f64::consts;
use std::fmt;

use mlua::{Lua, MetaMethod, Table, UserData, UserDataFields, UserDataMethods, Value};

use crate::sandbox::error::SnippetError;
use crate::sandbox::types::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    fn abs(self) -> f64 {
        self.re.hypot(self.im)
    }

    fn phase(self) -> f64 {
        self.im.atan2(self.re)
    }

    fn from_polar(r: f64, phi: f64) -> Self {
        Self::new(r * phi.cos(), r * phi.sin())
    }

    fn add(self, o: Self) -> Self {
        Self::new(self.re + o.re, self.im + o.im)
    }

    fn sub(self, o: Self) -> Self {
        Self::new(self.re - o.re, self.im - o.im)
    }

    fn mul(self, o: Self) -> Self {
        Self::new(
            self.re * o.re - self.im * o.im,
            self.re * o.im + self.im * o.re,
        )
    }

    fn div(self, o: Self) -> Result<Self, SnippetError> {
        let denom = o.re * o.re + o.im * o.im;
        if denom == 0.0 {
            return Err(SnippetError::new(
                ErrorKind::ZeroDivisionError,
                "complex division by zero",
            ));
        }
        Ok(Self::new(
            (self.re * o.re + self.im * o.im) / denom,
            (self.im * o.re - self.re * o.im) / denom,
        ))
    }

    fn exp(self) -> Self {
        Self::from_polar(self.re.exp(), self.im)
    }

    fn ln(self) -> Result<Self, SnippetError> {
        if self.re == 0.0 && self.im == 0.0 {
            return Err(SnippetError::value_error("math domain error"));
        }
        Ok(Self::new(self.abs().ln(), self.phase()))
    }

    fn sqrt(self) -> Self {
        if self.re == 0.0 && self.im == 0.0 {
            return Self::new(0.0, self.im);
        }
        let t = ((self.re.abs() + self.abs()) / 2.0).sqrt();
        if self.re >= 0.0 {
            Self::new(t, self.im / (2.0 * t))
        } else {
            Self::new(self.im.abs() / (2.0 * t), t.copysign(self.im))
        }
    }

    fn pow(self, exponent: Self) -> Result<Self, SnippetError> {
        if self.re == 0.0 && self.im == 0.0 {
            if exponent.re == 0.0 && exponent.im == 0.0 {
                return Ok(Self::new(1.0, 0.0));
            }
            if exponent.im != 0.0 || exponent.re < 0.0 {
                return Err(SnippetError::new(
                    ErrorKind::ZeroDivisionError,
                    "0.0 to a negative or complex power",
                ));
            }
            return Ok(Self::new(0.0, 0.0));
        }
        Ok(exponent.mul(self.ln()?).exp())
    }

    fn sin(self) -> Self {
        Self::new(
            self.re.sin() * self.im.cosh(),
            self.re.cos() * self.im.sinh(),
        )
    }

    fn cos(self) -> Self {
        Self::new(
            self.re.cos() * self.im.cosh(),
            -self.re.sin() * self.im.sinh(),
        )
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.re == 0.0 && self.re.is_sign_positive() {
            write!(f, "{}j", self.im)
        } else if self.im.is_sign_negative() {
            write!(f, "({}-{}j)", self.re, -self.im)
        } else {
            write!(f, "({}+{}j)", self.re, self.im)
        }
    }
}

/// Coerces a Lua value into a complex number.
fn to_complex(value: &Value) -> mlua::Result<Complex> {
    match value {
        Value::Integer(i) => Ok(Complex::new(*i as f64, 0.0)),
        Value::Number(n) => Ok(Complex::new(*n, 0.0)),
        Value::UserData(ud) => match ud.borrow::<Complex>() {
            Ok(z) => Ok(*z),
            Err(_) => Err(SnippetError::type_error("expected a complex or a number").into()),
        },
        other => Err(SnippetError::type_error(format!(
            "expected a complex or a number, got {}",
            other.type_name()
        ))
        .into()),
    }
}

impl UserData for Complex {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("re", |_, this| Ok(this.re));
        fields.add_field_method_get("im", |_, this| Ok(this.im));
        fields.add_field_method_get("real", |_, this| Ok(this.re));
        fields.add_field_method_get("imag", |_, this| Ok(this.im));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("conjugate", |_, this, ()| Ok(Complex::new(this.re, -this.im)));

        methods.add_meta_function(MetaMethod::Add, |_, (a, b): (Value, Value)| {
            Ok(to_complex(&a)?.add(to_complex(&b)?))
        });
        methods.add_meta_function(MetaMethod::Sub, |_, (a, b): (Value, Value)| {
            Ok(to_complex(&a)?.sub(to_complex(&b)?))
        });
        methods.add_meta_function(MetaMethod::Mul, |_, (a, b): (Value, Value)| {
            Ok(to_complex(&a)?.mul(to_complex(&b)?))
        });
        methods.add_meta_function(MetaMethod::Div, |_, (a, b): (Value, Value)| {
            Ok(to_complex(&a)?.div(to_complex(&b)?)?)
        });
        methods.add_meta_function(MetaMethod::Pow, |_, (a, b): (Value, Value)| {
            Ok(to_complex(&a)?.pow(to_complex(&b)?)?)
        });
        methods.add_meta_method(MetaMethod::Unm, |_, this, ()| {
            Ok(Complex::new(-this.re, -this.im))
        });
        methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (Value, Value)| {
            Ok(to_complex(&a)? == to_complex(&b)?)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.to_string()));
    }
}

pub(super) fn open(lua: &Lua) -> mlua::Result<Table<'_>> {
    let cmath = lua.create_table()?;

    cmath.set("pi", consts::PI)?;
    cmath.set("e", consts::E)?;
    cmath.set("tau", consts::TAU)?;
    cmath.set("inf", f64::INFINITY)?;
    cmath.set("nan", f64::NAN)?;
    cmath.set("j", Complex::new(0.0, 1.0))?;

    cmath.set(
        "complex",
        lua.create_function(|_, (re, im): (Value, Option<f64>)| {
            let base = to_complex(&re)?;
            Ok(Complex::new(base.re, base.im + im.unwrap_or(0.0)))
        })?,
    )?;
    cmath.set(
        "abs",
        lua.create_function(|_, z: Value| Ok(to_complex(&z)?.abs()))?,
    )?;
    cmath.set(
        "phase",
        lua.create_function(|_, z: Value| Ok(to_complex(&z)?.phase()))?,
    )?;
    cmath.set(
        "polar",
        lua.create_function(|_, z: Value| {
            let z = to_complex(&z)?;
            Ok((z.abs(), z.phase()))
        })?,
    )?;
    cmath.set(
        "rect",
        lua.create_function(|_, (r, phi): (f64, f64)| Ok(Complex::from_polar(r, phi)))?,
    )?;
    cmath.set(
        "conjugate",
        lua.create_function(|_, z: Value| {
            let z = to_complex(&z)?;
            Ok(Complex::new(z.re, -z.im))
        })?,
    )?;
    cmath.set(
        "sqrt",
        lua.create_function(|_, z: Value| Ok(to_complex(&z)?.sqrt()))?,
    )?;
    cmath.set(
        "exp",
        lua.create_function(|_, z: Value| Ok(to_complex(&z)?.exp()))?,
    )?;
    cmath.set(
        "log",
        lua.create_function(|_, (z, base): (Value, Option<Value>)| {
            let ln = to_complex(&z)?.ln()?;
            match base {
                Some(base) => Ok(ln.div(to_complex(&base)?.ln()?)?),
                None => Ok(ln),
            }
        })?,
    )?;
    cmath.set(
        "sin",
        lua.create_function(|_, z: Value| Ok(to_complex(&z)?.sin()))?,
    )?;
    cmath.set(
        "cos",
        lua.create_function(|_, z: Value| Ok(to_complex(&z)?.cos()))?,
    )?;
    cmath.set(
        "tan",
        lua.create_function(|_, z: Value| {
            let z = to_complex(&z)?;
            Ok(z.sin().div(z.cos())?)
        })?,
    )?;

    Ok(cmath)
}
