//! 2-D drawing surface exposed to snippets as `graphics`.
//!
//! Pixel data lives on the Rust heap, outside the Lua allocator limit, so
//! every surface holds a lease on a per-request [`PixelBudget`]. The lease is
//! released when the surface is collected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{
    AnyUserData, Lua, MetaMethod, Table, UserData, UserDataFields, UserDataMethods, Value,
};

use super::ModuleContext;
use crate::sandbox::error::SnippetError;
use crate::sandbox::pixels::{PixelBuffer, Rgba};
use crate::sandbox::types::ErrorKind;

/// Drawing coordinates beyond this magnitude are rejected.
const MAX_COORD: i64 = 1 << 15;
const MAX_LINE_WIDTH: i64 = 64;

/// Byte allowance shared by all surfaces of one request.
#[derive(Debug, Clone)]
pub struct PixelBudget {
    limit: u64,
    used: Arc<AtomicU64>,
}

impl PixelBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .is_ok()
    }

    /// Reserves `bytes`, running a full collection once to reclaim
    /// unreachable surfaces before giving up.
    pub fn reserve(&self, lua: &Lua, bytes: u64) -> mlua::Result<BudgetLease> {
        if !self.try_reserve(bytes) {
            lua.gc_collect()?;
            if !self.try_reserve(bytes) {
                return Err(SnippetError::new(
                    ErrorKind::MemoryError,
                    format!("surface memory exhausted ({} byte limit)", self.limit),
                )
                .into());
            }
        }
        Ok(BudgetLease {
            bytes,
            used: self.used.clone(),
        })
    }
}

#[derive(Debug)]
pub struct BudgetLease {
    bytes: u64,
    used: Arc<AtomicU64>,
}

impl Drop for BudgetLease {
    fn drop(&mut self) {
        self.used.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

pub struct Surface {
    buffer: PixelBuffer,
    _lease: BudgetLease,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Surface({}x{})>", self.buffer.width(), self.buffer.height())
    }
}

impl Surface {
    pub fn allocate(
        lua: &Lua,
        budget: &PixelBudget,
        width: i64,
        height: i64,
        fill: Rgba,
    ) -> mlua::Result<Self> {
        if !(1..=2048).contains(&width) || !(1..=2048).contains(&height) {
            return Err(SnippetError::value_error(format!(
                "invalid surface size {width}x{height} (each side must be 1..=2048 pixels)"
            ))
            .into());
        }
        let lease = budget.reserve(lua, (width * height * 4) as u64)?;
        let buffer = PixelBuffer::new(width, height, fill)
            .map_err(|e| SnippetError::value_error(e.to_string()))?;
        Ok(Self {
            buffer,
            _lease: lease,
        })
    }

    /// Wraps a copy of `buffer` in a new surface charged to `budget`.
    pub fn from_buffer(lua: &Lua, budget: &PixelBudget, buffer: PixelBuffer) -> mlua::Result<Self> {
        let lease = budget.reserve(lua, buffer.byte_len() as u64)?;
        Ok(Self {
            buffer,
            _lease: lease,
        })
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }
}

/// Copies the pixels out of a `Surface` value, or fails with `TypeError`.
pub fn surface_pixels(value: &Value) -> mlua::Result<PixelBuffer> {
    let not_a_surface = || -> mlua::Error {
        SnippetError::type_error(format!(
            "expected a graphics.Surface, got {}",
            value.type_name()
        ))
        .into()
    };
    match value {
        Value::UserData(ud) => match ud.borrow::<Surface>() {
            Ok(surface) => Ok(surface.buffer.clone()),
            Err(_) => Err(not_a_surface()),
        },
        _ => Err(not_a_surface()),
    }
}

fn named_color(name: &str) -> Option<Rgba> {
    let color = match name.to_ascii_lowercase().as_str() {
        "black" => Rgba::new(0, 0, 0, 255),
        "white" => Rgba::new(255, 255, 255, 255),
        "red" => Rgba::new(255, 0, 0, 255),
        "green" => Rgba::new(0, 255, 0, 255),
        "blue" => Rgba::new(0, 0, 255, 255),
        "yellow" => Rgba::new(255, 255, 0, 255),
        "cyan" => Rgba::new(0, 255, 255, 255),
        "magenta" => Rgba::new(255, 0, 255, 255),
        "gray" | "grey" => Rgba::new(128, 128, 128, 255),
        "orange" => Rgba::new(255, 165, 0, 255),
        "purple" => Rgba::new(128, 0, 128, 255),
        "transparent" => Rgba::TRANSPARENT,
        _ => return None,
    };
    Some(color)
}

fn hex_color(text: &str) -> Option<Rgba> {
    let hex = text.strip_prefix('#')?;
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    let alpha = if hex.len() == 8 { channel(6)? } else { 255 };
    Some(Rgba::new(channel(0)?, channel(2)?, channel(4)?, alpha))
}

fn channel(value: Value) -> mlua::Result<Option<u8>> {
    let n = match value {
        Value::Nil => return Ok(None),
        Value::Integer(i) => i,
        Value::Number(n) if n.fract() == 0.0 => n as i64,
        _ => return Err(SnippetError::value_error("invalid color argument").into()),
    };
    u8::try_from(n)
        .map(Some)
        .map_err(|_| SnippetError::value_error("color components must be in 0..=255").into())
}

/// Accepts `{r, g, b[, a]}`, `{r=, g=, b=[, a=]}`, `"#rrggbb[aa]"` or a
/// colour name.
pub fn parse_color(value: &Value) -> mlua::Result<Rgba> {
    match value {
        Value::String(s) => {
            let text = s.to_str()?;
            hex_color(text)
                .or_else(|| named_color(text))
                .ok_or_else(|| SnippetError::value_error(format!("invalid color name '{text}'")).into())
        }
        Value::Table(t) => {
            let pick = |index: i64, key: &str| -> mlua::Result<Option<u8>> {
                match channel(t.raw_get(index)?)? {
                    Some(v) => Ok(Some(v)),
                    None => channel(t.raw_get(key)?),
                }
            };
            let (Some(r), Some(g), Some(b)) = (pick(1, "r")?, pick(2, "g")?, pick(3, "b")?) else {
                return Err(SnippetError::value_error("invalid color argument").into());
            };
            Ok(Rgba::new(r, g, b, pick(4, "a")?.unwrap_or(255)))
        }
        other => Err(SnippetError::type_error(format!(
            "invalid color argument of type {}",
            other.type_name()
        ))
        .into()),
    }
}

fn color_table<'lua>(lua: &'lua Lua, color: Rgba) -> mlua::Result<Table<'lua>> {
    let t = lua.create_table()?;
    for (i, (key, v)) in [("r", color.r), ("g", color.g), ("b", color.b), ("a", color.a)]
        .into_iter()
        .enumerate()
    {
        t.raw_set(key, v)?;
        t.raw_set(i + 1, v)?;
    }
    Ok(t)
}

fn coord(value: i64) -> mlua::Result<i64> {
    if value.unsigned_abs() > MAX_COORD.unsigned_abs() {
        return Err(SnippetError::value_error(format!(
            "coordinate {value} out of range (limit {MAX_COORD})"
        ))
        .into());
    }
    Ok(value)
}

fn parse_point(value: Value) -> mlua::Result<(i64, i64)> {
    let Value::Table(t) = value else {
        return Err(SnippetError::type_error("points must be {x, y} tables").into());
    };
    let x: Option<i64> = t.raw_get(1)?;
    let y: Option<i64> = t.raw_get(2)?;
    let (x, y) = match (x, y) {
        (Some(x), Some(y)) => (x, y),
        _ => (t.raw_get("x")?, t.raw_get("y")?),
    };
    Ok((coord(x)?, coord(y)?))
}

pub(crate) fn draw_line(buf: &mut PixelBuffer, color: Rgba, from: (i64, i64), to: (i64, i64), width: i64) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    let half = (width - 1) / 2;
    loop {
        if width <= 1 {
            buf.set(x, y, color);
        } else {
            buf.fill_rect(x - half, y - half, width, width, color);
        }
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Filled disc when `width` is 0, otherwise a ring `width` pixels thick.
pub(crate) fn draw_circle(buf: &mut PixelBuffer, color: Rgba, center: (i64, i64), radius: i64, width: i64) {
    let (cx, cy) = center;
    let outer = radius * radius;
    let inner = if width > 0 && width < radius {
        (radius - width) * (radius - width)
    } else {
        -1
    };
    let x0 = (cx - radius).max(0);
    let x1 = (cx + radius).min(i64::from(buf.width()) - 1);
    let y0 = (cy - radius).max(0);
    let y1 = (cy + radius).min(i64::from(buf.height()) - 1);
    for y in y0..=y1 {
        for x in x0..=x1 {
            let d2 = (x - cx) * (x - cx) + (y - cy) * (y - cy);
            if d2 <= outer && d2 > inner {
                buf.set(x, y, color);
            }
        }
    }
}

/// Even-odd scanline fill.
pub(crate) fn fill_polygon(buf: &mut PixelBuffer, color: Rgba, points: &[(i64, i64)]) {
    if points.len() < 3 {
        return;
    }
    let min_y = points.iter().map(|p| p.1).min().unwrap_or(0).max(0);
    let max_y = points
        .iter()
        .map(|p| p.1)
        .max()
        .unwrap_or(0)
        .min(i64::from(buf.height()) - 1);
    let mut crossings = Vec::new();
    for y in min_y..=max_y {
        crossings.clear();
        let scan = y as f64 + 0.5;
        for (i, &(ax, ay)) in points.iter().enumerate() {
            let (bx, by) = points[(i + 1) % points.len()];
            let (ay_f, by_f) = (ay as f64, by as f64);
            if (ay_f <= scan && by_f > scan) || (by_f <= scan && ay_f > scan) {
                let t = (scan - ay_f) / (by_f - ay_f);
                crossings.push(ax as f64 + t * (bx - ax) as f64);
            }
        }
        crossings.sort_by(f64::total_cmp);
        for pair in crossings.chunks_exact(2) {
            let start = pair[0].round() as i64;
            let end = pair[1].round() as i64;
            buf.fill_rect(start, y, end - start, 1, color);
        }
    }
}

impl UserData for Surface {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("width", |_, this| Ok(this.buffer.width()));
        fields.add_field_method_get("height", |_, this| Ok(this.buffer.height()));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("get_size", |_, this, ()| {
            Ok((this.buffer.width(), this.buffer.height()))
        });
        methods.add_method("get_width", |_, this, ()| Ok(this.buffer.width()));
        methods.add_method("get_height", |_, this, ()| Ok(this.buffer.height()));

        methods.add_method_mut("fill", |_, this, color: Value| {
            this.buffer.fill(parse_color(&color)?);
            Ok(())
        });
        methods.add_method_mut("set_at", |_, this, (x, y, color): (i64, i64, Value)| {
            this.buffer.set(x, y, parse_color(&color)?);
            Ok(())
        });
        methods.add_method("get_at", |lua, this, (x, y): (i64, i64)| {
            match this.buffer.get(x, y) {
                Some(color) => color_table(lua, color),
                None => Err(SnippetError::new(ErrorKind::IndexError, "pixel index out of range").into()),
            }
        });

        // Source pixels are copied first, so a surface can blit onto itself.
        methods.add_function(
            "blit",
            |_, (this, source, x, y): (AnyUserData, Value, Option<i64>, Option<i64>)| {
                let pixels = surface_pixels(&source)?;
                let mut this = this.borrow_mut::<Surface>()?;
                let (x, y) = (coord(x.unwrap_or(0))?, coord(y.unwrap_or(0))?);
                this.buffer.blit(&pixels, x, y);
                Ok(())
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(format!("{this:?}")));
    }
}

pub(super) fn open<'lua>(lua: &'lua Lua, ctx: &ModuleContext) -> mlua::Result<Table<'lua>> {
    let graphics = lua.create_table()?;

    let budget = ctx.pixels.clone();
    graphics.set(
        "Surface",
        lua.create_function(move |lua, (width, height, color): (i64, i64, Option<Value>)| {
            let fill = match color {
                Some(color) => parse_color(&color)?,
                None => Rgba::BLACK,
            };
            Surface::allocate(lua, &budget, width, height, fill)
        })?,
    )?;

    let budget = ctx.pixels.clone();
    graphics.set(
        "copy",
        lua.create_function(move |lua, source: Value| {
            Surface::from_buffer(lua, &budget, surface_pixels(&source)?)
        })?,
    )?;

    graphics.set(
        "Color",
        lua.create_function(|lua, args: mlua::MultiValue| {
            let mut args = args.into_iter();
            let first = args.next().unwrap_or(Value::Nil);
            let color = match first {
                Value::Integer(_) | Value::Number(_) => {
                    let channels = lua.create_sequence_from(std::iter::once(first).chain(args))?;
                    parse_color(&Value::Table(channels))?
                }
                other => parse_color(&other)?,
            };
            color_table(lua, color)
        })?,
    )?;

    let draw = lua.create_table()?;
    draw.set(
        "rect",
        lua.create_function(
            |_, (surface, color, x, y, w, h): (AnyUserData, Value, i64, i64, i64, i64)| {
                let color = parse_color(&color)?;
                let mut surface = surface.borrow_mut::<Surface>()?;
                surface.buffer.fill_rect(coord(x)?, coord(y)?, coord(w)?, coord(h)?, color);
                Ok(())
            },
        )?,
    )?;
    draw.set(
        "line",
        lua.create_function(
            |_,
             (surface, color, x0, y0, x1, y1, width): (
                AnyUserData,
                Value,
                i64,
                i64,
                i64,
                i64,
                Option<i64>,
            )| {
                let color = parse_color(&color)?;
                let width = width.unwrap_or(1);
                if !(1..=MAX_LINE_WIDTH).contains(&width) {
                    return Err(SnippetError::value_error(format!(
                        "line width must be in 1..={MAX_LINE_WIDTH}"
                    ))
                    .into());
                }
                let from = (coord(x0)?, coord(y0)?);
                let to = (coord(x1)?, coord(y1)?);
                let mut surface = surface.borrow_mut::<Surface>()?;
                draw_line(&mut surface.buffer, color, from, to, width);
                Ok(())
            },
        )?,
    )?;
    draw.set(
        "circle",
        lua.create_function(
            |_,
             (surface, color, cx, cy, radius, width): (
                AnyUserData,
                Value,
                i64,
                i64,
                i64,
                Option<i64>,
            )| {
                let color = parse_color(&color)?;
                if radius < 0 {
                    return Err(SnippetError::value_error("radius must be non-negative").into());
                }
                let center = (coord(cx)?, coord(cy)?);
                let radius = coord(radius)?;
                let mut surface = surface.borrow_mut::<Surface>()?;
                draw_circle(&mut surface.buffer, color, center, radius, width.unwrap_or(0).max(0));
                Ok(())
            },
        )?,
    )?;
    draw.set(
        "polygon",
        lua.create_function(|_, (surface, color, points): (AnyUserData, Value, Table)| {
            let color = parse_color(&color)?;
            let mut parsed = Vec::new();
            for point in points.sequence_values::<Value>() {
                parsed.push(parse_point(point?)?);
            }
            let mut surface = surface.borrow_mut::<Surface>()?;
            fill_polygon(&mut surface.buffer, color, &parsed);
            Ok(())
        })?,
    )?;
    graphics.set("draw", draw)?;

    Ok(graphics)
}
