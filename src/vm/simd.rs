//! 128-bit vector operations. A `v128` is a `u128` in little-endian lane
//! order; lane views are produced on demand and ops are expressed as lane
//! maps/zips generated per shape.

use crate::ast::instr::{
    FShape, Half, IShape, RelaxedOp, Shape, Sign, VCvtOp, VFBinOp, VFRelOp, VFUnOp, VIBinOp,
    VIRelOp, VIUnOp, VShiftOp,
};
use crate::error::Trap;
use crate::runtime::Value;
use crate::vm::numeric::{fmax32, fmax64, fmin32, fmin64, fnearest32, fnearest64};

// ===== lane views =====

macro_rules! lanes_impl {
    ($to:ident, $from:ident, $t:ty, $n:expr, $sz:expr) => {
        pub fn $to(v: u128) -> [$t; $n] {
            let b = v.to_le_bytes();
            let mut out = [<$t>::from_le_bytes([0; $sz]); $n];
            for i in 0..$n {
                let mut c = [0u8; $sz];
                c.copy_from_slice(&b[i * $sz..(i + 1) * $sz]);
                out[i] = <$t>::from_le_bytes(c);
            }
            out
        }

        pub fn $from(l: [$t; $n]) -> u128 {
            let mut b = [0u8; 16];
            for i in 0..$n {
                b[i * $sz..(i + 1) * $sz].copy_from_slice(&l[i].to_le_bytes());
            }
            u128::from_le_bytes(b)
        }
    };
}

lanes_impl!(to_i8x16, from_i8x16, i8, 16, 1);
lanes_impl!(to_u8x16, from_u8x16, u8, 16, 1);
lanes_impl!(to_i16x8, from_i16x8, i16, 8, 2);
lanes_impl!(to_u16x8, from_u16x8, u16, 8, 2);
lanes_impl!(to_i32x4, from_i32x4, i32, 4, 4);
lanes_impl!(to_u32x4, from_u32x4, u32, 4, 4);
lanes_impl!(to_i64x2, from_i64x2, i64, 2, 8);
lanes_impl!(to_u64x2, from_u64x2, u64, 2, 8);
lanes_impl!(to_f32x4, from_f32x4, f32, 4, 4);
lanes_impl!(to_f64x2, from_f64x2, f64, 2, 8);

macro_rules! map {
    ($to:ident, $from:ident, $a:expr, $f:expr) => {{
        let mut x = $to($a);
        for lane in x.iter_mut() {
            *lane = $f(*lane);
        }
        $from(x)
    }};
}

macro_rules! zip {
    ($to:ident, $from:ident, $a:expr, $b:expr, $f:expr) => {{
        let x = $to($a);
        let y = $to($b);
        let mut out = x;
        for i in 0..out.len() {
            out[i] = $f(x[i], y[i]);
        }
        $from(out)
    }};
}

/// Dispatch a per-shape macro over the four integer shapes, handing it the
/// signed/unsigned lane views and lane types.
macro_rules! int_shapes {
    ($shape:expr, $mac:ident, $($args:tt)*) => {
        match $shape {
            IShape::I8x16 => $mac!(to_i8x16, from_i8x16, to_u8x16, from_u8x16, i8, u8, $($args)*),
            IShape::I16x8 => $mac!(to_i16x8, from_i16x8, to_u16x8, from_u16x8, i16, u16, $($args)*),
            IShape::I32x4 => $mac!(to_i32x4, from_i32x4, to_u32x4, from_u32x4, i32, u32, $($args)*),
            IShape::I64x2 => $mac!(to_i64x2, from_i64x2, to_u64x2, from_u64x2, i64, u64, $($args)*),
        }
    };
}

// ===== integer lane ops =====

macro_rules! do_viunop {
    ($ts:ident, $fs:ident, $tu:ident, $fu:ident, $t:ty, $u:ty, $op:expr, $a:expr) => {{
        match $op {
            VIUnOp::Abs => map!($ts, $fs, $a, |x: $t| x.wrapping_abs()),
            VIUnOp::Neg => map!($ts, $fs, $a, |x: $t| x.wrapping_neg()),
            VIUnOp::Popcnt => map!($tu, $fu, $a, |x: $u| x.count_ones() as $u),
        }
    }};
}

pub fn viunop(shape: IShape, op: VIUnOp, a: u128) -> u128 {
    int_shapes!(shape, do_viunop, op, a)
}

macro_rules! do_vibinop {
    ($ts:ident, $fs:ident, $tu:ident, $fu:ident, $t:ty, $u:ty, $op:expr, $a:expr, $b:expr) => {{
        match $op {
            VIBinOp::Add => zip!($ts, $fs, $a, $b, |x: $t, y: $t| x.wrapping_add(y)),
            VIBinOp::Sub => zip!($ts, $fs, $a, $b, |x: $t, y: $t| x.wrapping_sub(y)),
            VIBinOp::Mul => zip!($ts, $fs, $a, $b, |x: $t, y: $t| x.wrapping_mul(y)),
            VIBinOp::AddSat { sign: Sign::S } => {
                zip!($ts, $fs, $a, $b, |x: $t, y: $t| x.saturating_add(y))
            }
            VIBinOp::AddSat { sign: Sign::U } => {
                zip!($tu, $fu, $a, $b, |x: $u, y: $u| x.saturating_add(y))
            }
            VIBinOp::SubSat { sign: Sign::S } => {
                zip!($ts, $fs, $a, $b, |x: $t, y: $t| x.saturating_sub(y))
            }
            VIBinOp::SubSat { sign: Sign::U } => {
                zip!($tu, $fu, $a, $b, |x: $u, y: $u| x.saturating_sub(y))
            }
            VIBinOp::Min { sign: Sign::S } => zip!($ts, $fs, $a, $b, |x: $t, y: $t| x.min(y)),
            VIBinOp::Min { sign: Sign::U } => zip!($tu, $fu, $a, $b, |x: $u, y: $u| x.min(y)),
            VIBinOp::Max { sign: Sign::S } => zip!($ts, $fs, $a, $b, |x: $t, y: $t| x.max(y)),
            VIBinOp::Max { sign: Sign::U } => zip!($tu, $fu, $a, $b, |x: $u, y: $u| x.max(y)),
            VIBinOp::AvgrU => zip!($tu, $fu, $a, $b, |x: $u, y: $u| {
                ((x as u64 + y as u64 + 1) / 2) as $u
            }),
        }
    }};
}

pub fn vibinop(shape: IShape, op: VIBinOp, a: u128, b: u128) -> u128 {
    int_shapes!(shape, do_vibinop, op, a, b)
}

macro_rules! do_virelop {
    ($ts:ident, $fs:ident, $tu:ident, $fu:ident, $t:ty, $u:ty, $op:expr, $a:expr, $b:expr) => {{
        match $op {
            VIRelOp::Eq => zip!($tu, $fu, $a, $b, |x: $u, y: $u| if x == y { <$u>::MAX } else { 0 }),
            VIRelOp::Ne => zip!($tu, $fu, $a, $b, |x: $u, y: $u| if x != y { <$u>::MAX } else { 0 }),
            VIRelOp::Lt { sign: Sign::S } => {
                zip!($ts, $fs, $a, $b, |x: $t, y: $t| if x < y { -1 } else { 0 })
            }
            VIRelOp::Lt { sign: Sign::U } => {
                zip!($tu, $fu, $a, $b, |x: $u, y: $u| if x < y { <$u>::MAX } else { 0 })
            }
            VIRelOp::Gt { sign: Sign::S } => {
                zip!($ts, $fs, $a, $b, |x: $t, y: $t| if x > y { -1 } else { 0 })
            }
            VIRelOp::Gt { sign: Sign::U } => {
                zip!($tu, $fu, $a, $b, |x: $u, y: $u| if x > y { <$u>::MAX } else { 0 })
            }
            VIRelOp::Le { sign: Sign::S } => {
                zip!($ts, $fs, $a, $b, |x: $t, y: $t| if x <= y { -1 } else { 0 })
            }
            VIRelOp::Le { sign: Sign::U } => {
                zip!($tu, $fu, $a, $b, |x: $u, y: $u| if x <= y { <$u>::MAX } else { 0 })
            }
            VIRelOp::Ge { sign: Sign::S } => {
                zip!($ts, $fs, $a, $b, |x: $t, y: $t| if x >= y { -1 } else { 0 })
            }
            VIRelOp::Ge { sign: Sign::U } => {
                zip!($tu, $fu, $a, $b, |x: $u, y: $u| if x >= y { <$u>::MAX } else { 0 })
            }
        }
    }};
}

pub fn virelop(shape: IShape, op: VIRelOp, a: u128, b: u128) -> u128 {
    int_shapes!(shape, do_virelop, op, a, b)
}

macro_rules! do_vshift {
    ($ts:ident, $fs:ident, $tu:ident, $fu:ident, $t:ty, $u:ty, $op:expr, $a:expr, $count:expr) => {{
        let k = $count % (<$t>::BITS);
        match $op {
            VShiftOp::Shl => map!($tu, $fu, $a, |x: $u| x << k),
            VShiftOp::ShrS => map!($ts, $fs, $a, |x: $t| x >> k),
            VShiftOp::ShrU => map!($tu, $fu, $a, |x: $u| x >> k),
        }
    }};
}

pub fn vshift(shape: IShape, op: VShiftOp, a: u128, count: u32) -> u128 {
    int_shapes!(shape, do_vshift, op, a, count)
}

macro_rules! do_alltrue {
    ($ts:ident, $fs:ident, $tu:ident, $fu:ident, $t:ty, $u:ty, $a:expr) => {
        $tu($a).iter().all(|&x| x != 0)
    };
}

pub fn all_true(shape: IShape, a: u128) -> bool {
    int_shapes!(shape, do_alltrue, a)
}

macro_rules! do_bitmask {
    ($ts:ident, $fs:ident, $tu:ident, $fu:ident, $t:ty, $u:ty, $a:expr) => {{
        let lanes = $ts($a);
        let mut out = 0i32;
        for (i, &x) in lanes.iter().enumerate() {
            if x < 0 {
                out |= 1 << i;
            }
        }
        out
    }};
}

pub fn bitmask(shape: IShape, a: u128) -> i32 {
    int_shapes!(shape, do_bitmask, a)
}

pub fn any_true(a: u128) -> bool {
    a != 0
}

// ===== whole-vector bitwise =====

pub fn vv_not(a: u128) -> u128 {
    !a
}

pub fn vv_and(a: u128, b: u128) -> u128 {
    a & b
}

pub fn vv_andnot(a: u128, b: u128) -> u128 {
    a & !b
}

pub fn vv_or(a: u128, b: u128) -> u128 {
    a | b
}

pub fn vv_xor(a: u128, b: u128) -> u128 {
    a ^ b
}

pub fn vv_bitselect(a: u128, b: u128, mask: u128) -> u128 {
    (a & mask) | (b & !mask)
}

// ===== float lane ops =====

macro_rules! float_shapes {
    ($shape:expr, $mac:ident, $($args:tt)*) => {
        match $shape {
            FShape::F32x4 => $mac!(to_f32x4, from_f32x4, f32, fmin32, fmax32, fnearest32, $($args)*),
            FShape::F64x2 => $mac!(to_f64x2, from_f64x2, f64, fmin64, fmax64, fnearest64, $($args)*),
        }
    };
}

macro_rules! do_vfunop {
    ($to:ident, $from:ident, $t:ty, $min:ident, $max:ident, $near:ident, $op:expr, $a:expr) => {{
        match $op {
            VFUnOp::Abs => map!($to, $from, $a, |x: $t| x.abs()),
            VFUnOp::Neg => map!($to, $from, $a, |x: $t| -x),
            VFUnOp::Sqrt => map!($to, $from, $a, |x: $t| x.sqrt()),
            VFUnOp::Ceil => map!($to, $from, $a, |x: $t| x.ceil()),
            VFUnOp::Floor => map!($to, $from, $a, |x: $t| x.floor()),
            VFUnOp::Trunc => map!($to, $from, $a, |x: $t| x.trunc()),
            VFUnOp::Nearest => map!($to, $from, $a, |x: $t| $near(x)),
        }
    }};
}

pub fn vfunop(shape: FShape, op: VFUnOp, a: u128) -> u128 {
    float_shapes!(shape, do_vfunop, op, a)
}

macro_rules! do_vfbinop {
    ($to:ident, $from:ident, $t:ty, $min:ident, $max:ident, $near:ident, $op:expr, $a:expr, $b:expr) => {{
        match $op {
            VFBinOp::Add => zip!($to, $from, $a, $b, |x: $t, y: $t| x + y),
            VFBinOp::Sub => zip!($to, $from, $a, $b, |x: $t, y: $t| x - y),
            VFBinOp::Mul => zip!($to, $from, $a, $b, |x: $t, y: $t| x * y),
            VFBinOp::Div => zip!($to, $from, $a, $b, |x: $t, y: $t| x / y),
            VFBinOp::Min => zip!($to, $from, $a, $b, |x: $t, y: $t| $min(x, y)),
            VFBinOp::Max => zip!($to, $from, $a, $b, |x: $t, y: $t| $max(x, y)),
            // Pseudo-min/max: plain comparison select, no NaN special case.
            VFBinOp::PMin => zip!($to, $from, $a, $b, |x: $t, y: $t| if y < x { y } else { x }),
            VFBinOp::PMax => zip!($to, $from, $a, $b, |x: $t, y: $t| if x < y { y } else { x }),
        }
    }};
}

pub fn vfbinop(shape: FShape, op: VFBinOp, a: u128, b: u128) -> u128 {
    float_shapes!(shape, do_vfbinop, op, a, b)
}

macro_rules! do_vfrelop {
    ($to:ident, $from:ident, $t:ty, $min:ident, $max:ident, $near:ident, $op:expr, $a:expr, $b:expr) => {{
        let x = $to($a);
        let y = $to($b);
        let f = |p: $t, q: $t| match $op {
            VFRelOp::Eq => p == q,
            VFRelOp::Ne => p != q,
            VFRelOp::Lt => p < q,
            VFRelOp::Gt => p > q,
            VFRelOp::Le => p <= q,
            VFRelOp::Ge => p >= q,
        };
        let mut b = [0u8; 16];
        let sz = 16 / x.len();
        for i in 0..x.len() {
            let fill = if f(x[i], y[i]) { 0xFF } else { 0 };
            b[i * sz..(i + 1) * sz].fill(fill);
        }
        u128::from_le_bytes(b)
    }};
}

pub fn vfrelop(shape: FShape, op: VFRelOp, a: u128, b: u128) -> u128 {
    float_shapes!(shape, do_vfrelop, op, a, b)
}

// ===== shuffles =====

pub fn shuffle(a: u128, b: u128, idx: &[u8; 16]) -> u128 {
    let xa = a.to_le_bytes();
    let xb = b.to_le_bytes();
    let mut out = [0u8; 16];
    for (i, &sel) in idx.iter().enumerate() {
        out[i] = if sel < 16 { xa[sel as usize] } else { xb[(sel - 16) as usize] };
    }
    u128::from_le_bytes(out)
}

pub fn swizzle(a: u128, s: u128) -> u128 {
    let xa = a.to_le_bytes();
    let sel = s.to_le_bytes();
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = if (sel[i] as usize) < 16 { xa[sel[i] as usize] } else { 0 };
    }
    u128::from_le_bytes(out)
}

// ===== splat / lanes =====

pub fn splat(shape: Shape, v: &Value) -> Result<u128, Trap> {
    Ok(match (shape, v) {
        (Shape::I(IShape::I8x16), Value::I32(x)) => from_i8x16([*x as i8; 16]),
        (Shape::I(IShape::I16x8), Value::I32(x)) => from_i16x8([*x as i16; 8]),
        (Shape::I(IShape::I32x4), Value::I32(x)) => from_i32x4([*x; 4]),
        (Shape::I(IShape::I64x2), Value::I64(x)) => from_i64x2([*x; 2]),
        (Shape::F(FShape::F32x4), Value::F32(b)) => from_u32x4([*b; 4]),
        (Shape::F(FShape::F64x2), Value::F64(b)) => from_u64x2([*b; 2]),
        _ => return Err(Trap::UnreachableExecuted),
    })
}

pub fn extract_lane(shape: Shape, lane: u8, sign: Sign, v: u128) -> Result<Value, Trap> {
    let lane = lane as usize;
    Ok(match shape {
        Shape::I(IShape::I8x16) => {
            let l = *to_i8x16(v).get(lane).ok_or(Trap::UnreachableExecuted)?;
            Value::I32(match sign {
                Sign::S => l as i32,
                Sign::U => l as u8 as i32,
            })
        }
        Shape::I(IShape::I16x8) => {
            let l = *to_i16x8(v).get(lane).ok_or(Trap::UnreachableExecuted)?;
            Value::I32(match sign {
                Sign::S => l as i32,
                Sign::U => l as u16 as i32,
            })
        }
        Shape::I(IShape::I32x4) => {
            Value::I32(*to_i32x4(v).get(lane).ok_or(Trap::UnreachableExecuted)?)
        }
        Shape::I(IShape::I64x2) => {
            Value::I64(*to_i64x2(v).get(lane).ok_or(Trap::UnreachableExecuted)?)
        }
        Shape::F(FShape::F32x4) => {
            Value::F32(*to_u32x4(v).get(lane).ok_or(Trap::UnreachableExecuted)?)
        }
        Shape::F(FShape::F64x2) => {
            Value::F64(*to_u64x2(v).get(lane).ok_or(Trap::UnreachableExecuted)?)
        }
    })
}

pub fn replace_lane(shape: Shape, lane: u8, v: u128, x: &Value) -> Result<u128, Trap> {
    let lane = lane as usize;
    macro_rules! put {
        ($to:ident, $from:ident, $val:expr) => {{
            let mut l = $to(v);
            *l.get_mut(lane).ok_or(Trap::UnreachableExecuted)? = $val;
            $from(l)
        }};
    }
    Ok(match (shape, x) {
        (Shape::I(IShape::I8x16), Value::I32(n)) => put!(to_i8x16, from_i8x16, *n as i8),
        (Shape::I(IShape::I16x8), Value::I32(n)) => put!(to_i16x8, from_i16x8, *n as i16),
        (Shape::I(IShape::I32x4), Value::I32(n)) => put!(to_i32x4, from_i32x4, *n),
        (Shape::I(IShape::I64x2), Value::I64(n)) => put!(to_i64x2, from_i64x2, *n),
        (Shape::F(FShape::F32x4), Value::F32(b)) => put!(to_u32x4, from_u32x4, *b),
        (Shape::F(FShape::F64x2), Value::F64(b)) => put!(to_u64x2, from_u64x2, *b),
        _ => return Err(Trap::UnreachableExecuted),
    })
}

/// Replace `bytes.len()` bytes of lane `lane` (for `v128.loadN_lane`).
pub fn replace_lane_bytes(v: u128, lane: usize, bytes: &[u8]) -> u128 {
    let mut b = v.to_le_bytes();
    let sz = bytes.len();
    b[lane * sz..(lane + 1) * sz].copy_from_slice(bytes);
    u128::from_le_bytes(b)
}

/// Extract lane `lane` of `size` bytes (for `v128.storeN_lane`).
pub fn extract_lane_bytes(v: u128, lane: usize, size: usize) -> [u8; 8] {
    let b = v.to_le_bytes();
    let mut out = [0u8; 8];
    out[..size].copy_from_slice(&b[lane * size..(lane + 1) * size]);
    out
}

/// Widen 8 loaded bytes into a full vector (`v128.loadMxN_s/u`).
pub fn load_extend(from_bits: u8, sign: Sign, bytes: [u8; 8]) -> u128 {
    match (from_bits, sign) {
        (8, Sign::S) => {
            let mut l = [0i16; 8];
            for i in 0..8 {
                l[i] = bytes[i] as i8 as i16;
            }
            from_i16x8(l)
        }
        (8, Sign::U) => {
            let mut l = [0u16; 8];
            for i in 0..8 {
                l[i] = bytes[i] as u16;
            }
            from_u16x8(l)
        }
        (16, Sign::S) => {
            let mut l = [0i32; 4];
            for i in 0..4 {
                l[i] = i16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]) as i32;
            }
            from_i32x4(l)
        }
        (16, Sign::U) => {
            let mut l = [0u32; 4];
            for i in 0..4 {
                l[i] = u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]) as u32;
            }
            from_u32x4(l)
        }
        (32, Sign::S) => {
            let lo = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64;
            let hi = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as i64;
            from_i64x2([lo, hi])
        }
        (32, Sign::U) => {
            let lo = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64;
            let hi = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as u64;
            from_u64x2([lo, hi])
        }
        _ => 0,
    }
}

// ===== narrow / extend / pairwise =====

pub fn narrow(from: IShape, sign: Sign, a: u128, b: u128) -> u128 {
    match from {
        IShape::I16x8 => {
            let xa = to_i16x8(a);
            let xb = to_i16x8(b);
            let mut out = [0u8; 16];
            for i in 0..8 {
                out[i] = sat8(xa[i], sign);
                out[8 + i] = sat8(xb[i], sign);
            }
            u128::from_le_bytes(out)
        }
        IShape::I32x4 => {
            let xa = to_i32x4(a);
            let xb = to_i32x4(b);
            let mut l = [0u16; 8];
            for i in 0..4 {
                l[i] = sat16(xa[i], sign);
                l[4 + i] = sat16(xb[i], sign);
            }
            from_u16x8(l)
        }
        _ => a,
    }
}

fn sat8(x: i16, sign: Sign) -> u8 {
    match sign {
        Sign::S => x.clamp(i8::MIN as i16, i8::MAX as i16) as i8 as u8,
        Sign::U => x.clamp(0, u8::MAX as i16) as u8,
    }
}

fn sat16(x: i32, sign: Sign) -> u16 {
    match sign {
        Sign::S => x.clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16,
        Sign::U => x.clamp(0, u16::MAX as i32) as u16,
    }
}

pub fn extend(to: IShape, half: Half, sign: Sign, a: u128) -> u128 {
    let off = |n: usize| match half {
        Half::Low => 0,
        Half::High => n,
    };
    match to {
        IShape::I16x8 => {
            let o = off(8);
            match sign {
                Sign::S => {
                    let src = to_i8x16(a);
                    let mut l = [0i16; 8];
                    for i in 0..8 {
                        l[i] = src[o + i] as i16;
                    }
                    from_i16x8(l)
                }
                Sign::U => {
                    let src = to_u8x16(a);
                    let mut l = [0u16; 8];
                    for i in 0..8 {
                        l[i] = src[o + i] as u16;
                    }
                    from_u16x8(l)
                }
            }
        }
        IShape::I32x4 => {
            let o = off(4);
            match sign {
                Sign::S => {
                    let src = to_i16x8(a);
                    let mut l = [0i32; 4];
                    for i in 0..4 {
                        l[i] = src[o + i] as i32;
                    }
                    from_i32x4(l)
                }
                Sign::U => {
                    let src = to_u16x8(a);
                    let mut l = [0u32; 4];
                    for i in 0..4 {
                        l[i] = src[o + i] as u32;
                    }
                    from_u32x4(l)
                }
            }
        }
        IShape::I64x2 => {
            let o = off(2);
            match sign {
                Sign::S => {
                    let src = to_i32x4(a);
                    from_i64x2([src[o] as i64, src[o + 1] as i64])
                }
                Sign::U => {
                    let src = to_u32x4(a);
                    from_u64x2([src[o] as u64, src[o + 1] as u64])
                }
            }
        }
        IShape::I8x16 => a,
    }
}

pub fn extadd_pairwise(to: IShape, sign: Sign, a: u128) -> u128 {
    match to {
        IShape::I16x8 => match sign {
            Sign::S => {
                let src = to_i8x16(a);
                let mut l = [0i16; 8];
                for i in 0..8 {
                    l[i] = src[2 * i] as i16 + src[2 * i + 1] as i16;
                }
                from_i16x8(l)
            }
            Sign::U => {
                let src = to_u8x16(a);
                let mut l = [0u16; 8];
                for i in 0..8 {
                    l[i] = src[2 * i] as u16 + src[2 * i + 1] as u16;
                }
                from_u16x8(l)
            }
        },
        IShape::I32x4 => match sign {
            Sign::S => {
                let src = to_i16x8(a);
                let mut l = [0i32; 4];
                for i in 0..4 {
                    l[i] = src[2 * i] as i32 + src[2 * i + 1] as i32;
                }
                from_i32x4(l)
            }
            Sign::U => {
                let src = to_u16x8(a);
                let mut l = [0u32; 4];
                for i in 0..4 {
                    l[i] = src[2 * i] as u32 + src[2 * i + 1] as u32;
                }
                from_u32x4(l)
            }
        },
        _ => a,
    }
}

/// Extended multiply: widen both halves, multiply in the wider shape.
pub fn extmul(to: IShape, half: Half, sign: Sign, a: u128, b: u128) -> u128 {
    let wa = extend(to, half, sign, a);
    let wb = extend(to, half, sign, b);
    vibinop(to, VIBinOp::Mul, wa, wb)
}

pub fn q15mulr_sat(a: u128, b: u128) -> u128 {
    zip!(to_i16x8, from_i16x8, a, b, |x: i16, y: i16| {
        let r = (x as i32 * y as i32 + 0x4000) >> 15;
        r.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    })
}

/// `i32x4.dot_i16x8_s`.
pub fn dot_i16x8(a: u128, b: u128) -> u128 {
    let xa = to_i16x8(a);
    let xb = to_i16x8(b);
    let mut l = [0i32; 4];
    for i in 0..4 {
        l[i] = (xa[2 * i] as i32 * xb[2 * i] as i32)
            .wrapping_add(xa[2 * i + 1] as i32 * xb[2 * i + 1] as i32);
    }
    from_i32x4(l)
}

// ===== conversions =====

pub fn vcvt(op: VCvtOp, a: u128) -> u128 {
    match op {
        VCvtOp::I32x4TruncSatF32x4 { sign: Sign::S } => {
            let src = to_f32x4(a);
            from_i32x4([src[0] as i32, src[1] as i32, src[2] as i32, src[3] as i32])
        }
        VCvtOp::I32x4TruncSatF32x4 { sign: Sign::U } => {
            let src = to_f32x4(a);
            from_u32x4([src[0] as u32, src[1] as u32, src[2] as u32, src[3] as u32])
        }
        VCvtOp::I32x4TruncSatF64x2Zero { sign: Sign::S } => {
            let src = to_f64x2(a);
            from_i32x4([src[0] as i32, src[1] as i32, 0, 0])
        }
        VCvtOp::I32x4TruncSatF64x2Zero { sign: Sign::U } => {
            let src = to_f64x2(a);
            from_u32x4([src[0] as u32, src[1] as u32, 0, 0])
        }
        VCvtOp::F32x4ConvertI32x4 { sign: Sign::S } => {
            let src = to_i32x4(a);
            from_f32x4([src[0] as f32, src[1] as f32, src[2] as f32, src[3] as f32])
        }
        VCvtOp::F32x4ConvertI32x4 { sign: Sign::U } => {
            let src = to_u32x4(a);
            from_f32x4([src[0] as f32, src[1] as f32, src[2] as f32, src[3] as f32])
        }
        VCvtOp::F64x2ConvertLowI32x4 { sign: Sign::S } => {
            let src = to_i32x4(a);
            from_f64x2([src[0] as f64, src[1] as f64])
        }
        VCvtOp::F64x2ConvertLowI32x4 { sign: Sign::U } => {
            let src = to_u32x4(a);
            from_f64x2([src[0] as f64, src[1] as f64])
        }
        VCvtOp::F32x4DemoteF64x2Zero => {
            let src = to_f64x2(a);
            from_f32x4([src[0] as f32, src[1] as f32, 0.0, 0.0])
        }
        VCvtOp::F64x2PromoteLowF32x4 => {
            let src = to_f32x4(a);
            from_f64x2([src[0] as f64, src[1] as f64])
        }
    }
}

// ===== relaxed ops, bound to deterministic implementations =====

pub fn relaxed_unop(op: RelaxedOp, a: u128) -> u128 {
    match op {
        RelaxedOp::TruncF32x4 { sign } => vcvt(VCvtOp::I32x4TruncSatF32x4 { sign }, a),
        RelaxedOp::TruncF64x2Zero { sign } => vcvt(VCvtOp::I32x4TruncSatF64x2Zero { sign }, a),
        _ => a,
    }
}

pub fn relaxed_binop(op: RelaxedOp, a: u128, b: u128) -> u128 {
    match op {
        RelaxedOp::Swizzle => swizzle(a, b),
        RelaxedOp::MinF32x4 => vfbinop(FShape::F32x4, VFBinOp::Min, a, b),
        RelaxedOp::MaxF32x4 => vfbinop(FShape::F32x4, VFBinOp::Max, a, b),
        RelaxedOp::MinF64x2 => vfbinop(FShape::F64x2, VFBinOp::Min, a, b),
        RelaxedOp::MaxF64x2 => vfbinop(FShape::F64x2, VFBinOp::Max, a, b),
        RelaxedOp::Q15MulrS => q15mulr_sat(a, b),
        RelaxedOp::DotI8x16I7x16S => {
            let xa = to_i8x16(a);
            let xb = to_i8x16(b);
            let mut l = [0i16; 8];
            for i in 0..8 {
                l[i] = (xa[2 * i] as i16 * xb[2 * i] as i16)
                    .wrapping_add(xa[2 * i + 1] as i16 * xb[2 * i + 1] as i16);
            }
            from_i16x8(l)
        }
        _ => a,
    }
}

pub fn relaxed_ternop(op: RelaxedOp, a: u128, b: u128, c: u128) -> u128 {
    match op {
        // Unfused multiply-add; the relaxed range admits either.
        RelaxedOp::MaddF32x4 => {
            zip3_f32(a, b, c, |x, y, z| x * y + z)
        }
        RelaxedOp::NmaddF32x4 => zip3_f32(a, b, c, |x, y, z| -(x * y) + z),
        RelaxedOp::MaddF64x2 => zip3_f64(a, b, c, |x, y, z| x * y + z),
        RelaxedOp::NmaddF64x2 => zip3_f64(a, b, c, |x, y, z| -(x * y) + z),
        RelaxedOp::Laneselect(_) => vv_bitselect(a, b, c),
        RelaxedOp::DotI8x16I7x16AddS => {
            let dot = relaxed_binop(RelaxedOp::DotI8x16I7x16S, a, b);
            let pair = extadd_pairwise(IShape::I32x4, Sign::S, dot);
            vibinop(IShape::I32x4, VIBinOp::Add, pair, c)
        }
        _ => a,
    }
}

fn zip3_f32(a: u128, b: u128, c: u128, f: impl Fn(f32, f32, f32) -> f32) -> u128 {
    let (xa, xb, xc) = (to_f32x4(a), to_f32x4(b), to_f32x4(c));
    let mut out = xa;
    for i in 0..4 {
        out[i] = f(xa[i], xb[i], xc[i]);
    }
    from_f32x4(out)
}

fn zip3_f64(a: u128, b: u128, c: u128, f: impl Fn(f64, f64, f64) -> f64) -> u128 {
    let (xa, xb, xc) = (to_f64x2(a), to_f64x2(b), to_f64x2(c));
    let mut out = xa;
    for i in 0..2 {
        out[i] = f(xa[i], xb[i], xc[i]);
    }
    from_f64x2(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_round_trip() {
        let v = from_i32x4([1, -2, 3, -4]);
        assert_eq!(to_i32x4(v), [1, -2, 3, -4]);
        let v = from_f64x2([1.5, -2.5]);
        assert_eq!(to_f64x2(v), [1.5, -2.5]);
    }

    #[test]
    fn saturating_lanes() {
        let a = from_i8x16([120; 16]);
        let b = from_i8x16([100; 16]);
        let r = vibinop(IShape::I8x16, VIBinOp::AddSat { sign: Sign::S }, a, b);
        assert_eq!(to_i8x16(r), [127; 16]);
    }

    #[test]
    fn relop_produces_masks() {
        let a = from_i32x4([1, 5, 3, 0]);
        let b = from_i32x4([2, 4, 3, 1]);
        let r = virelop(IShape::I32x4, VIRelOp::Lt { sign: Sign::S }, a, b);
        assert_eq!(to_u32x4(r), [u32::MAX, 0, 0, u32::MAX]);
        assert_eq!(bitmask(IShape::I32x4, r), 0b1001);
    }

    #[test]
    fn shifts_mask_count() {
        let a = from_i32x4([8, -8, 1, 0]);
        let r = vshift(IShape::I32x4, VShiftOp::ShrS, a, 35); // 35 % 32 == 3
        assert_eq!(to_i32x4(r), [1, -1, 0, 0]);
    }

    #[test]
    fn narrow_saturates() {
        let a = from_i16x8([300, -300, 5, 0, 0, 0, 0, 0]);
        let r = narrow(IShape::I16x8, Sign::S, a, a);
        assert_eq!(to_i8x16(r)[..3], [127, -128, 5]);
        let r = narrow(IShape::I16x8, Sign::U, a, a);
        assert_eq!(to_u8x16(r)[..3], [255, 0, 5]);
    }

    #[test]
    fn dot_and_extmul() {
        let a = from_i16x8([1, 2, 3, 4, 0, 0, 0, 0]);
        let b = from_i16x8([5, 6, 7, 8, 0, 0, 0, 0]);
        assert_eq!(to_i32x4(dot_i16x8(a, b)), [17, 53, 0, 0]);
        let r = extmul(IShape::I32x4, Half::Low, Sign::S, a, b);
        assert_eq!(to_i32x4(r), [5, 12, 21, 32]);
    }

    #[test]
    fn swizzle_out_of_range_is_zero() {
        let a = from_u8x16([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let s = from_u8x16([0, 15, 16, 255, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1]);
        let r = swizzle(a, s);
        assert_eq!(to_u8x16(r)[..4], [1, 16, 0, 0]);
    }

    #[test]
    fn trunc_sat_lanes() {
        let a = from_f32x4([1.9, -1.9, f32::NAN, 3.0e9]);
        let r = vcvt(VCvtOp::I32x4TruncSatF32x4 { sign: Sign::S }, a);
        assert_eq!(to_i32x4(r), [1, -1, 0, i32::MAX]);
    }
}
