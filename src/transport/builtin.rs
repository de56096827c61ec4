//! Arithmetic of the built-in reduction operators over raw element bytes.

use std::mem;
use std::ops::{Add, Mul, Sub};

use crate::datatype::WireTag;
use crate::transport::{Code, RawOp, ERR_COUNT, ERR_OP, SUCCESS};

trait Element: Copy {
    const WIDTH: usize;
    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
}

macro_rules! primitive_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            const WIDTH: usize = mem::size_of::<$t>();

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }

            fn write(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes());
            }
        }
    )*};
}

primitive_element!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl Element for bool {
    const WIDTH: usize = 1;

    fn read(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write(self, bytes: &mut [u8]) {
        bytes[0] = u8::from(self);
    }
}

/// Layout of `ValueIndex<V, I>`: the value followed by the index.
#[derive(Copy, Clone, Debug, PartialEq)]
struct Pair<V, I> {
    value: V,
    index: I,
}

impl<V: Element, I: Element> Element for Pair<V, I> {
    const WIDTH: usize = V::WIDTH + I::WIDTH;

    fn read(bytes: &[u8]) -> Self {
        let (value, index) = bytes.split_at(V::WIDTH);
        Pair {
            value: V::read(value),
            index: I::read(index),
        }
    }

    fn write(self, bytes: &mut [u8]) {
        let (value, index) = bytes.split_at_mut(V::WIDTH);
        self.value.write(value);
        self.index.write(index);
    }
}

/// Layout of `Complex<F>`: real part followed by imaginary part.
#[derive(Copy, Clone, Debug, PartialEq)]
struct Cplx<F> {
    re: F,
    im: F,
}

impl<F: Element> Element for Cplx<F> {
    const WIDTH: usize = 2 * F::WIDTH;

    fn read(bytes: &[u8]) -> Self {
        let (re, im) = bytes.split_at(F::WIDTH);
        Cplx {
            re: F::read(re),
            im: F::read(im),
        }
    }

    fn write(self, bytes: &mut [u8]) {
        let (re, im) = bytes.split_at_mut(F::WIDTH);
        self.re.write(re);
        self.im.write(im);
    }
}

impl<F> Cplx<F>
where
    F: Copy + Add<Output = F> + Sub<Output = F> + Mul<Output = F>,
{
    fn sum(self, other: Self) -> Self {
        Cplx {
            re: self.re + other.re,
            im: self.im + other.im,
        }
    }

    fn product(self, other: Self) -> Self {
        Cplx {
            re: self.re * other.re - self.im * other.im,
            im: self.re * other.im + self.im * other.re,
        }
    }
}

fn min_loc<V: PartialOrd, I: Ord>(a: Pair<V, I>, b: Pair<V, I>) -> Pair<V, I> {
    if a.value < b.value {
        a
    } else if b.value < a.value {
        b
    } else if a.index <= b.index {
        a
    } else {
        b
    }
}

fn max_loc<V: PartialOrd, I: Ord>(a: Pair<V, I>, b: Pair<V, I>) -> Pair<V, I> {
    if a.value > b.value {
        a
    } else if b.value > a.value {
        b
    } else if a.index <= b.index {
        a
    } else {
        b
    }
}

/// `inout[i] = f(in[i], inout[i])`
fn fold<T: Element>(inbuf: &[u8], inoutbuf: &mut [u8], f: impl Fn(T, T) -> T) {
    for (a, b) in inbuf
        .chunks_exact(T::WIDTH)
        .zip(inoutbuf.chunks_exact_mut(T::WIDTH))
    {
        f(T::read(a), T::read(b)).write(b);
    }
}

macro_rules! integers {
    ($datatype:expr, $inbuf:expr, $inout:expr, $f:expr) => {
        match $datatype {
            WireTag::Int8 => fold::<i8>($inbuf, $inout, $f),
            WireTag::Int16 => fold::<i16>($inbuf, $inout, $f),
            WireTag::Int32 => fold::<i32>($inbuf, $inout, $f),
            WireTag::Int64 => fold::<i64>($inbuf, $inout, $f),
            WireTag::ISize => fold::<isize>($inbuf, $inout, $f),
            WireTag::UInt8 => fold::<u8>($inbuf, $inout, $f),
            WireTag::UInt16 => fold::<u16>($inbuf, $inout, $f),
            WireTag::UInt32 => fold::<u32>($inbuf, $inout, $f),
            WireTag::UInt64 => fold::<u64>($inbuf, $inout, $f),
            WireTag::USize => fold::<usize>($inbuf, $inout, $f),
            _ => return ERR_OP,
        }
    };
}

macro_rules! floats {
    ($datatype:expr, $inbuf:expr, $inout:expr, $f:expr) => {
        match $datatype {
            WireTag::Float => fold::<f32>($inbuf, $inout, $f),
            WireTag::Double => fold::<f64>($inbuf, $inout, $f),
            _ => return ERR_OP,
        }
    };
}

macro_rules! complexes {
    ($datatype:expr, $inbuf:expr, $inout:expr, $f:expr) => {
        match $datatype {
            WireTag::FloatComplex => fold::<Cplx<f32>>($inbuf, $inout, $f),
            WireTag::DoubleComplex => fold::<Cplx<f64>>($inbuf, $inout, $f),
            _ => return ERR_OP,
        }
    };
}

macro_rules! pairs {
    ($datatype:expr, $inbuf:expr, $inout:expr, $f:expr) => {
        match $datatype {
            WireTag::IntInt => fold::<Pair<i32, i32>>($inbuf, $inout, $f),
            WireTag::FloatInt => fold::<Pair<f32, i32>>($inbuf, $inout, $f),
            WireTag::LongLong => fold::<Pair<i64, i64>>($inbuf, $inout, $f),
            WireTag::DoubleLong => fold::<Pair<f64, i64>>($inbuf, $inout, $f),
            _ => return ERR_OP,
        }
    };
}

fn is_arithmetic_integer(datatype: WireTag) -> bool {
    datatype.is_integer() && datatype != WireTag::Byte
}

fn is_float(datatype: WireTag) -> bool {
    matches!(datatype, WireTag::Float | WireTag::Double)
}

fn is_complex(datatype: WireTag) -> bool {
    matches!(datatype, WireTag::FloatComplex | WireTag::DoubleComplex)
}

/// Whether the built-in `op` is defined over elements of `datatype`.
pub(crate) fn supports(op: RawOp, datatype: WireTag) -> bool {
    match op {
        RawOp::MAX | RawOp::MIN => is_arithmetic_integer(datatype) || is_float(datatype),
        RawOp::SUM | RawOp::PROD => {
            is_arithmetic_integer(datatype) || is_float(datatype) || is_complex(datatype)
        }
        RawOp::LAND | RawOp::LOR | RawOp::LXOR => {
            is_arithmetic_integer(datatype) || datatype == WireTag::Bool
        }
        RawOp::BAND | RawOp::BOR | RawOp::BXOR => datatype.is_integer(),
        RawOp::MINLOC | RawOp::MAXLOC => datatype.is_pair(),
        RawOp::REPLACE => true,
        _ => false,
    }
}

/// `inoutbuf[i] = inbuf[i] ∘ inoutbuf[i]` for the built-in `op`.
pub(crate) fn apply(op: RawOp, datatype: WireTag, inbuf: &[u8], inoutbuf: &mut [u8]) -> Code {
    if inbuf.len() != inoutbuf.len() || inbuf.len() % datatype.size() != 0 {
        return ERR_COUNT;
    }
    if !supports(op, datatype) {
        return ERR_OP;
    }

    match op {
        RawOp::REPLACE => inoutbuf.copy_from_slice(inbuf),
        RawOp::SUM if is_float(datatype) => floats!(datatype, inbuf, inoutbuf, |a, b| a + b),
        RawOp::SUM if is_complex(datatype) => {
            complexes!(datatype, inbuf, inoutbuf, |a, b| a.sum(b))
        }
        RawOp::SUM => integers!(datatype, inbuf, inoutbuf, |a, b| a.wrapping_add(b)),
        RawOp::PROD if is_float(datatype) => floats!(datatype, inbuf, inoutbuf, |a, b| a * b),
        RawOp::PROD if is_complex(datatype) => {
            complexes!(datatype, inbuf, inoutbuf, |a, b| a.product(b))
        }
        RawOp::PROD => integers!(datatype, inbuf, inoutbuf, |a, b| a.wrapping_mul(b)),
        RawOp::MAX if is_float(datatype) => floats!(datatype, inbuf, inoutbuf, |a, b| a.max(b)),
        RawOp::MAX => integers!(datatype, inbuf, inoutbuf, |a, b| a.max(b)),
        RawOp::MIN if is_float(datatype) => floats!(datatype, inbuf, inoutbuf, |a, b| a.min(b)),
        RawOp::MIN => integers!(datatype, inbuf, inoutbuf, |a, b| a.min(b)),
        RawOp::LAND if datatype == WireTag::Bool => fold::<bool>(inbuf, inoutbuf, |a, b| a && b),
        RawOp::LAND => integers!(datatype, inbuf, inoutbuf, |a, b| if a != 0 && b != 0 {
            1
        } else {
            0
        }),
        RawOp::LOR if datatype == WireTag::Bool => fold::<bool>(inbuf, inoutbuf, |a, b| a || b),
        RawOp::LOR => integers!(datatype, inbuf, inoutbuf, |a, b| if a != 0 || b != 0 {
            1
        } else {
            0
        }),
        RawOp::LXOR if datatype == WireTag::Bool => fold::<bool>(inbuf, inoutbuf, |a, b| a != b),
        RawOp::LXOR => integers!(datatype, inbuf, inoutbuf, |a, b| if (a != 0) != (b != 0) {
            1
        } else {
            0
        }),
        RawOp::BAND if datatype == WireTag::Byte => fold::<u8>(inbuf, inoutbuf, |a, b| a & b),
        RawOp::BAND => integers!(datatype, inbuf, inoutbuf, |a, b| a & b),
        RawOp::BOR if datatype == WireTag::Byte => fold::<u8>(inbuf, inoutbuf, |a, b| a | b),
        RawOp::BOR => integers!(datatype, inbuf, inoutbuf, |a, b| a | b),
        RawOp::BXOR if datatype == WireTag::Byte => fold::<u8>(inbuf, inoutbuf, |a, b| a ^ b),
        RawOp::BXOR => integers!(datatype, inbuf, inoutbuf, |a, b| a ^ b),
        RawOp::MINLOC => pairs!(datatype, inbuf, inoutbuf, min_loc),
        RawOp::MAXLOC => pairs!(datatype, inbuf, inoutbuf, max_loc),
        _ => return ERR_OP,
    }
    SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{bytes_of, bytes_of_mut, Byte, ValueIndex};
    use proptest::prelude::*;

    const ALL_TAGS: [WireTag; 20] = [
        WireTag::Int8,
        WireTag::Int16,
        WireTag::Int32,
        WireTag::Int64,
        WireTag::UInt8,
        WireTag::UInt16,
        WireTag::UInt32,
        WireTag::UInt64,
        WireTag::ISize,
        WireTag::USize,
        WireTag::Float,
        WireTag::Double,
        WireTag::Bool,
        WireTag::Byte,
        WireTag::FloatComplex,
        WireTag::DoubleComplex,
        WireTag::IntInt,
        WireTag::FloatInt,
        WireTag::LongLong,
        WireTag::DoubleLong,
    ];

    fn combine<T: crate::datatype::Equivalence>(op: RawOp, a: &[T], b: &mut [T]) -> Code {
        apply(op, T::WIRE_TAG, bytes_of(a), bytes_of_mut(b))
    }

    #[test]
    fn supports_agrees_with_apply() {
        for datatype in ALL_TAGS {
            for op in 1..=13 {
                let op = RawOp(op);
                let a = vec![0u8; datatype.size()];
                let mut b = vec![0u8; datatype.size()];
                let code = apply(op, datatype, &a, &mut b);
                assert_eq!(
                    code == SUCCESS,
                    supports(op, datatype),
                    "{:?} on {}",
                    op,
                    datatype
                );
            }
        }
    }

    #[test]
    fn float_bitwise_is_rejected() {
        let mut b = [1.0f64];
        assert_eq!(combine(RawOp::BAND, &[2.0f64], &mut b), ERR_OP);
        assert_eq!(b, [1.0]);
    }

    #[test]
    fn loc_requires_pairs() {
        let mut b = [1i32];
        assert_eq!(combine(RawOp::MINLOC, &[2i32], &mut b), ERR_OP);
    }

    #[test]
    fn length_mismatch() {
        let mut b = [1i32, 2];
        assert_eq!(combine(RawOp::SUM, &[2i32], &mut b), ERR_COUNT);
    }

    #[test]
    fn user_ops_are_not_builtin() {
        let mut b = [1i32];
        assert_eq!(combine(RawOp(RawOp::FIRST_USER), &[2i32], &mut b), ERR_OP);
    }

    #[test]
    fn logical_on_bool_and_integers() {
        let mut b = [true, false, true, false];
        assert_eq!(combine(RawOp::LXOR, &[true, true, false, false], &mut b), SUCCESS);
        assert_eq!(b, [false, true, true, false]);

        let mut c = [3u16, 0, 0];
        assert_eq!(combine(RawOp::LAND, &[7u16, 7, 0], &mut c), SUCCESS);
        assert_eq!(c, [1, 0, 0]);
    }

    #[test]
    fn bytes_allow_bitwise_only() {
        let mut b = [Byte(0b1100)];
        assert_eq!(combine(RawOp::BOR, &[Byte(0b0011)], &mut b), SUCCESS);
        assert_eq!(b, [Byte(0b1111)]);
        assert_eq!(combine(RawOp::SUM, &[Byte(1)], &mut b), ERR_OP);
    }

    #[test]
    fn min_loc_ties_prefer_lower_index() {
        let a = [ValueIndex::new(1.5f64, 3i64), ValueIndex::new(0.5, 0)];
        let mut b = [ValueIndex::new(1.5f64, 1i64), ValueIndex::new(2.0, 1)];
        assert_eq!(combine(RawOp::MINLOC, &a, &mut b), SUCCESS);
        assert_eq!(b, [ValueIndex::new(1.5, 1), ValueIndex::new(0.5, 0)]);
    }

    #[test]
    fn max_loc_float_int() {
        let a = [ValueIndex::new(4.0f32, 2i32)];
        let mut b = [ValueIndex::new(4.0f32, 0i32)];
        assert_eq!(combine(RawOp::MAXLOC, &a, &mut b), SUCCESS);
        assert_eq!(b, [ValueIndex::new(4.0, 0)]);
    }

    #[test]
    fn replace_takes_incoming() {
        let mut b = [1u64, 2];
        assert_eq!(combine(RawOp::REPLACE, &[5u64, 6], &mut b), SUCCESS);
        assert_eq!(b, [5, 6]);
    }

    #[test]
    fn complex_product() {
        // (1 + 2i)(3 + 4i) = -5 + 10i
        let a = [1.0f64, 2.0];
        let mut b = [3.0f64, 4.0];
        let code = apply(
            RawOp::PROD,
            WireTag::DoubleComplex,
            bytes_of(&a),
            bytes_of_mut(&mut b),
        );
        assert_eq!(code, SUCCESS);
        assert_eq!(b, [-5.0, 10.0]);
    }

    proptest! {
        #[test]
        fn sum_wraps_like_integers(pairs in prop::collection::vec(any::<(i32, i32)>(), 0..64)) {
            let a: Vec<i32> = pairs.iter().map(|p| p.0).collect();
            let mut b: Vec<i32> = pairs.iter().map(|p| p.1).collect();
            prop_assert_eq!(combine(RawOp::SUM, &a, &mut b), SUCCESS);
            for (i, (x, y)) in pairs.iter().enumerate() {
                prop_assert_eq!(b[i], x.wrapping_add(*y));
            }
        }

        #[test]
        fn min_max_match_ord(pairs in prop::collection::vec(any::<(i64, i64)>(), 0..64)) {
            let a: Vec<i64> = pairs.iter().map(|p| p.0).collect();
            let mut lo: Vec<i64> = pairs.iter().map(|p| p.1).collect();
            let mut hi = lo.clone();
            prop_assert_eq!(combine(RawOp::MIN, &a, &mut lo), SUCCESS);
            prop_assert_eq!(combine(RawOp::MAX, &a, &mut hi), SUCCESS);
            for (i, (x, y)) in pairs.iter().enumerate() {
                prop_assert_eq!(lo[i], *x.min(y));
                prop_assert_eq!(hi[i], *x.max(y));
            }
        }

        #[test]
        fn bitwise_xor_is_an_involution(
            pairs in prop::collection::vec(any::<(u32, u32)>(), 0..64)
        ) {
            let a: Vec<u32> = pairs.iter().map(|p| p.0).collect();
            let original: Vec<u32> = pairs.iter().map(|p| p.1).collect();
            let mut b = original.clone();
            prop_assert_eq!(combine(RawOp::BXOR, &a, &mut b), SUCCESS);
            prop_assert_eq!(combine(RawOp::BXOR, &a, &mut b), SUCCESS);
            prop_assert_eq!(b, original);
        }
    }
}
