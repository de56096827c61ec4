//! Describing data
//!
//! Every value that crosses the transport is described by a `WireTag`, the transport-level name
//! of its layout. The relationship between a Rust type and its tag is covered by the
//! `Equivalence` trait, which is implemented for a closed set of types: the primitive integers
//! and floats, `bool`, `Byte`, complex numbers (with the `complex` feature) and the
//! value/index pairs used by the location reductions. Using any other type in a transfer is a
//! compile error.
//!
//! A `Buffer` describes a specific piece of data in memory that the transport should operate on:
//! its wire tag, how many elements it holds and its bytes. `Buffer` and `BufferMut` are
//! implemented for single values and slices of types implementing `Equivalence`.
//!
//! No conversion is ever performed. Receiving data into a buffer of a different wire tag than the
//! one it was sent with is rejected by the transport.

use std::{fmt, mem, slice};

#[cfg(feature = "complex")]
use num_complex::Complex;

/// Datatype traits
pub mod traits {
    pub use super::{AsDatatype, Buffer, BufferMut, Bytes, BytesMut, Collection, Equivalence};
}

/// Transport-level identifier of an element layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WireTag {
    #[allow(missing_docs)]
    Int8,
    #[allow(missing_docs)]
    Int16,
    #[allow(missing_docs)]
    Int32,
    #[allow(missing_docs)]
    Int64,
    #[allow(missing_docs)]
    UInt8,
    #[allow(missing_docs)]
    UInt16,
    #[allow(missing_docs)]
    UInt32,
    #[allow(missing_docs)]
    UInt64,
    /// Pointer-sized signed integer
    ISize,
    /// Pointer-sized unsigned integer
    USize,
    /// 32 bit IEEE float
    Float,
    /// 64 bit IEEE float
    Double,
    /// One byte, `0` or `1`
    Bool,
    /// Uninterpreted byte
    Byte,
    /// Pair of 32 bit floats
    FloatComplex,
    /// Pair of 64 bit floats
    DoubleComplex,
    /// `i32` value with `i32` index
    IntInt,
    /// `f32` value with `i32` index
    FloatInt,
    /// `i64` value with `i64` index
    LongLong,
    /// `f64` value with `i64` index
    DoubleLong,
}

impl WireTag {
    /// Width of one element in bytes
    pub fn size(&self) -> usize {
        use self::WireTag::*;
        match *self {
            Int8 | UInt8 | Bool | Byte => 1,
            Int16 | UInt16 => 2,
            Int32 | UInt32 | Float => 4,
            Int64 | UInt64 | Double | FloatComplex | IntInt | FloatInt => 8,
            ISize | USize => mem::size_of::<usize>(),
            DoubleComplex | LongLong | DoubleLong => 16,
        }
    }

    /// Short name, used in diagnostics
    pub fn name(&self) -> &'static str {
        use self::WireTag::*;
        match *self {
            Int8 => "int8",
            Int16 => "int16",
            Int32 => "int32",
            Int64 => "int64",
            UInt8 => "uint8",
            UInt16 => "uint16",
            UInt32 => "uint32",
            UInt64 => "uint64",
            ISize => "isize",
            USize => "usize",
            Float => "float",
            Double => "double",
            Bool => "bool",
            Byte => "byte",
            FloatComplex => "float complex",
            DoubleComplex => "double complex",
            IntInt => "int-int",
            FloatInt => "float-int",
            LongLong => "long-long",
            DoubleLong => "double-long",
        }
    }

    /// Whether elements of this tag are integers (including `Byte`)
    pub fn is_integer(&self) -> bool {
        use self::WireTag::*;
        matches!(
            *self,
            Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64 | ISize | USize | Byte
        )
    }

    /// Whether this is one of the value/index pair tags
    pub fn is_pair(&self) -> bool {
        use self::WireTag::*;
        matches!(*self, IntInt | FloatInt | LongLong | DoubleLong)
    }
}

impl fmt::Display for WireTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A direct equivalence exists between the implementing type and a `WireTag`
///
/// # Safety
///
/// Implementors are plain data without padding bytes, so their memory can be viewed as
/// `size_of::<Self>()` initialized bytes, and `WIRE_TAG.size() == size_of::<Self>()`. The trait
/// is sealed; the set of implementors is fixed by this module.
pub unsafe trait Equivalence: sealed::Sealed + Copy + Default + Send + Sync + 'static {
    /// The tag this type travels under
    const WIRE_TAG: WireTag;
}

macro_rules! equivalent_system_datatype {
    ($rstype:ty, $tag:expr) => {
        impl sealed::Sealed for $rstype {}
        unsafe impl Equivalence for $rstype {
            const WIRE_TAG: WireTag = $tag;
        }
    };
}

equivalent_system_datatype!(bool, WireTag::Bool);

equivalent_system_datatype!(f32, WireTag::Float);
equivalent_system_datatype!(f64, WireTag::Double);

equivalent_system_datatype!(i8, WireTag::Int8);
equivalent_system_datatype!(i16, WireTag::Int16);
equivalent_system_datatype!(i32, WireTag::Int32);
equivalent_system_datatype!(i64, WireTag::Int64);
equivalent_system_datatype!(isize, WireTag::ISize);

equivalent_system_datatype!(u8, WireTag::UInt8);
equivalent_system_datatype!(u16, WireTag::UInt16);
equivalent_system_datatype!(u32, WireTag::UInt32);
equivalent_system_datatype!(u64, WireTag::UInt64);
equivalent_system_datatype!(usize, WireTag::USize);

equivalent_system_datatype!(Byte, WireTag::Byte);

#[cfg(feature = "complex")]
equivalent_system_datatype!(Complex<f32>, WireTag::FloatComplex);
#[cfg(feature = "complex")]
equivalent_system_datatype!(Complex<f64>, WireTag::DoubleComplex);

equivalent_system_datatype!(ValueIndex<i32, i32>, WireTag::IntInt);
equivalent_system_datatype!(ValueIndex<f32, i32>, WireTag::FloatInt);
equivalent_system_datatype!(ValueIndex<i64, i64>, WireTag::LongLong);
equivalent_system_datatype!(ValueIndex<f64, i64>, WireTag::DoubleLong);

/// An uninterpreted byte.
///
/// Travels as `WireTag::Byte`, which is distinct from the `u8` integer tag.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Byte(pub u8);

/// A value tagged with an index, the element type of `SystemOperation::min_loc()` and
/// `SystemOperation::max_loc()` reductions.
///
/// Only the pairings `(i32, i32)`, `(f32, i32)`, `(i64, i64)` and `(f64, i64)` can be
/// transferred.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd)]
pub struct ValueIndex<V, I> {
    /// The compared value
    pub value: V,
    /// Where the value came from, usually a rank
    pub index: I,
}

impl<V, I> ValueIndex<V, I> {
    /// Pair `value` with `index`
    pub fn new(value: V, index: I) -> Self {
        ValueIndex { value, index }
    }
}

/// The wire tag of `T`.
pub fn resolve<T: Equivalence>() -> WireTag {
    T::WIRE_TAG
}

/// Something that has an associated wire tag
pub trait AsDatatype {
    /// The associated wire tag
    fn as_datatype(&self) -> WireTag;
}

impl<T> AsDatatype for T
where
    T: Equivalence,
{
    fn as_datatype(&self) -> WireTag {
        T::WIRE_TAG
    }
}

impl<T> AsDatatype for [T]
where
    T: Equivalence,
{
    fn as_datatype(&self) -> WireTag {
        T::WIRE_TAG
    }
}

/// A countable collection of things.
pub trait Collection {
    /// How many things are in this collection.
    fn count(&self) -> usize;
}

impl<T> Collection for T
where
    T: Equivalence,
{
    fn count(&self) -> usize {
        1
    }
}

impl<T> Collection for [T]
where
    T: Equivalence,
{
    fn count(&self) -> usize {
        self.len()
    }
}

/// Provides the memory of a buffer as bytes.
pub trait Bytes {
    /// The bytes of all elements
    fn as_bytes(&self) -> &[u8];
}

impl<T> Bytes for T
where
    T: Equivalence,
{
    fn as_bytes(&self) -> &[u8] {
        bytes_of(slice::from_ref(self))
    }
}

impl<T> Bytes for [T]
where
    T: Equivalence,
{
    fn as_bytes(&self) -> &[u8] {
        bytes_of(self)
    }
}

/// Provides the memory of a buffer as mutable bytes.
pub trait BytesMut {
    /// The bytes of all elements
    ///
    /// Only bytes produced from values of the same `Equivalence` type may be written.
    fn as_bytes_mut(&mut self) -> &mut [u8];
}

impl<T> BytesMut for T
where
    T: Equivalence,
{
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytes_of_mut(slice::from_mut(self))
    }
}

impl<T> BytesMut for [T]
where
    T: Equivalence,
{
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytes_of_mut(self)
    }
}

/// A buffer is a region in memory holding `count()` elements of `as_datatype()`.
pub trait Buffer: Bytes + Collection + AsDatatype {}
impl<T> Buffer for T where T: Equivalence {}
impl<T> Buffer for [T] where T: Equivalence {}

/// A mutable buffer is a region in memory holding `count()` elements of `as_datatype()`.
pub trait BufferMut: BytesMut + Collection + AsDatatype {}
impl<T> BufferMut for T where T: Equivalence {}
impl<T> BufferMut for [T] where T: Equivalence {}

pub(crate) fn bytes_of<T: Equivalence>(elements: &[T]) -> &[u8] {
    // SAFETY: `Equivalence` types have no padding, every byte is initialized.
    unsafe { slice::from_raw_parts(elements.as_ptr().cast::<u8>(), mem::size_of_val(elements)) }
}

pub(crate) fn bytes_of_mut<T: Equivalence>(elements: &mut [T]) -> &mut [u8] {
    // SAFETY: as in `bytes_of`. The transport only writes bytes that were produced from values
    // of the same wire tag, hence of the same type.
    unsafe {
        slice::from_raw_parts_mut(
            elements.as_mut_ptr().cast::<u8>(),
            mem::size_of_val(elements),
        )
    }
}
