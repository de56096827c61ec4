//! Bridge between rust types and raw values

use crate::transport::{RawComm, RawOp, RawRequest};

/// Rust transport bridge traits
pub mod traits {
    pub use super::{AsRaw, AsRawMut, RawCommunicator, RawOperation, RawRequestHandle};
}

/// A rust type than can identify as a raw value understood by the transport.
pub trait AsRaw {
    /// The raw transport type
    type Raw;
    /// The raw value
    fn as_raw(&self) -> Self::Raw;
}

impl<'a, T: 'a + AsRaw> AsRaw for &'a T {
    type Raw = <T as AsRaw>::Raw;
    fn as_raw(&self) -> Self::Raw {
        (*self).as_raw()
    }
}

/// A rust type than can hand out its raw value for the transport to update.
pub trait AsRawMut: AsRaw {
    /// A mutable reference to the raw value
    fn as_raw_mut(&mut self) -> &mut <Self as AsRaw>::Raw;
}

/// A type that can identify as a `RawComm`
pub trait RawCommunicator: AsRaw<Raw = RawComm> {}
impl<'a, T: 'a + RawCommunicator> RawCommunicator for &'a T {}

/// A type that can identify as a `RawRequest`
pub trait RawRequestHandle: AsRaw<Raw = RawRequest> + AsRawMut {}

/// A type that can identify as a `RawOp`
pub trait RawOperation: AsRaw<Raw = RawOp> {}
impl<'a, T: 'a + RawOperation> RawOperation for &'a T {}
