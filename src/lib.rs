#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

//! Typed communication over a rank-addressed message-passing transport
//!
//! A group of ranks exchanges messages through a `Transport`: point to point, where messages are
//! matched by source rank and tag, and collectively, where every rank of the group takes part.
//! The transport only moves bytes tagged with a `WireTag`; this crate adds the Rust view on top:
//!
//! - Element types are mapped to wire tags at compile time through `Equivalence`. Sending a type
//!   without a mapping does not compile.
//! - Sequences and text of a length only the sender knows travel as a length header followed by
//!   the elements, so the receiver can size its buffer.
//! - Reductions use built-in operations or closures registered as `UserOperation`s.
//! - Non-blocking operations return a `Request` that borrows its buffer until it is resolved.
//! - Failures reported by the transport are turned into `Error`s, abort the group or are ignored,
//!   depending on the error policy chosen with Cargo features.
//!
//! The `transport::local` fabric runs a group of ranks as threads of one process.
//!
//! # Usage
//!
//! ```
//! use mpi_typed::traits::*;
//! use mpi_typed::transport::local;
//!
//! let received = local::run(2, |universe| {
//!     let world = universe.world();
//!     match world.rank().unwrap() {
//!         0 => {
//!             world.send_sequence(&[4.0f64, 8.0, 15.0], 1, 0).unwrap();
//!             None
//!         }
//!         _ => Some(world.receive_sequence::<f64>(0, 0).unwrap().0),
//!     }
//! })
//! .unwrap();
//! assert_eq!(received[1], Some(vec![4.0, 8.0, 15.0]));
//! ```
//!
//! # Features
//!
//! Currently supported:
//!
//! - **Point to point communication**: blocking and non-blocking standard mode send and receive,
//!   variable-length sequences and text
//! - **Collective communication**: barrier, broadcast, scatter, (all) gather, all to all,
//!   (all) reduce and local reduction
//! - **Datatypes**: the primitive numeric types, `bool`, `Byte`, value/index pairs and, with the
//!   `complex` feature, complex numbers
//!
//! Not supported (yet):
//!
//! - Communicators other than the world group
//! - Derived datatypes
//! - One-sided communication, parallel I/O
//!
//! The sub-modules contain a more detailed description of which features are and are not
//! supported.

pub mod collective;
pub mod datatype;
pub mod environment;
pub mod error;
pub mod logger;
pub mod point_to_point;
pub mod raw;
pub mod request;
pub mod status;
pub mod topology;
pub mod transport;

/// Re-exports all traits.
pub mod traits {
    pub use crate::collective::traits::*;
    pub use crate::datatype::traits::*;
    pub use crate::raw::traits::*;
    pub use crate::request::traits::*;
}

pub use crate::environment::initialize;
pub use crate::error::{Error, Result};

/// Encodes number of values in multi-value messages.
pub type Count = i32;
/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = i32;
/// Identifies a rank within a group.
pub type Rank = i32;
/// A count that could not be determined
pub const UNDEFINED: Count = -1;
