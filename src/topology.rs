//! Communicators
//!
//! A `Communicator` names a group of ranks and the transport that connects them. The world group
//! is created by `environment::initialize()`; its handle is handed out by `Universe::world()` and
//! `environment::world()`.
//!
//! Communicators are cheap to clone and can be shared between threads. The calling rank's
//! position and the size of the group are asked from the transport the first time they are
//! needed and cached for the lifetime of the communicator and its clones.
//!
//! Point to point operations are implemented in `point_to_point`, collective operations in
//! `collective`.
//!
//! # Unfinished features
//!
//! - Groups, splitting and duplicating communicators
//! - Process topologies

use std::fmt;
use std::sync::Arc;

use conv::ConvUtil;
use once_cell::sync::OnceCell;

use crate::error::{self, Error, Result};
use crate::raw::traits::*;
use crate::transport::{Code, RawComm, Transport, ERR_INTERN};
use crate::Rank;

/// A group of ranks that can communicate with each other
///
/// # Examples
///
/// See `demos/hello.rs`
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    raw: RawComm,
    rank: OnceCell<Rank>,
    size: OnceCell<Rank>,
}

impl Communicator {
    /// Wrap the group `raw` known to `transport`.
    pub fn from_raw(transport: Arc<dyn Transport>, raw: RawComm) -> Self {
        Communicator {
            inner: Arc::new(Inner {
                transport,
                raw,
                rank: OnceCell::new(),
                size: OnceCell::new(),
            }),
        }
    }

    /// The rank that identifies the calling thread's process within the group
    pub fn rank(&self) -> Result<Rank> {
        self.inner
            .rank
            .get_or_try_init(|| {
                let mut rank: Rank = 0;
                self.check(self.transport().comm_rank(self.inner.raw, &mut rank))?;
                Ok(rank)
            })
            .copied()
    }

    /// Number of ranks in the group
    pub fn size(&self) -> Result<Rank> {
        self.inner
            .size
            .get_or_try_init(|| {
                let mut size: Rank = 0;
                self.check(self.transport().comm_size(self.inner.raw, &mut size))?;
                Ok(size)
            })
            .copied()
    }

    /// The transport underneath this group
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Terminate every rank of the group.
    ///
    /// Does not return.
    pub fn abort(&self, errorcode: Code) -> ! {
        self.transport().abort(self.inner.raw, errorcode)
    }

    /// Apply the error policy to a transport return code.
    pub(crate) fn check(&self, code: Code) -> Result<()> {
        error::check(&**self.transport(), self.inner.raw, code)
    }

    /// `size()` as a length
    pub(crate) fn len(&self) -> Result<usize> {
        group_len(&**self.transport(), self.size()?)
    }
}

/// A group size reported by `transport` as a length. A negative size is an internal transport
/// failure.
fn group_len(transport: &dyn Transport, size: Rank) -> Result<usize> {
    size.value_as::<usize>()
        .map_err(|_| Error::from_code(transport, ERR_INTERN))
}

impl AsRaw for Communicator {
    type Raw = RawComm;
    fn as_raw(&self) -> Self::Raw {
        self.inner.raw
    }
}

impl RawCommunicator for Communicator {}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("raw", &self.inner.raw)
            .field("rank", &self.inner.rank.get())
            .field("size", &self.inner.size.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalFabric;

    #[test]
    fn rank_and_size_are_cached() {
        let fabric = LocalFabric::new(3).unwrap();
        let comm = Communicator::from_raw(Arc::new(fabric.endpoint(2).unwrap()), RawComm::WORLD);
        let clone = comm.clone();
        assert_eq!(comm.rank().unwrap(), 2);
        assert_eq!(clone.size().unwrap(), 3);
        assert_eq!(format!("{:?}", clone), format!("{:?}", comm));
        assert!(format!("{:?}", comm).contains("Some(2)"));
    }

    #[test]
    fn negative_sizes_are_internal_failures() {
        let fabric = LocalFabric::new(2).unwrap();
        let endpoint = fabric.endpoint(0).unwrap();
        assert_eq!(group_len(&endpoint, 2).unwrap(), 2);
        let error = group_len(&endpoint, -1).unwrap_err();
        assert_eq!(error.kind(), Some(crate::error::ErrorKind::Intern));
    }

    #[cfg(not(any(feature = "abort-on-error", feature = "ignore-errors")))]
    #[test]
    fn unknown_groups_fail() {
        let fabric = LocalFabric::new(1).unwrap();
        let comm = Communicator::from_raw(Arc::new(fabric.endpoint(0).unwrap()), RawComm(9));
        let error = comm.rank().unwrap_err();
        assert_eq!(error.kind(), Some(crate::error::ErrorKind::Comm));
    }
}
