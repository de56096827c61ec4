//! Request objects for non-blocking operations
//!
//! Non-blocking operations such as `immediate_send()` return request objects that borrow any
//! buffers involved in the operation so as to ensure proper access restrictions. The borrow ends
//! with the request, so a buffer cannot be touched while the transport may still be using it.
//!
//! A request is in one of three states:
//!
//! - `Empty`: there is no operation attached, e.g. `Request::null()`
//! - `Pending`: the operation has been posted and not completed yet
//! - `Resolved`: the operation has completed or has been cancelled
//!
//! `wait()` and a successful `test()` take a request from `Pending` to `Resolved`. Completing a
//! request that is not pending is a no-op that reports an empty `Status`.
//!
//! **Note:** If a pending `Request` is dropped, the destructor blocks until the operation has
//! completed. A failure during that wait is logged, since a destructor cannot report it.
//!
//! # Unfinished features
//!
//! - Persistent requests
//! - `test_all()`, `test_some()`

use std::fmt;
use std::sync::Arc;

use log::{error, trace, warn};
use smallvec::SmallVec;

use crate::error::{self, Result};
use crate::raw::traits::*;
use crate::status::Status;
use crate::transport::{RawComm, RawRequest, RawStatus, Transport};

/// Request traits
pub mod traits {
    pub use super::RequestState;
}

/// Where a `Request` is in its life
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// No operation attached
    Empty,
    /// The operation is in flight
    Pending,
    /// The operation has completed or was cancelled
    Resolved,
}

/// A request object for a non-blocking operation that uses buffers living for `'b`
///
/// # Examples
///
/// See `demos/immediate.rs`
#[must_use]
pub struct Request<'b> {
    transport: Option<Arc<dyn Transport>>,
    comm: RawComm,
    raw: RawRequest,
    buffer: Option<&'b mut [u8]>,
    state: RequestState,
}

impl<'b> Request<'b> {
    /// A request with no operation attached
    pub fn null() -> Self {
        Request {
            transport: None,
            comm: RawComm::WORLD,
            raw: RawRequest::NULL,
            buffer: None,
            state: RequestState::Empty,
        }
    }

    /// Wrap a request the transport has just posted. `buffer` is where a receive delivers.
    pub(crate) fn pending(
        transport: Arc<dyn Transport>,
        comm: RawComm,
        raw: RawRequest,
        buffer: Option<&'b mut [u8]>,
    ) -> Self {
        Request {
            transport: Some(transport),
            comm,
            raw,
            buffer,
            state: RequestState::Pending,
        }
    }

    /// The current state
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether the operation is still in flight
    pub fn is_pending(&self) -> bool {
        self.state == RequestState::Pending
    }

    fn settle(&mut self) {
        if self.raw.is_null() {
            self.state = RequestState::Resolved;
            self.buffer = None;
        }
    }

    /// Wait for an operation to finish.
    ///
    /// Will block execution of the calling thread until the associated operation has finished.
    /// A request that is not pending returns an empty `Status` right away.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    pub fn wait(&mut self) -> Result<Status> {
        let transport = match (&self.transport, self.state) {
            (Some(transport), RequestState::Pending) => Arc::clone(transport),
            _ => return Ok(Status::empty()),
        };
        let mut status = RawStatus::default();
        let code = transport.wait(&mut self.raw, self.buffer.as_deref_mut(), &mut status);
        self.settle();
        error::check(&*transport, self.comm, code)?;
        trace!("request resolved with {:?}", Status::from_raw(status));
        Ok(Status::from_raw(status))
    }

    /// Test whether an operation has finished, without blocking.
    ///
    /// An empty request has trivially finished.
    pub fn test(&mut self) -> Result<bool> {
        self.test_with_status().map(|status| status.is_some())
    }

    /// Test whether an operation has finished, without blocking.
    ///
    /// If the operation has finished, its `Status` is returned and the request is resolved.
    pub fn test_with_status(&mut self) -> Result<Option<Status>> {
        let transport = match (&self.transport, self.state) {
            (Some(transport), RequestState::Pending) => Arc::clone(transport),
            _ => return Ok(Some(Status::empty())),
        };
        let mut flag = false;
        let mut status = RawStatus::default();
        let code = transport.test(
            &mut self.raw,
            self.buffer.as_deref_mut(),
            &mut flag,
            &mut status,
        );
        self.settle();
        error::check(&*transport, self.comm, code)?;
        Ok(if flag {
            Some(Status::from_raw(status))
        } else {
            None
        })
    }

    /// Withdraw a pending operation.
    ///
    /// The transport slot is released without waiting for completion and no `Status` is
    /// produced. A receive that is cancelled leaves its buffer in an unspecified state. Cancelling
    /// a request that is not pending does nothing.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    pub fn cancel(&mut self) -> Result<()> {
        let transport = match (&self.transport, self.state) {
            (Some(transport), RequestState::Pending) => Arc::clone(transport),
            _ => return Ok(()),
        };
        let code = transport.cancel(&mut self.raw);
        self.settle();
        error::check(&*transport, self.comm, code)
    }
}

impl<'b> Default for Request<'b> {
    fn default() -> Self {
        Request::null()
    }
}

impl<'b> AsRaw for Request<'b> {
    type Raw = RawRequest;
    fn as_raw(&self) -> Self::Raw {
        self.raw
    }
}

impl<'b> AsRawMut for Request<'b> {
    fn as_raw_mut(&mut self) -> &mut RawRequest {
        &mut self.raw
    }
}

impl<'b> RawRequestHandle for Request<'b> {}

impl<'b> fmt::Debug for Request<'b> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("raw", &self.raw)
            .field("state", &self.state)
            .finish()
    }
}

impl<'b> Drop for Request<'b> {
    fn drop(&mut self) {
        if !self.is_pending() {
            return;
        }
        warn!("request {:?} dropped while pending, waiting for it", self.raw);
        if let Err(e) = self.wait() {
            error!("implicit wait on dropped request failed: {}", e);
        }
    }
}

/// Wait for every request to finish, returning their statuses in order.
///
/// Requests that are not pending contribute an empty `Status`.
pub fn wait_all(requests: &mut [Request<'_>]) -> Result<Vec<Status>> {
    requests.iter_mut().map(|request| request.wait()).collect()
}

/// Outcome of `test_any()`
#[derive(Clone, Copy, Debug)]
pub enum TestAny {
    /// There were no pending requests
    NoneActive,
    /// Some requests are pending, but none of them has finished
    NoneComplete,
    /// The request at the index has finished
    Completed(usize, Status),
}

/// Check whether any pending request has finished, without blocking.
///
/// The first finished request in slice order is resolved and reported.
pub fn test_any(requests: &mut [Request<'_>]) -> Result<TestAny> {
    let mut active = false;
    for (index, request) in requests.iter_mut().enumerate() {
        if !request.is_pending() {
            continue;
        }
        active = true;
        if let Some(status) = request.test_with_status()? {
            return Ok(TestAny::Completed(index, status));
        }
    }
    Ok(if active {
        TestAny::NoneComplete
    } else {
        TestAny::NoneActive
    })
}

/// The transport of the pending `requests` and their raw handles, with `RawRequest::NULL` in
/// place of requests that are not pending
fn pending_handles(
    requests: &[Request<'_>],
) -> Option<(Arc<dyn Transport>, RawComm, SmallVec<[RawRequest; 8]>)> {
    let first = requests.iter().find(|request| request.is_pending())?;
    let transport = Arc::clone(first.transport.as_ref()?);
    let handles = requests
        .iter()
        .map(|request| {
            if request.is_pending() {
                request.raw
            } else {
                RawRequest::NULL
            }
        })
        .collect();
    Some((transport, first.comm, handles))
}

/// Block until any pending request has finished.
///
/// Returns the index and `Status` of the finished request, or `None` right away if no request is
/// pending. All pending requests must belong to the calling rank.
pub fn wait_any(requests: &mut [Request<'_>]) -> Result<Option<(usize, Status)>> {
    let (transport, comm, handles) = match pending_handles(requests) {
        Some(handles) => handles,
        None => return Ok(None),
    };
    let mut index = None;
    error::check(&*transport, comm, transport.waitany(&handles, &mut index))?;
    match index.and_then(|index| requests.get_mut(index).map(|request| (index, request))) {
        Some((index, request)) => request.wait().map(|status| Some((index, status))),
        None => Ok(None),
    }
}

/// Indices and statuses of the requests finished by `wait_some()`
pub type Completed = SmallVec<[(usize, Status); 8]>;

/// Block until at least one pending request has finished, then resolve every request that has
/// finished by then.
///
/// Returns an empty list right away if no request is pending.
pub fn wait_some(requests: &mut [Request<'_>]) -> Result<Completed> {
    let mut completed = Completed::new();
    let (transport, comm, handles) = match pending_handles(requests) {
        Some(handles) => handles,
        None => return Ok(completed),
    };
    let mut ready = Vec::new();
    error::check(&*transport, comm, transport.waitsome(&handles, &mut ready))?;
    for index in ready {
        if let Some(request) = requests.get_mut(index) {
            completed.push((index, request.wait()?));
        }
    }
    trace!("{} of {} requests finished", completed.len(), requests.len());
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_requests_are_resolved() {
        let mut request = Request::null();
        assert_eq!(request.state(), RequestState::Empty);
        assert!(request.test().unwrap());
        assert!(request.wait().unwrap().is_empty());
        request.cancel().unwrap();
        assert_eq!(request.state(), RequestState::Empty);
        assert!(Request::default().as_raw().is_null());
    }

    #[test]
    fn collections_without_pending_requests() {
        let mut requests = vec![Request::null(), Request::null()];
        assert!(wait_any(&mut requests).unwrap().is_none());
        assert!(wait_some(&mut requests).unwrap().is_empty());
        assert!(matches!(test_any(&mut requests).unwrap(), TestAny::NoneActive));
        let statuses = wait_all(&mut requests).unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(Status::is_empty));
    }
}
