//! The message-passing primitive underneath the typed layer
//!
//! Everything above this module speaks in typed buffers, sequences and requests. Everything in
//! here speaks in byte slices, wire tags, integer return codes and out-parameters, which is the
//! shape of the native message-passing APIs a backend wraps. A backend implements `Transport`;
//! the typed layer never looks past that trait.
//!
//! The element count of a transfer is implicit in the byte length of the buffer: a buffer of
//! `n * datatype.size()` bytes carries `n` elements of `datatype`.
//!
//! The crate ships a single backend, [`local`], which runs every rank of a group as a thread of
//! the current process.

use std::fmt;
use std::sync::Arc;

use crate::datatype::WireTag;
use crate::{Rank, Tag};

pub(crate) mod builtin;
pub mod local;

/// Return code of a transport call.
pub type Code = i32;

/// The call succeeded.
pub const SUCCESS: Code = 0;
/// Invalid buffer argument
pub const ERR_BUFFER: Code = 1;
/// Invalid count argument
pub const ERR_COUNT: Code = 2;
/// Invalid datatype argument
pub const ERR_TYPE: Code = 3;
/// Invalid tag argument
pub const ERR_TAG: Code = 4;
/// Invalid communicator argument
pub const ERR_COMM: Code = 5;
/// Invalid rank argument
pub const ERR_RANK: Code = 6;
/// Invalid root argument
pub const ERR_ROOT: Code = 7;
/// Invalid operation argument
pub const ERR_OP: Code = 8;
/// Message truncated on receive
pub const ERR_TRUNCATE: Code = 9;
/// Invalid request argument
pub const ERR_REQUEST: Code = 10;
/// Collective argument not identical on all processes
pub const ERR_NOT_SAME: Code = 11;
/// A peer of the group has aborted
pub const ERR_PROC_ABORTED: Code = 12;
/// Internal transport error
pub const ERR_INTERN: Code = 13;
/// Invalid argument of some other kind
pub const ERR_ARG: Code = 14;
/// Known error not in this list
pub const ERR_OTHER: Code = 15;
/// Unknown error
pub const ERR_UNKNOWN: Code = 16;
/// Last error code
pub const ERR_LASTCODE: Code = 16;

/// Matches messages from any source rank in a receive.
pub const ANY_SOURCE: Rank = -1;
/// Matches messages with any tag in a receive.
pub const ANY_TAG: Tag = -1;

/// Handle of a rank group known to the transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawComm(pub u32);

impl RawComm {
    /// The group of all ranks
    pub const WORLD: RawComm = RawComm(0);
}

/// Handle of an outstanding non-blocking operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawRequest(pub u64);

impl RawRequest {
    /// No operation attached.
    pub const NULL: RawRequest = RawRequest(0);

    /// Whether this is the null handle
    pub fn is_null(&self) -> bool {
        *self == RawRequest::NULL
    }
}

impl Default for RawRequest {
    fn default() -> Self {
        RawRequest::NULL
    }
}

/// Handle of a reduction operator.
///
/// Handles below `RawOp::FIRST_USER` name the built-in operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawOp(pub u32);

impl RawOp {
    /// No operator.
    pub const NULL: RawOp = RawOp(0);
    #[allow(missing_docs)]
    pub const MAX: RawOp = RawOp(1);
    #[allow(missing_docs)]
    pub const MIN: RawOp = RawOp(2);
    #[allow(missing_docs)]
    pub const SUM: RawOp = RawOp(3);
    #[allow(missing_docs)]
    pub const PROD: RawOp = RawOp(4);
    #[allow(missing_docs)]
    pub const LAND: RawOp = RawOp(5);
    #[allow(missing_docs)]
    pub const LOR: RawOp = RawOp(6);
    #[allow(missing_docs)]
    pub const LXOR: RawOp = RawOp(7);
    #[allow(missing_docs)]
    pub const BAND: RawOp = RawOp(8);
    #[allow(missing_docs)]
    pub const BOR: RawOp = RawOp(9);
    #[allow(missing_docs)]
    pub const BXOR: RawOp = RawOp(10);
    #[allow(missing_docs)]
    pub const MINLOC: RawOp = RawOp(11);
    #[allow(missing_docs)]
    pub const MAXLOC: RawOp = RawOp(12);
    #[allow(missing_docs)]
    pub const REPLACE: RawOp = RawOp(13);
    /// First handle handed out for registered operators.
    pub const FIRST_USER: u32 = 64;

    /// Whether this handle names a built-in operator
    pub fn is_builtin(&self) -> bool {
        self.0 > 0 && self.0 < RawOp::FIRST_USER
    }
}

/// Completion record of a transport operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawStatus {
    /// Rank the message came from
    pub source: Rank,
    /// Tag the message carried
    pub tag: Tag,
    /// Return code of the operation
    pub error: Code,
    /// Number of bytes transferred
    pub bytes: usize,
}

impl Default for RawStatus {
    fn default() -> Self {
        RawStatus {
            source: ANY_SOURCE,
            tag: ANY_TAG,
            error: SUCCESS,
            bytes: 0,
        }
    }
}

/// Element-wise combining function of a registered operator.
///
/// Called as `f(invec, inoutvec, datatype)` and must leave `inoutvec[i] = invec[i] ∘ inoutvec[i]`
/// for every element.
pub type UserFunction = Arc<dyn Fn(&[u8], &mut [u8], WireTag) + Send + Sync>;

/// A rank-addressed message-passing primitive.
///
/// All methods report failure through their return code and never panic on bad arguments.
/// Out-parameters are only meaningful when `SUCCESS` is returned.
///
/// Collective methods must be called by every rank of the group in the same order. Buffers on
/// the root of a rooted collective and on every rank of the others are sized in elements of
/// `datatype`; the transport rejects lengths that are not a whole number of elements.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Activate the transport for the calling rank.
    fn initialize(&self) -> Code;
    /// Deactivate the transport for the calling rank.
    fn finalize(&self) -> Code;
    /// Whether `initialize` has been called.
    fn initialized(&self, flag: &mut bool) -> Code;
    /// Whether `finalize` has been called.
    fn finalized(&self, flag: &mut bool) -> Code;
    /// Seconds since an arbitrary point in the past, shared by all ranks.
    fn wtime(&self) -> f64;

    /// Position of the calling rank in `comm`.
    fn comm_rank(&self, comm: RawComm, rank: &mut Rank) -> Code;
    /// Number of ranks in `comm`.
    fn comm_size(&self, comm: RawComm, size: &mut Rank) -> Code;
    /// Terminate every rank of the group.
    fn abort(&self, comm: RawComm, errorcode: Code) -> !;
    /// The class (one of the `ERR_*` constants) a return code belongs to.
    fn error_class(&self, code: Code, class: &mut Code) -> Code;
    /// Human readable description of a return code.
    fn error_string(&self, code: Code) -> String;

    /// Blocking send.
    fn send(&self, buf: &[u8], datatype: WireTag, dest: Rank, tag: Tag, comm: RawComm) -> Code;
    /// Blocking receive into `buf`, which bounds the accepted message length.
    fn recv(
        &self,
        buf: &mut [u8],
        datatype: WireTag,
        source: Rank,
        tag: Tag,
        comm: RawComm,
        status: &mut RawStatus,
    ) -> Code;
    /// Post a send. The bytes are owned by the transport once this returns.
    fn isend(
        &self,
        buf: &[u8],
        datatype: WireTag,
        dest: Rank,
        tag: Tag,
        comm: RawComm,
        request: &mut RawRequest,
    ) -> Code;
    /// Post a receive of at most `capacity` bytes. The message is copied into the buffer handed
    /// to the completing `wait` or `test`.
    fn irecv(
        &self,
        capacity: usize,
        datatype: WireTag,
        source: Rank,
        tag: Tag,
        comm: RawComm,
        request: &mut RawRequest,
    ) -> Code;
    /// Block until `request` completes; resets it to `RawRequest::NULL`.
    fn wait(&self, request: &mut RawRequest, buf: Option<&mut [u8]>, status: &mut RawStatus)
        -> Code;
    /// Complete `request` if possible without blocking; resets it to `RawRequest::NULL` when
    /// `flag` is set.
    fn test(
        &self,
        request: &mut RawRequest,
        buf: Option<&mut [u8]>,
        flag: &mut bool,
        status: &mut RawStatus,
    ) -> Code;
    /// Withdraw a pending request and release its slot; resets it to `RawRequest::NULL`.
    fn cancel(&self, request: &mut RawRequest) -> Code;
    /// Block until one of the non-null `requests` can complete, without completing it. `index`
    /// is set to the first such position, or `None` if every request is null.
    fn waitany(&self, requests: &[RawRequest], index: &mut Option<usize>) -> Code;
    /// Block until at least one of the non-null `requests` can complete, without completing any.
    /// `ready` is set to the positions of all that can, in order; it is empty if every request is
    /// null.
    fn waitsome(&self, requests: &[RawRequest], ready: &mut Vec<usize>) -> Code;

    /// Block until every rank of `comm` has entered the barrier.
    fn barrier(&self, comm: RawComm) -> Code;
    /// Replicate `buf` of `root` into `buf` of every rank.
    fn bcast(&self, buf: &mut [u8], datatype: WireTag, root: Rank, comm: RawComm) -> Code;
    /// Hand block `r` of the root's `sendbuf` to rank `r`.
    fn scatter(
        &self,
        sendbuf: Option<&[u8]>,
        recvbuf: &mut [u8],
        datatype: WireTag,
        root: Rank,
        comm: RawComm,
    ) -> Code;
    /// Concatenate every rank's `sendbuf` into the root's `recvbuf` in rank order.
    fn gather(
        &self,
        sendbuf: &[u8],
        recvbuf: Option<&mut [u8]>,
        datatype: WireTag,
        root: Rank,
        comm: RawComm,
    ) -> Code;
    /// Concatenate every rank's `sendbuf` into every rank's `recvbuf` in rank order.
    fn allgather(&self, sendbuf: &[u8], recvbuf: &mut [u8], datatype: WireTag, comm: RawComm)
        -> Code;
    /// Combine every rank's `sendbuf` under `op` into the root's `recvbuf`.
    fn reduce(
        &self,
        sendbuf: &[u8],
        recvbuf: Option<&mut [u8]>,
        datatype: WireTag,
        op: RawOp,
        root: Rank,
        comm: RawComm,
    ) -> Code;
    /// Combine every rank's `sendbuf` under `op` into every rank's `recvbuf`.
    fn allreduce(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        datatype: WireTag,
        op: RawOp,
        comm: RawComm,
    ) -> Code;
    /// Block `j` of rank `i`'s `sendbuf` becomes block `i` of rank `j`'s `recvbuf`.
    fn alltoall(&self, sendbuf: &[u8], recvbuf: &mut [u8], datatype: WireTag, comm: RawComm)
        -> Code;
    /// `inoutbuf[i] = inbuf[i] ∘ inoutbuf[i]` without communication.
    fn reduce_local(&self, inbuf: &[u8], inoutbuf: &mut [u8], datatype: WireTag, op: RawOp)
        -> Code;

    /// Register an associative operator over elements of `datatype`.
    ///
    /// Handles are local to the calling rank. In a reduction every rank passes its own
    /// registration of the same function.
    fn op_create(
        &self,
        function: UserFunction,
        datatype: WireTag,
        commute: bool,
        op: &mut RawOp,
    ) -> Code;
    /// Release a registered operator; resets it to `RawOp::NULL`.
    fn op_free(&self, op: &mut RawOp) -> Code;
    /// Whether `op` was declared commutative.
    fn op_commutative(&self, op: RawOp, commute: &mut bool) -> Code;
}

/// Text of the error classes shared by the transports in this crate.
pub(crate) fn class_description(code: Code) -> &'static str {
    match code {
        SUCCESS => "no error",
        ERR_BUFFER => "invalid buffer pointer",
        ERR_COUNT => "invalid count argument",
        ERR_TYPE => "invalid datatype",
        ERR_TAG => "invalid tag",
        ERR_COMM => "invalid communicator",
        ERR_RANK => "invalid rank",
        ERR_ROOT => "invalid root",
        ERR_OP => "invalid reduce operation",
        ERR_TRUNCATE => "message truncated",
        ERR_REQUEST => "invalid request",
        ERR_NOT_SAME => "collective arguments not identical on all ranks",
        ERR_PROC_ABORTED => "a peer rank has aborted",
        ERR_INTERN => "internal error",
        ERR_ARG => "invalid argument of some other kind",
        ERR_OTHER => "known error not in list",
        _ => "unknown error",
    }
}
