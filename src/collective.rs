//! Collective communication
//!
//! Every rank of a `Communicator` has to take part in a collective operation, in the same order as
//! all other ranks; a rank that never joins leaves the others blocked. Rooted operations
//! (broadcast, scatter, gather, reduce) name the root rank, and only the root supplies or
//! receives the root side buffer.
//!
//! Reductions combine the contributions of all ranks under an `Operation`: a built-in
//! `SystemOperation`, or a `UserOperation` defined by a closure. The result is
//! `v0 ∘ (v1 ∘ (… ∘ vn-1))` where `vi` is the contribution of rank `i`, so an operation that is
//! only associative gives the same result on every run.
//!
//! # Unfinished features
//!
//! - Varying counts operations
//! - Reduce-scatter, scan, exclusive scan
//! - Non-blocking collective operations

use std::marker::PhantomData;
use std::sync::Arc;
use std::{fmt, slice};

use conv::ConvUtil;
use log::{debug, trace, warn};

use crate::datatype::traits::*;
use crate::datatype::{bytes_of, bytes_of_mut, WireTag};
use crate::error::{Error, Result};
use crate::raw::traits::*;
use crate::topology::Communicator;
use crate::transport::{RawOp, Transport, UserFunction, SUCCESS};
use crate::Rank;

/// Collective communication traits
pub mod traits {
    pub use super::Operation;
}

impl Communicator {
    /// Barrier synchronization among all ranks of the `Communicator`
    ///
    /// Blocks until every rank has entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        trace!("barrier");
        self.check(self.transport().barrier(self.as_raw()))
    }

    /// Broadcast the contents of a buffer from `root` to all ranks.
    ///
    /// Buffers on all ranks must hold the same number of elements.
    ///
    /// # Examples
    ///
    /// See `demos/gather.rs`
    pub fn broadcast_into<B>(&self, buf: &mut B, root: Rank) -> Result<()>
    where
        B: BufferMut + ?Sized,
    {
        let datatype = buf.as_datatype();
        trace!("broadcast {} x {} from {}", buf.count(), datatype, root);
        self.check(
            self.transport()
                .bcast(buf.as_bytes_mut(), datatype, root, self.as_raw()),
        )
    }

    /// Broadcast a sequence of any length from `root`.
    ///
    /// On the other ranks `seq` is resized to the length of the root's sequence and overwritten.
    pub fn broadcast_sequence<T>(&self, seq: &mut Vec<T>, root: Rank) -> Result<()>
    where
        T: Equivalence,
    {
        let is_root = self.rank()? == root;
        let mut count: u64 = if is_root {
            seq.len()
                .value_as::<u64>()
                .map_err(|_| Error::CountOverflow(seq.len()))?
        } else {
            0
        };
        self.broadcast_into(&mut count, root)?;
        let len = count
            .value_as::<usize>()
            .map_err(|_| Error::CountOverflow(usize::MAX))?;
        debug!("broadcast sequence of {} from {}", len, root);
        if !is_root {
            seq.clear();
            seq.resize(len, T::default());
        }
        self.broadcast_into(&mut seq[..], root)
    }

    /// Broadcast text of any length from `root`.
    ///
    /// On the other ranks `text` is replaced by the root's text. If the broadcast fails, `text`
    /// is left as it was.
    pub fn broadcast_text(&self, text: &mut String, root: Rank) -> Result<()> {
        let mut bytes = text.as_bytes().to_vec();
        self.broadcast_sequence(&mut bytes, root)?;
        *text = String::from_utf8(bytes)?;
        Ok(())
    }

    /// Scatter blocks of the root's `sendbuf` to all ranks.
    ///
    /// The root passes `Some(sendbuf)` holding `recvbuf.len() * size` elements, ordered by
    /// destination rank; the other ranks pass `None`. Rank `r` receives the elements starting at
    /// `r * recvbuf.len()`.
    ///
    /// # Examples
    ///
    /// See `demos/gather.rs`
    pub fn scatter_into<T>(
        &self,
        sendbuf: Option<&[T]>,
        recvbuf: &mut [T],
        root: Rank,
    ) -> Result<()>
    where
        T: Equivalence,
    {
        trace!("scatter {} x {} from {}", recvbuf.len(), T::WIRE_TAG, root);
        self.check(self.transport().scatter(
            sendbuf.map(bytes_of),
            bytes_of_mut(recvbuf),
            T::WIRE_TAG,
            root,
            self.as_raw(),
        ))
    }

    /// Scatter one element of the root's `sendbuf` to every rank.
    pub fn scatter<T>(&self, sendbuf: Option<&[T]>, root: Rank) -> Result<T>
    where
        T: Equivalence,
    {
        let mut value = T::default();
        self.scatter_into(sendbuf, slice::from_mut(&mut value), root)?;
        Ok(value)
    }

    /// Gather the `sendbuf`s of all ranks on `root`.
    ///
    /// The root passes `Some(recvbuf)` with room for `sendbuf.len() * size` elements, which are
    /// stored in rank order; the other ranks pass `None`.
    ///
    /// # Examples
    ///
    /// See `demos/gather.rs`
    pub fn gather_into<T>(
        &self,
        sendbuf: &[T],
        recvbuf: Option<&mut [T]>,
        root: Rank,
    ) -> Result<()>
    where
        T: Equivalence,
    {
        trace!("gather {} x {} to {}", sendbuf.len(), T::WIRE_TAG, root);
        self.check(self.transport().gather(
            bytes_of(sendbuf),
            recvbuf.map(bytes_of_mut),
            T::WIRE_TAG,
            root,
            self.as_raw(),
        ))
    }

    /// Gather one value from every rank on `root`.
    ///
    /// Returns the values in rank order on the root and `None` elsewhere.
    pub fn gather<T>(&self, value: &T, root: Rank) -> Result<Option<Vec<T>>>
    where
        T: Equivalence,
    {
        if self.rank()? == root {
            let mut all = vec![T::default(); self.len()?];
            self.gather_into(slice::from_ref(value), Some(&mut all[..]), root)?;
            Ok(Some(all))
        } else {
            self.gather_into(slice::from_ref(value), None, root)?;
            Ok(None)
        }
    }

    /// Gather the `sendbuf`s of all ranks on all ranks.
    ///
    /// `recvbuf` must have room for `sendbuf.len() * size` elements, which are stored in rank
    /// order.
    pub fn all_gather_into<T>(&self, sendbuf: &[T], recvbuf: &mut [T]) -> Result<()>
    where
        T: Equivalence,
    {
        trace!("all-gather {} x {}", sendbuf.len(), T::WIRE_TAG);
        self.check(self.transport().allgather(
            bytes_of(sendbuf),
            bytes_of_mut(recvbuf),
            T::WIRE_TAG,
            self.as_raw(),
        ))
    }

    /// Gather one value from every rank on every rank, in rank order.
    pub fn all_gather<T>(&self, value: &T) -> Result<Vec<T>>
    where
        T: Equivalence,
    {
        let mut all = vec![T::default(); self.len()?];
        self.all_gather_into(slice::from_ref(value), &mut all)?;
        Ok(all)
    }

    /// Combine the `sendbuf`s of all ranks element-wise under `op` on `root`.
    ///
    /// The root passes `Some(recvbuf)` of the same length as `sendbuf`; the other ranks pass
    /// `None`.
    ///
    /// # Examples
    ///
    /// See `demos/reduce.rs`
    pub fn reduce_into<T, O>(
        &self,
        sendbuf: &[T],
        recvbuf: Option<&mut [T]>,
        op: O,
        root: Rank,
    ) -> Result<()>
    where
        T: Equivalence,
        O: Operation<T>,
    {
        trace!(
            "reduce {} x {} to {} under {:?}",
            sendbuf.len(),
            T::WIRE_TAG,
            root,
            op.as_raw()
        );
        self.check(self.transport().reduce(
            bytes_of(sendbuf),
            recvbuf.map(bytes_of_mut),
            T::WIRE_TAG,
            op.as_raw(),
            root,
            self.as_raw(),
        ))
    }

    /// Combine one value from every rank under `op` on `root`.
    ///
    /// Returns the result on the root and `None` elsewhere.
    pub fn reduce<T, O>(&self, value: T, op: O, root: Rank) -> Result<Option<T>>
    where
        T: Equivalence,
        O: Operation<T>,
    {
        if self.rank()? == root {
            let mut result = T::default();
            self.reduce_into(
                slice::from_ref(&value),
                Some(slice::from_mut(&mut result)),
                op,
                root,
            )?;
            Ok(Some(result))
        } else {
            self.reduce_into(slice::from_ref(&value), None, op, root)?;
            Ok(None)
        }
    }

    /// Combine the `sendbuf`s of all ranks element-wise under `op` on all ranks.
    ///
    /// # Examples
    ///
    /// See `demos/reduce.rs`
    pub fn all_reduce_into<T, O>(&self, sendbuf: &[T], recvbuf: &mut [T], op: O) -> Result<()>
    where
        T: Equivalence,
        O: Operation<T>,
    {
        trace!(
            "all-reduce {} x {} under {:?}",
            sendbuf.len(),
            T::WIRE_TAG,
            op.as_raw()
        );
        self.check(self.transport().allreduce(
            bytes_of(sendbuf),
            bytes_of_mut(recvbuf),
            T::WIRE_TAG,
            op.as_raw(),
            self.as_raw(),
        ))
    }

    /// Combine one value from every rank under `op` on every rank.
    pub fn all_reduce<T, O>(&self, value: T, op: O) -> Result<T>
    where
        T: Equivalence,
        O: Operation<T>,
    {
        let mut result = T::default();
        self.all_reduce_into(slice::from_ref(&value), slice::from_mut(&mut result), op)?;
        Ok(result)
    }

    /// Exchange blocks between all ranks.
    ///
    /// Both buffers hold `size` blocks of `sendbuf.len() / size` elements. Block `j` of rank
    /// `i`'s `sendbuf` ends up as block `i` of rank `j`'s `recvbuf`.
    pub fn all_to_all_into<T>(&self, sendbuf: &[T], recvbuf: &mut [T]) -> Result<()>
    where
        T: Equivalence,
    {
        trace!("all-to-all {} x {}", sendbuf.len(), T::WIRE_TAG);
        self.check(self.transport().alltoall(
            bytes_of(sendbuf),
            bytes_of_mut(recvbuf),
            T::WIRE_TAG,
            self.as_raw(),
        ))
    }
}

/// An operation to be used in a reduction over elements of type `T`, e.g. a sum
pub trait Operation<T>: RawOperation {
    /// Returns whether the operation is commutative.
    fn is_commutative(&self) -> bool;
}

impl<'a, T, O: 'a + Operation<T>> Operation<T> for &'a O {
    fn is_commutative(&self) -> bool {
        (**self).is_commutative()
    }
}

/// A built-in operation like a sum
///
/// Which types an operation applies to is decided by the transport when the operation is used:
/// arithmetic operations need numbers, bitwise operations integers and `Byte`, logical operations
/// integers and `bool`, and `min_loc()`/`max_loc()` need `ValueIndex` pairs. Anything else fails
/// with an `ErrorKind::Op` error.
///
/// # Examples
///
/// See `demos/reduce.rs`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SystemOperation(RawOp);

macro_rules! system_operation_constructors {
    ($($ctor:ident => $val:path),*) => (
        $(pub fn $ctor() -> SystemOperation {
            //! A built-in operation
            SystemOperation($val)
        })*
    )
}

impl SystemOperation {
    system_operation_constructors! {
        max => RawOp::MAX,
        min => RawOp::MIN,
        sum => RawOp::SUM,
        product => RawOp::PROD,
        logical_and => RawOp::LAND,
        bitwise_and => RawOp::BAND,
        logical_or => RawOp::LOR,
        bitwise_or => RawOp::BOR,
        logical_xor => RawOp::LXOR,
        bitwise_xor => RawOp::BXOR,
        min_loc => RawOp::MINLOC,
        max_loc => RawOp::MAXLOC,
        replace => RawOp::REPLACE
    }
}

impl AsRaw for SystemOperation {
    type Raw = RawOp;
    fn as_raw(&self) -> Self::Raw {
        self.0
    }
}

impl RawOperation for SystemOperation {}

impl<T: Equivalence> Operation<T> for SystemOperation {
    fn is_commutative(&self) -> bool {
        true
    }
}

/// A user-defined operation over elements of type `T`.
///
/// The closure is registered with the transport, which keeps it alive as long as a reduction
/// uses it. Dropping the `UserOperation` releases the registration. A `UserOperation<T>` is only
/// an `Operation<T>`, so it cannot be applied to elements of another type.
///
/// # Examples
///
/// See `demos/reduce.rs`
pub struct UserOperation<T> {
    op: RawOp,
    commute: bool,
    transport: Arc<dyn Transport>,
    phantom: PhantomData<fn(&T, &T) -> T>,
}

impl<T: Equivalence> UserOperation<T> {
    /// Define an operation using a closure. The operation must be associative.
    ///
    /// Shorthand for `new(comm, false, function)`.
    pub fn associative<F>(comm: &Communicator, function: F) -> Result<Self>
    where
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        Self::new(comm, false, function)
    }

    /// Define an operation using a closure. The operation must be both associative and
    /// commutative.
    ///
    /// Shorthand for `new(comm, true, function)`.
    pub fn commutative<F>(comm: &Communicator, function: F) -> Result<Self>
    where
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        Self::new(comm, true, function)
    }

    /// Creates an associative and possibly commutative operation using a closure.
    ///
    /// In a reduction the closure is called as `function(a, b)`, where `a` comes from a lower rank
    /// than `b`. It must be associative; `commute` declares whether it is also commutative.
    ///
    /// The operation is registered with the transport of `comm`.
    pub fn new<F>(comm: &Communicator, commute: bool, function: F) -> Result<Self>
    where
        F: Fn(&T, &T) -> T + Send + Sync + 'static,
    {
        let wrapper: UserFunction =
            Arc::new(move |invec: &[u8], inoutvec: &mut [u8], _: WireTag| {
                elementwise::<T, F>(&function, invec, inoutvec)
            });
        let mut op = RawOp::NULL;
        comm.check(
            comm.transport()
                .op_create(wrapper, T::WIRE_TAG, commute, &mut op),
        )?;
        debug!("registered {:?} over {}", op, T::WIRE_TAG);
        Ok(UserOperation {
            op,
            commute,
            transport: Arc::clone(comm.transport()),
            phantom: PhantomData,
        })
    }
}

/// `inoutvec[i] = function(invec[i], inoutvec[i])` over the bytes of `T`s.
fn elementwise<T, F>(function: &F, invec: &[u8], inoutvec: &mut [u8])
where
    T: Equivalence,
    F: Fn(&T, &T) -> T,
{
    let width = T::WIRE_TAG.size();
    let n = invec.len().min(inoutvec.len()) / width;
    let mut a = vec![T::default(); n];
    let mut b = vec![T::default(); n];
    bytes_of_mut(&mut a).copy_from_slice(&invec[..n * width]);
    bytes_of_mut(&mut b).copy_from_slice(&inoutvec[..n * width]);
    for (x, y) in a.iter().zip(b.iter_mut()) {
        *y = function(x, y);
    }
    inoutvec[..n * width].copy_from_slice(bytes_of(&b));
}

impl<T> fmt::Debug for UserOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("UserOperation").field(&self.op).finish()
    }
}

impl<T> Drop for UserOperation<T> {
    fn drop(&mut self) {
        let code = self.transport.op_free(&mut self.op);
        if code != SUCCESS {
            warn!("releasing {:?} failed with code {}", self.op, code);
        }
    }
}

impl<T> AsRaw for UserOperation<T> {
    type Raw = RawOp;
    fn as_raw(&self) -> Self::Raw {
        self.op
    }
}

impl<T> RawOperation for UserOperation<T> {}

impl<T: Equivalence> Operation<T> for UserOperation<T> {
    fn is_commutative(&self) -> bool {
        let mut commute = self.commute;
        if self.transport.op_commutative(self.op, &mut commute) != SUCCESS {
            return self.commute;
        }
        commute
    }
}

/// Perform a local reduction, `inoutbuf[i] = inbuf[i] ∘ inoutbuf[i]`, without communication.
///
/// `comm` names the transport that evaluates the operation.
///
/// # Examples
///
/// See `demos/reduce.rs`
pub fn reduce_local_into<T, O>(
    comm: &Communicator,
    inbuf: &[T],
    inoutbuf: &mut [T],
    op: O,
) -> Result<()>
where
    T: Equivalence,
    O: Operation<T>,
{
    comm.check(comm.transport().reduce_local(
        bytes_of(inbuf),
        bytes_of_mut(inoutbuf),
        T::WIRE_TAG,
        op.as_raw(),
    ))
}
