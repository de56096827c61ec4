//! An in-process fabric where every rank is a thread
//!
//! A `LocalFabric` of `n` ranks hands out one `Endpoint` per rank. Endpoints implement
//! `Transport` on top of shared memory. Messages are copied at the time they are sent, so sends
//! never block. Receives and collectives block on a condition variable until their data is
//! there.
//!
//! Most of the time the fabric is driven through `run`, which starts one named thread per rank,
//! initializes the environment on each of them and hands the rank's `Universe` to a closure:
//!
//! ```
//! use mpi_typed::collective::SystemOperation;
//! use mpi_typed::traits::*;
//!
//! let sums = mpi_typed::transport::local::run(4, |universe| {
//!     let world = universe.world();
//!     let rank = world.rank().unwrap();
//!     world.all_reduce(rank, &SystemOperation::sum()).unwrap()
//! })
//! .unwrap();
//! assert_eq!(sums, vec![6; 4]);
//! ```
//!
//! If a rank panics, the fabric is poisoned. Every call that is blocked, and every call made
//! afterwards, fails with `ERR_PROC_ABORTED`, and `run` re-raises the panic once all ranks have
//! stopped.
//!
//! # Unfinished features
//!
//! - Communicators other than the world group
//! - Synchronous and ready send modes

mod mailbox;
mod rendezvous;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use conv::ConvUtil;
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use self::mailbox::{Envelope, Mailbox, Posted};
use self::rendezvous::{resolve, Combiner, Contribution, Kind, Rendezvous};
use crate::datatype::WireTag;
use crate::environment::{self, Universe};
use crate::error::{Error, Result};
use crate::transport::{
    class_description, Code, RawComm, RawOp, RawRequest, RawStatus, Transport, UserFunction,
    ANY_SOURCE, ANY_TAG, ERR_BUFFER, ERR_COMM, ERR_COUNT, ERR_INTERN, ERR_LASTCODE, ERR_OP,
    ERR_OTHER, ERR_PROC_ABORTED, ERR_RANK, ERR_REQUEST, ERR_ROOT, ERR_TAG, ERR_TRUNCATE,
    ERR_TYPE, ERR_UNKNOWN, SUCCESS,
};
use crate::{Rank, Tag};

/// Failure of a fabric call, as a transport return code
type Checked<T> = std::result::Result<T, Code>;

fn code(result: Checked<()>) -> Code {
    result.err().unwrap_or(SUCCESS)
}

fn first_error<const N: usize>(checks: [Checked<()>; N]) -> Code {
    checks.into_iter().find_map(|c| c.err()).unwrap_or(SUCCESS)
}

/// Settings of a fabric and the threads `run` starts on it.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    /// Number of ranks
    pub size: usize,
    /// Rank threads are named `<prefix>-<rank>`
    pub thread_name_prefix: String,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig::new(1)
    }
}

impl FabricConfig {
    /// A fabric of `size` ranks, run on threads named `rank-<rank>`
    pub fn new(size: usize) -> Self {
        FabricConfig {
            size,
            thread_name_prefix: "rank".to_owned(),
        }
    }

    /// Change the prefix of the rank thread names.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Create the fabric without starting any threads.
    pub fn build(&self) -> Result<LocalFabric> {
        LocalFabric::new(self.size)
    }

    /// Run `f` once per rank, each on its own thread, and collect the results in rank order.
    ///
    /// Every thread initializes the environment with its rank's endpoint before calling `f`, and
    /// the environment is finalized when `f` drops the `Universe`.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic of any rank after all rank threads have stopped.
    pub fn run<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(Universe) -> R + Sync,
        R: Send,
    {
        let fabric = self.build()?;
        let first_panic: Mutex<Option<usize>> = Mutex::new(None);

        let outcomes = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.size);
            let endpoints = (0..self.size).filter_map(|index| fabric.endpoint(index));
            for (index, endpoint) in endpoints.enumerate() {
                let (f, fabric, first_panic) = (&f, &fabric, &first_panic);
                let handle = thread::Builder::new()
                    .name(format!("{}-{}", self.thread_name_prefix, index))
                    .spawn_scoped(scope, move || {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            environment::initialize(Arc::new(endpoint)).map(f)
                        }));
                        if outcome.is_err() {
                            first_panic.lock().get_or_insert(index);
                            fabric.poison();
                        }
                        outcome
                    })
                    .map_err(|e| {
                        fabric.poison();
                        Error::Spawn(e)
                    })?;
                handles.push(handle);
            }
            Ok::<_, Error>(
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_else(Err))
                    .collect::<Vec<_>>(),
            )
        })?;

        let first_panic = first_panic.into_inner();
        let mut failure = None;
        let mut results = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(result) => results.push(result),
                Err(payload) => {
                    if failure.is_none() || first_panic == Some(index) {
                        failure = Some(payload);
                    }
                }
            }
        }
        if let Some(payload) = failure {
            panic::resume_unwind(payload);
        }
        results.into_iter().collect()
    }
}

/// Run `f` on a fresh fabric of `size` ranks.
///
/// Short for `FabricConfig::new(size).run(f)`.
pub fn run<F, R>(size: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(Universe) -> R + Sync,
    R: Send,
{
    FabricConfig::new(size).run(f)
}

struct Shared {
    size: usize,
    start: Instant,
    state: Mutex<State>,
    signal: Condvar,
}

enum Slot {
    Send {
        owner: usize,
        dest: usize,
        status: RawStatus,
    },
    Receive {
        owner: usize,
        capacity: usize,
        datatype: WireTag,
        message: Option<Envelope>,
    },
}

impl Slot {
    fn owner(&self) -> usize {
        match *self {
            Slot::Send { owner, .. } | Slot::Receive { owner, .. } => owner,
        }
    }

    fn is_done(&self) -> bool {
        !matches!(self, Slot::Receive { message: None, .. })
    }
}

struct Registered {
    function: UserFunction,
    datatype: WireTag,
    commute: bool,
}

struct State {
    poisoned: bool,
    mailboxes: Vec<Mailbox>,
    requests: HashMap<u64, Slot>,
    next_request: u64,
    /// Registered operators of every rank
    operators: Vec<HashMap<u32, Registered>>,
    next_operator: Vec<u32>,
    rendezvous: Rendezvous,
    initialized: Vec<bool>,
    finalized: Vec<bool>,
}

impl State {
    fn new(size: usize) -> Self {
        State {
            poisoned: false,
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            requests: HashMap::new(),
            next_request: 1,
            operators: (0..size).map(|_| HashMap::new()).collect(),
            next_operator: vec![RawOp::FIRST_USER; size],
            rendezvous: Rendezvous::new(size),
            initialized: vec![false; size],
            finalized: vec![false; size],
        }
    }

    fn allocate(&mut self, slot: Slot) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        self.requests.insert(id, slot);
        id
    }

    /// Hand a matched message to the receive request waiting for it.
    fn attach(&mut self, request: u64, envelope: Envelope) {
        if let Some(Slot::Receive { message, .. }) = self.requests.get_mut(&request) {
            *message = Some(envelope);
        }
    }

    fn deliver(&mut self, dest: usize, envelope: Envelope) {
        if let Some((request, envelope)) = self.mailboxes[dest].deliver(envelope) {
            self.attach(request, envelope);
        }
    }

    /// Forget the dropped receive `request` of rank `index`. A message it had matched goes back
    /// ahead of the messages waiting at that rank.
    fn release_receive(&mut self, index: usize, request: u64, message: Option<Envelope>) {
        match message {
            Some(envelope) => {
                if let Some((other, envelope)) = self.mailboxes[index].redeliver(envelope) {
                    self.attach(other, envelope);
                }
            }
            None => {
                self.mailboxes[index].withdraw(request);
            }
        }
    }

    /// How `op`, as registered by rank `index`, combines buffers.
    fn combiner(&self, index: usize, op: RawOp) -> Combiner {
        if op.is_builtin() {
            return Combiner::Builtin(op);
        }
        match self.operators[index].get(&op.0) {
            Some(registered) => Combiner::User {
                function: Arc::clone(&registered.function),
                datatype: registered.datatype,
            },
            None => Combiner::Invalid,
        }
    }
}

/// A group of ranks living in this process.
#[derive(Clone)]
pub struct LocalFabric {
    shared: Arc<Shared>,
}

impl LocalFabric {
    /// A fabric of `size` ranks
    pub fn new(size: usize) -> Result<Self> {
        size.value_as::<Rank>()
            .map_err(|_| Error::CountOverflow(size))?;
        debug!("creating local fabric of {} ranks", size);
        Ok(LocalFabric {
            shared: Arc::new(Shared {
                size,
                start: Instant::now(),
                state: Mutex::new(State::new(size)),
                signal: Condvar::new(),
            }),
        })
    }

    /// Number of ranks
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// The endpoint of rank `index`, if the fabric has that many ranks.
    pub fn endpoint(&self, index: usize) -> Option<Endpoint> {
        if index >= self.shared.size {
            return None;
        }
        Some(Endpoint {
            shared: Arc::clone(&self.shared),
            index,
            rank: index.value_as::<Rank>().ok()?,
        })
    }

    /// Fail every blocked and every future call on this fabric with `ERR_PROC_ABORTED`.
    pub fn poison(&self) {
        self.shared.state.lock().poisoned = true;
        self.shared.signal.notify_all();
    }

    /// Whether `poison` has been called
    pub fn is_poisoned(&self) -> bool {
        self.shared.state.lock().poisoned
    }
}

impl fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LocalFabric")
            .field("size", &self.shared.size)
            .finish()
    }
}

/// One rank's view of a `LocalFabric`.
pub struct Endpoint {
    shared: Arc<Shared>,
    index: usize,
    rank: Rank,
}

impl Endpoint {
    /// The rank this endpoint sends from
    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn lock(&self) -> Checked<MutexGuard<'_, State>> {
        let state = self.shared.state.lock();
        if state.poisoned {
            return Err(ERR_PROC_ABORTED);
        }
        Ok(state)
    }

    fn wait_for_signal(&self, state: &mut MutexGuard<'_, State>) -> Checked<()> {
        if state.poisoned {
            return Err(ERR_PROC_ABORTED);
        }
        self.shared.signal.wait(state);
        if state.poisoned {
            return Err(ERR_PROC_ABORTED);
        }
        Ok(())
    }

    fn check_comm(&self, comm: RawComm) -> Checked<()> {
        if comm == RawComm::WORLD {
            Ok(())
        } else {
            Err(ERR_COMM)
        }
    }

    fn check_peer(&self, rank: Rank) -> Checked<usize> {
        usize::try_from(rank)
            .ok()
            .filter(|&r| r < self.shared.size)
            .ok_or(ERR_RANK)
    }

    fn check_source(&self, source: Rank) -> Checked<()> {
        if source == ANY_SOURCE {
            return Ok(());
        }
        self.check_peer(source).map(drop)
    }

    fn check_root(&self, root: Rank) -> Checked<()> {
        self.check_peer(root).map(drop).map_err(|_| ERR_ROOT)
    }

    fn check_tag(&self, tag: Tag, wildcard: bool) -> Checked<()> {
        if tag >= 0 || (wildcard && tag == ANY_TAG) {
            Ok(())
        } else {
            Err(ERR_TAG)
        }
    }

    /// `op` is built in or registered by this rank.
    fn check_op(&self, op: RawOp) -> Checked<()> {
        if op.is_builtin() {
            return Ok(());
        }
        if self.lock()?.operators[self.index].contains_key(&op.0) {
            Ok(())
        } else {
            Err(ERR_OP)
        }
    }

    fn check_elements(&self, bytes: usize, datatype: WireTag) -> Checked<()> {
        if bytes % datatype.size() == 0 {
            Ok(())
        } else {
            Err(ERR_COUNT)
        }
    }

    /// Queue a copy of `buf` at `dest`. Immediate sends get a request, blocking ones `0`.
    fn post_send(
        &self,
        buf: &[u8],
        datatype: WireTag,
        dest: Rank,
        tag: Tag,
        immediate: bool,
    ) -> Checked<u64> {
        self.check_elements(buf.len(), datatype)?;
        let index = self.check_peer(dest)?;
        self.check_tag(tag, false)?;

        let mut state = self.lock()?;
        let request = if !immediate {
            0
        } else {
            state.allocate(Slot::Send {
                owner: self.index,
                dest: index,
                status: RawStatus {
                    source: self.rank,
                    tag,
                    error: SUCCESS,
                    bytes: buf.len(),
                },
            })
        };
        trace!(
            "rank {} sends {} bytes of {} to {} with tag {}",
            self.rank,
            buf.len(),
            datatype,
            dest,
            tag
        );
        state.deliver(
            index,
            Envelope {
                sender: request,
                source: self.rank,
                tag,
                datatype,
                payload: buf.to_vec(),
            },
        );
        self.shared.signal.notify_all();
        Ok(request)
    }

    fn post_receive(
        &self,
        state: &mut State,
        capacity: usize,
        datatype: WireTag,
        source: Rank,
        tag: Tag,
    ) -> u64 {
        let request = state.allocate(Slot::Receive {
            owner: self.index,
            capacity,
            datatype,
            message: None,
        });
        if let Some(envelope) = state.mailboxes[self.index].post(Posted {
            request,
            source,
            tag,
        }) {
            state.attach(request, envelope);
        }
        request
    }

    /// Finish `request` if its operation is done, blocking until it is when `block` is set.
    /// Returns whether the request was finished.
    fn finish(
        &self,
        state: &mut MutexGuard<'_, State>,
        request: u64,
        buf: Option<&mut [u8]>,
        block: bool,
        status: &mut RawStatus,
    ) -> Checked<bool> {
        loop {
            let done = match state.requests.get(&request) {
                Some(slot) if slot.owner() == self.index => slot.is_done(),
                _ => return Err(ERR_REQUEST),
            };
            if done {
                break;
            }
            if !block {
                return Ok(false);
            }
            self.wait_for_signal(state)?;
        }

        if let Some(Slot::Receive { capacity, .. }) = state.requests.get(&request) {
            if buf.as_ref().map(|b| b.len()) != Some(*capacity) {
                return Err(ERR_BUFFER);
            }
        }

        match state.requests.remove(&request) {
            Some(Slot::Send { status: sent, .. }) => {
                *status = sent;
                Ok(true)
            }
            Some(Slot::Receive {
                capacity,
                datatype,
                message: Some(envelope),
                ..
            }) => {
                let buf = buf.ok_or(ERR_BUFFER)?;
                status.source = envelope.source;
                status.tag = envelope.tag;
                if envelope.datatype != datatype {
                    debug!(
                        "rank {} expected {} but received {} from {}",
                        self.rank, datatype, envelope.datatype, envelope.source
                    );
                    status.error = ERR_TYPE;
                    status.bytes = 0;
                    return Err(ERR_TYPE);
                }
                let len = envelope.payload.len();
                if len > capacity {
                    buf.copy_from_slice(&envelope.payload[..capacity]);
                    status.error = ERR_TRUNCATE;
                    status.bytes = capacity;
                    return Err(ERR_TRUNCATE);
                }
                buf[..len].copy_from_slice(&envelope.payload);
                status.error = SUCCESS;
                status.bytes = len;
                trace!(
                    "rank {} received {} bytes from {} with tag {}",
                    self.rank,
                    len,
                    envelope.source,
                    envelope.tag
                );
                Ok(true)
            }
            _ => Err(ERR_INTERN),
        }
    }

    fn complete(
        &self,
        request: &mut RawRequest,
        buf: Option<&mut [u8]>,
        block: bool,
        status: &mut RawStatus,
    ) -> Checked<bool> {
        if request.is_null() {
            *status = RawStatus::default();
            return Ok(true);
        }
        let mut state = self.lock()?;
        let result = self.finish(&mut state, request.0, buf, block, status);
        if !state.requests.contains_key(&request.0) {
            *request = RawRequest::NULL;
        }
        result
    }

    /// Positions of the non-null `requests` whose operation is done, blocking until there is
    /// at least one.
    fn await_ready(&self, requests: &[RawRequest]) -> Checked<Vec<usize>> {
        let mut state = self.lock()?;
        loop {
            let mut active = false;
            let mut ready = Vec::new();
            for (index, request) in requests.iter().enumerate() {
                if request.is_null() {
                    continue;
                }
                active = true;
                match state.requests.get(&request.0) {
                    Some(slot) if slot.owner() == self.index => {
                        if slot.is_done() {
                            ready.push(index);
                        }
                    }
                    _ => return Err(ERR_REQUEST),
                }
            }
            if !active || !ready.is_empty() {
                return Ok(ready);
            }
            self.wait_for_signal(&mut state)?;
        }
    }

    /// Take part in a collective round and copy this rank's share into `recvbuf`.
    fn exchange(
        &self,
        comm: RawComm,
        contribution: Contribution,
        recvbuf: Option<&mut [u8]>,
    ) -> Checked<()> {
        self.check_comm(comm)?;
        let kind = contribution.kind;
        let mut state = self.lock()?;

        if let Some(round) = state.rendezvous.arrive(self.index, contribution) {
            let combiner = state.combiner(0, round[0].op);
            let outcomes = MutexGuard::unlocked(&mut state, || resolve(&round, &combiner));
            debug!("rank {} completed {:?} round", self.rank, kind);
            state.rendezvous.publish(outcomes);
            self.shared.signal.notify_all();
        }

        let outcome = loop {
            if let Some(outcome) = state.rendezvous.take(self.index) {
                break outcome;
            }
            self.wait_for_signal(&mut state)?;
        };
        drop(state);

        if outcome.code != SUCCESS {
            return Err(outcome.code);
        }
        match (outcome.data, recvbuf) {
            (None, _) => Ok(()),
            (Some(data), Some(buf)) if data.len() == buf.len() => {
                buf.copy_from_slice(&data);
                Ok(())
            }
            (Some(_), _) => Err(ERR_INTERN),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl Transport for Endpoint {
    fn initialize(&self) -> Code {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(code) => return code,
        };
        if state.initialized[self.index] {
            return ERR_OTHER;
        }
        state.initialized[self.index] = true;
        SUCCESS
    }

    fn finalize(&self) -> Code {
        let mut state = self.shared.state.lock();
        if !state.initialized[self.index] || state.finalized[self.index] {
            return ERR_OTHER;
        }
        state.finalized[self.index] = true;
        SUCCESS
    }

    fn initialized(&self, flag: &mut bool) -> Code {
        *flag = self.shared.state.lock().initialized[self.index];
        SUCCESS
    }

    fn finalized(&self, flag: &mut bool) -> Code {
        *flag = self.shared.state.lock().finalized[self.index];
        SUCCESS
    }

    fn wtime(&self) -> f64 {
        self.shared.start.elapsed().as_secs_f64()
    }

    fn comm_rank(&self, comm: RawComm, rank: &mut Rank) -> Code {
        code(self.check_comm(comm).map(|()| *rank = self.rank))
    }

    fn comm_size(&self, comm: RawComm, size: &mut Rank) -> Code {
        code(self.check_comm(comm).and_then(|()| {
            *size = self.shared.size.value_as::<Rank>().map_err(|_| ERR_INTERN)?;
            Ok(())
        }))
    }

    fn abort(&self, comm: RawComm, errorcode: Code) -> ! {
        error!(
            "rank {} aborts {:?} with code {}",
            self.rank, comm, errorcode
        );
        eprintln!(
            "rank {} aborted the group: {} ({})",
            self.rank,
            class_description(errorcode),
            errorcode
        );
        process::exit(if errorcode == SUCCESS { 1 } else { errorcode })
    }

    fn error_class(&self, code: Code, class: &mut Code) -> Code {
        *class = if (SUCCESS..=ERR_LASTCODE).contains(&code) {
            code
        } else {
            ERR_UNKNOWN
        };
        SUCCESS
    }

    fn error_string(&self, code: Code) -> String {
        class_description(code).to_owned()
    }

    fn send(&self, buf: &[u8], datatype: WireTag, dest: Rank, tag: Tag, comm: RawComm) -> Code {
        code(
            self.check_comm(comm)
                .and_then(|()| self.post_send(buf, datatype, dest, tag, false))
                .map(drop),
        )
    }

    fn recv(
        &self,
        buf: &mut [u8],
        datatype: WireTag,
        source: Rank,
        tag: Tag,
        comm: RawComm,
        status: &mut RawStatus,
    ) -> Code {
        let checks = first_error([
            self.check_comm(comm),
            self.check_source(source),
            self.check_tag(tag, true),
            self.check_elements(buf.len(), datatype),
        ]);
        if checks != SUCCESS {
            return checks;
        }
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(code) => return code,
        };
        let request = self.post_receive(&mut state, buf.len(), datatype, source, tag);
        let result = self.finish(&mut state, request, Some(buf), true, status);
        if result.is_err() {
            if let Some(Slot::Receive { message, .. }) = state.requests.remove(&request) {
                state.release_receive(self.index, request, message);
            }
        }
        code(result.map(drop))
    }

    fn isend(
        &self,
        buf: &[u8],
        datatype: WireTag,
        dest: Rank,
        tag: Tag,
        comm: RawComm,
        request: &mut RawRequest,
    ) -> Code {
        code(
            self.check_comm(comm)
                .and_then(|()| self.post_send(buf, datatype, dest, tag, true))
                .map(|id| *request = RawRequest(id)),
        )
    }

    fn irecv(
        &self,
        capacity: usize,
        datatype: WireTag,
        source: Rank,
        tag: Tag,
        comm: RawComm,
        request: &mut RawRequest,
    ) -> Code {
        let checks = first_error([
            self.check_comm(comm),
            self.check_source(source),
            self.check_tag(tag, true),
            self.check_elements(capacity, datatype),
        ]);
        if checks != SUCCESS {
            return checks;
        }
        match self.lock() {
            Ok(mut state) => {
                let id = self.post_receive(&mut state, capacity, datatype, source, tag);
                *request = RawRequest(id);
                SUCCESS
            }
            Err(code) => code,
        }
    }

    fn wait(
        &self,
        request: &mut RawRequest,
        buf: Option<&mut [u8]>,
        status: &mut RawStatus,
    ) -> Code {
        code(self.complete(request, buf, true, status).map(drop))
    }

    fn test(
        &self,
        request: &mut RawRequest,
        buf: Option<&mut [u8]>,
        flag: &mut bool,
        status: &mut RawStatus,
    ) -> Code {
        code(
            self.complete(request, buf, false, status)
                .map(|done| *flag = done),
        )
    }

    fn cancel(&self, request: &mut RawRequest) -> Code {
        if request.is_null() {
            return SUCCESS;
        }
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(code) => return code,
        };
        match state.requests.get(&request.0) {
            Some(slot) if slot.owner() == self.index => {}
            _ => return ERR_REQUEST,
        }
        match state.requests.remove(&request.0) {
            Some(Slot::Send { dest, .. }) => {
                if state.mailboxes[dest].recall(request.0).is_some() {
                    debug!("rank {} withdrew an unmatched send to {}", self.rank, dest);
                }
            }
            Some(Slot::Receive { message, .. }) => {
                state.release_receive(self.index, request.0, message);
            }
            None => return ERR_REQUEST,
        }
        *request = RawRequest::NULL;
        self.shared.signal.notify_all();
        SUCCESS
    }

    fn waitany(&self, requests: &[RawRequest], index: &mut Option<usize>) -> Code {
        code(
            self.await_ready(requests)
                .map(|ready| *index = ready.first().copied()),
        )
    }

    fn waitsome(&self, requests: &[RawRequest], ready: &mut Vec<usize>) -> Code {
        code(self.await_ready(requests).map(|found| *ready = found))
    }

    fn barrier(&self, comm: RawComm) -> Code {
        code(self.exchange(
            comm,
            Contribution::new(Kind::Barrier, 0, WireTag::Byte),
            None,
        ))
    }

    fn bcast(&self, buf: &mut [u8], datatype: WireTag, root: Rank, comm: RawComm) -> Code {
        let mut contribution = Contribution::new(Kind::Broadcast, root, datatype);
        contribution.status = first_error([
            self.check_root(root),
            self.check_elements(buf.len(), datatype),
        ]);
        if root == self.rank {
            contribution.data = buf.to_vec();
        }
        contribution.capacity = buf.len();
        code(self.exchange(comm, contribution, Some(buf)))
    }

    fn scatter(
        &self,
        sendbuf: Option<&[u8]>,
        recvbuf: &mut [u8],
        datatype: WireTag,
        root: Rank,
        comm: RawComm,
    ) -> Code {
        let mut contribution = Contribution::new(Kind::Scatter, root, datatype);
        let is_root = root == self.rank;
        contribution.status = first_error([
            self.check_root(root),
            self.check_elements(recvbuf.len(), datatype),
            if is_root && sendbuf.is_none() {
                Err(ERR_BUFFER)
            } else {
                Ok(())
            },
        ]);
        if let (true, Some(sendbuf)) = (is_root, sendbuf) {
            contribution.data = sendbuf.to_vec();
        }
        contribution.capacity = recvbuf.len();
        code(self.exchange(comm, contribution, Some(recvbuf)))
    }

    fn gather(
        &self,
        sendbuf: &[u8],
        recvbuf: Option<&mut [u8]>,
        datatype: WireTag,
        root: Rank,
        comm: RawComm,
    ) -> Code {
        let mut contribution = Contribution::new(Kind::Gather, root, datatype);
        contribution.status = first_error([
            self.check_root(root),
            self.check_elements(sendbuf.len(), datatype),
            if root == self.rank && recvbuf.is_none() {
                Err(ERR_BUFFER)
            } else {
                Ok(())
            },
        ]);
        contribution.data = sendbuf.to_vec();
        if root == self.rank {
            contribution.capacity = recvbuf.as_ref().map_or(0, |b| b.len());
        }
        code(self.exchange(comm, contribution, recvbuf))
    }

    fn allgather(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        datatype: WireTag,
        comm: RawComm,
    ) -> Code {
        let mut contribution = Contribution::new(Kind::AllGather, 0, datatype);
        contribution.status = self
            .check_elements(sendbuf.len(), datatype)
            .err()
            .unwrap_or(SUCCESS);
        contribution.data = sendbuf.to_vec();
        contribution.capacity = recvbuf.len();
        code(self.exchange(comm, contribution, Some(recvbuf)))
    }

    fn reduce(
        &self,
        sendbuf: &[u8],
        recvbuf: Option<&mut [u8]>,
        datatype: WireTag,
        op: RawOp,
        root: Rank,
        comm: RawComm,
    ) -> Code {
        let mut contribution = Contribution::new(Kind::Reduce, root, datatype);
        contribution.status = first_error([
            self.check_root(root),
            self.check_op(op),
            self.check_elements(sendbuf.len(), datatype),
            if root == self.rank && recvbuf.is_none() {
                Err(ERR_BUFFER)
            } else {
                Ok(())
            },
        ]);
        contribution.op = op;
        contribution.data = sendbuf.to_vec();
        if root == self.rank {
            contribution.capacity = recvbuf.as_ref().map_or(0, |b| b.len());
        }
        code(self.exchange(comm, contribution, recvbuf))
    }

    fn allreduce(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        datatype: WireTag,
        op: RawOp,
        comm: RawComm,
    ) -> Code {
        let mut contribution = Contribution::new(Kind::AllReduce, 0, datatype);
        contribution.status = first_error([
            self.check_op(op),
            self.check_elements(sendbuf.len(), datatype),
        ]);
        contribution.op = op;
        contribution.data = sendbuf.to_vec();
        contribution.capacity = recvbuf.len();
        code(self.exchange(comm, contribution, Some(recvbuf)))
    }

    fn alltoall(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        datatype: WireTag,
        comm: RawComm,
    ) -> Code {
        let mut contribution = Contribution::new(Kind::AllToAll, 0, datatype);
        contribution.data = sendbuf.to_vec();
        contribution.capacity = recvbuf.len();
        code(self.exchange(comm, contribution, Some(recvbuf)))
    }

    fn reduce_local(
        &self,
        inbuf: &[u8],
        inoutbuf: &mut [u8],
        datatype: WireTag,
        op: RawOp,
    ) -> Code {
        if let Err(code) = self.check_elements(inbuf.len(), datatype) {
            return code;
        }
        let combiner = match self.lock() {
            Ok(state) => state.combiner(self.index, op),
            Err(code) => return code,
        };
        match combiner.check(datatype) {
            SUCCESS => combiner.combine(datatype, inbuf, inoutbuf),
            code => code,
        }
    }

    fn op_create(
        &self,
        function: UserFunction,
        datatype: WireTag,
        commute: bool,
        op: &mut RawOp,
    ) -> Code {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(code) => return code,
        };
        let id = state.next_operator[self.index];
        state.next_operator[self.index] += 1;
        state.operators[self.index].insert(
            id,
            Registered {
                function,
                datatype,
                commute,
            },
        );
        debug!("rank {} registered operator {} over {}", self.rank, id, datatype);
        *op = RawOp(id);
        SUCCESS
    }

    fn op_free(&self, op: &mut RawOp) -> Code {
        let mut state = self.shared.state.lock();
        if op.is_builtin() || state.operators[self.index].remove(&op.0).is_none() {
            return ERR_OP;
        }
        *op = RawOp::NULL;
        SUCCESS
    }

    fn op_commutative(&self, op: RawOp, commute: &mut bool) -> Code {
        if op.is_builtin() {
            *commute = true;
            return SUCCESS;
        }
        match self.shared.state.lock().operators[self.index].get(&op.0) {
            Some(registered) => {
                *commute = registered.commute;
                SUCCESS
            }
            None => ERR_OP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair() -> (LocalFabric, Endpoint, Endpoint) {
        let fabric = LocalFabric::new(2).unwrap();
        let a = fabric.endpoint(0).unwrap();
        let b = fabric.endpoint(1).unwrap();
        (fabric, a, b)
    }

    #[test]
    fn endpoints_know_their_place() {
        let (fabric, a, b) = pair();
        assert!(fabric.endpoint(2).is_none());
        let (mut rank, mut size) = (-1, -1);
        assert_eq!(b.comm_rank(RawComm::WORLD, &mut rank), SUCCESS);
        assert_eq!(a.comm_size(RawComm::WORLD, &mut size), SUCCESS);
        assert_eq!((rank, size), (1, 2));
        assert_eq!(a.comm_rank(RawComm(3), &mut rank), ERR_COMM);
    }

    #[test]
    fn lifecycle_flags() {
        let (_fabric, a, _) = pair();
        let mut flag = true;
        assert_eq!(a.initialized(&mut flag), SUCCESS);
        assert!(!flag);
        assert_eq!(a.finalize(), ERR_OTHER);
        assert_eq!(a.initialize(), SUCCESS);
        assert_eq!(a.initialize(), ERR_OTHER);
        assert_eq!(a.finalize(), SUCCESS);
        a.finalized(&mut flag);
        assert!(flag);
    }

    #[test]
    fn blocking_send_then_receive() {
        let (_fabric, a, b) = pair();
        assert_eq!(a.send(&[1, 2, 3], WireTag::UInt8, 1, 9, RawComm::WORLD), SUCCESS);
        let mut buf = [0u8; 4];
        let mut status = RawStatus::default();
        let code = b.recv(
            &mut buf,
            WireTag::UInt8,
            ANY_SOURCE,
            ANY_TAG,
            RawComm::WORLD,
            &mut status,
        );
        assert_eq!(code, SUCCESS);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!((status.source, status.tag, status.bytes), (0, 9, 3));
    }

    #[test]
    fn receive_blocks_until_send() {
        let (_fabric, a, b) = pair();
        thread::scope(|scope| {
            let receiver = scope.spawn(|| {
                let mut buf = [0u8; 1];
                let mut status = RawStatus::default();
                let code = b.recv(&mut buf, WireTag::Byte, 0, 0, RawComm::WORLD, &mut status);
                (code, buf[0])
            });
            thread::sleep(Duration::from_millis(20));
            assert_eq!(a.send(&[7], WireTag::Byte, 1, 0, RawComm::WORLD), SUCCESS);
            assert_eq!(receiver.join().unwrap(), (SUCCESS, 7));
        });
    }

    #[test]
    fn mismatched_tag_and_short_buffer() {
        let (_fabric, a, b) = pair();
        let mut status = RawStatus::default();

        a.send(&[0; 4], WireTag::Int32, 1, 0, RawComm::WORLD);
        let mut buf = [0u8; 4];
        let code = b.recv(&mut buf, WireTag::Float, 0, 0, RawComm::WORLD, &mut status);
        assert_eq!(code, ERR_TYPE);

        a.send(&[5; 8], WireTag::Int32, 1, 0, RawComm::WORLD);
        let code = b.recv(&mut buf, WireTag::Int32, 0, 0, RawComm::WORLD, &mut status);
        assert_eq!(code, ERR_TRUNCATE);
        assert_eq!(buf, [5; 4]);
    }

    #[test]
    fn invalid_arguments() {
        let (_fabric, a, _) = pair();
        assert_eq!(a.send(&[0], WireTag::Byte, 2, 0, RawComm::WORLD), ERR_RANK);
        assert_eq!(a.send(&[0], WireTag::Byte, 1, -3, RawComm::WORLD), ERR_TAG);
        assert_eq!(a.send(&[0; 3], WireTag::Int16, 1, 0, RawComm::WORLD), ERR_COUNT);
        let mut request = RawRequest(99);
        let mut status = RawStatus::default();
        assert_eq!(a.wait(&mut request, None, &mut status), ERR_REQUEST);
    }

    #[test]
    fn immediate_receive_completes_with_buffer() {
        let (_fabric, a, b) = pair();
        let mut request = RawRequest::NULL;
        assert_eq!(b.irecv(2, WireTag::UInt8, 0, 1, RawComm::WORLD, &mut request), SUCCESS);

        let mut flag = true;
        let mut status = RawStatus::default();
        let mut buf = [0u8; 2];
        assert_eq!(b.test(&mut request, Some(&mut buf), &mut flag, &mut status), SUCCESS);
        assert!(!flag);

        a.send(&[3, 4], WireTag::UInt8, 1, 1, RawComm::WORLD);
        assert_eq!(b.wait(&mut request, Some(&mut buf), &mut status), SUCCESS);
        assert!(request.is_null());
        assert_eq!(buf, [3, 4]);
    }

    #[test]
    fn cancelled_send_is_never_received() {
        let (_fabric, a, b) = pair();
        let mut request = RawRequest::NULL;
        assert_eq!(a.isend(&[1], WireTag::UInt8, 1, 0, RawComm::WORLD, &mut request), SUCCESS);
        assert_eq!(a.cancel(&mut request), SUCCESS);
        assert!(request.is_null());

        a.send(&[2], WireTag::UInt8, 1, 0, RawComm::WORLD);
        let mut buf = [0u8];
        let mut status = RawStatus::default();
        b.recv(&mut buf, WireTag::UInt8, 0, 0, RawComm::WORLD, &mut status);
        assert_eq!(buf, [2]);
    }

    #[test]
    fn cancelled_match_goes_back_to_the_mailbox() {
        let (_fabric, a, b) = pair();
        let mut status = RawStatus::default();
        let mut buf = [0u8];

        let mut early = RawRequest::NULL;
        let mut late = RawRequest::NULL;
        b.irecv(1, WireTag::UInt8, 0, 4, RawComm::WORLD, &mut early);
        a.send(&[1], WireTag::UInt8, 1, 4, RawComm::WORLD);
        b.irecv(1, WireTag::UInt8, 0, 4, RawComm::WORLD, &mut late);
        assert_eq!(b.cancel(&mut early), SUCCESS);
        assert_eq!(b.wait(&mut late, Some(&mut buf), &mut status), SUCCESS);
        assert_eq!(buf, [1]);

        b.irecv(1, WireTag::UInt8, 0, 5, RawComm::WORLD, &mut early);
        a.send(&[2], WireTag::UInt8, 1, 5, RawComm::WORLD);
        a.send(&[3], WireTag::UInt8, 1, 5, RawComm::WORLD);
        assert_eq!(b.cancel(&mut early), SUCCESS);
        assert_eq!(b.shared.state.lock().mailboxes[1].queued(), 2);
        b.recv(&mut buf, WireTag::UInt8, 0, 5, RawComm::WORLD, &mut status);
        assert_eq!(buf, [2]);
        b.recv(&mut buf, WireTag::UInt8, 0, 5, RawComm::WORLD, &mut status);
        assert_eq!(buf, [3]);
    }

    #[test]
    fn waiting_for_any_of_several_requests() {
        let (_fabric, a, b) = pair();
        let mut first = RawRequest::NULL;
        let mut second = RawRequest::NULL;
        b.irecv(1, WireTag::UInt8, 0, 1, RawComm::WORLD, &mut first);
        b.irecv(1, WireTag::UInt8, 0, 2, RawComm::WORLD, &mut second);
        let requests = [RawRequest::NULL, first, second];

        let mut index = None;
        thread::scope(|scope| {
            let sender = scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                a.send(&[2], WireTag::UInt8, 1, 2, RawComm::WORLD)
            });
            assert_eq!(b.waitany(&requests, &mut index), SUCCESS);
            assert_eq!(sender.join().unwrap(), SUCCESS);
        });
        assert_eq!(index, Some(2));

        a.send(&[1], WireTag::UInt8, 1, 1, RawComm::WORLD);
        let mut ready = Vec::new();
        assert_eq!(b.waitsome(&requests, &mut ready), SUCCESS);
        assert_eq!(ready, vec![1, 2]);

        assert_eq!(b.waitany(&[RawRequest::NULL], &mut index), SUCCESS);
        assert_eq!(index, None);
        assert_eq!(b.waitsome(&[], &mut ready), SUCCESS);
        assert!(ready.is_empty());
        assert_eq!(a.waitany(&requests, &mut index), ERR_REQUEST);
    }

    #[test]
    fn poison_wakes_waiters_on_requests() {
        let (fabric, _, b) = pair();
        let mut request = RawRequest::NULL;
        b.irecv(1, WireTag::UInt8, 0, 0, RawComm::WORLD, &mut request);
        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let mut ready = Vec::new();
                b.waitsome(&[request], &mut ready)
            });
            thread::sleep(Duration::from_millis(20));
            fabric.poison();
            assert_eq!(waiter.join().unwrap(), ERR_PROC_ABORTED);
        });
    }

    #[test]
    fn requests_belong_to_their_rank() {
        let (_fabric, a, b) = pair();
        let mut request = RawRequest::NULL;
        a.isend(&[1], WireTag::UInt8, 1, 0, RawComm::WORLD, &mut request);
        let mut copy = request;
        assert_eq!(b.cancel(&mut copy), ERR_REQUEST);
        let mut status = RawStatus::default();
        assert_eq!(a.wait(&mut request, None, &mut status), SUCCESS);
    }

    #[test]
    fn poison_wakes_blocked_receivers() {
        let (fabric, _, b) = pair();
        thread::scope(|scope| {
            let receiver = scope.spawn(|| {
                let mut buf = [0u8; 1];
                let mut status = RawStatus::default();
                b.recv(&mut buf, WireTag::Byte, 0, 0, RawComm::WORLD, &mut status)
            });
            thread::sleep(Duration::from_millis(20));
            fabric.poison();
            assert_eq!(receiver.join().unwrap(), ERR_PROC_ABORTED);
        });
        assert!(fabric.is_poisoned());
    }

    #[test]
    fn registered_operators() {
        let (_fabric, a, b) = pair();
        let mut op = RawOp::NULL;
        let function: UserFunction = Arc::new(|x: &[u8], y: &mut [u8], _: WireTag| {
            for (a, b) in x.iter().zip(y.iter_mut()) {
                *b = (*a).max(*b);
            }
        });
        assert_eq!(a.op_create(function, WireTag::UInt8, false, &mut op), SUCCESS);
        assert!(!op.is_builtin());
        let mut foreign = op;
        assert_eq!(b.op_free(&mut foreign), ERR_OP);

        let mut commute = true;
        assert_eq!(a.op_commutative(op, &mut commute), SUCCESS);
        assert!(!commute);

        let mut inout = [1u8, 9];
        assert_eq!(a.reduce_local(&[5, 5], &mut inout, WireTag::UInt8, op), SUCCESS);
        assert_eq!(inout, [5, 9]);
        assert_eq!(a.reduce_local(&[5, 5], &mut inout, WireTag::Int8, op), ERR_OP);

        assert_eq!(a.op_free(&mut op), SUCCESS);
        assert_eq!(op, RawOp::NULL);
        let mut gone = RawOp(RawOp::FIRST_USER);
        assert_eq!(a.op_free(&mut gone), ERR_OP);
    }

    #[test]
    fn collectives_on_threads() {
        let fabric = LocalFabric::new(3).unwrap();
        let sums = thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|i| {
                    let endpoint = fabric.endpoint(i).unwrap();
                    scope.spawn(move || {
                        let mine = (i as i32 + 1).to_ne_bytes();
                        let mut sum = [0u8; 4];
                        let code = endpoint.allreduce(
                            &mine,
                            &mut sum,
                            WireTag::Int32,
                            RawOp::SUM,
                            RawComm::WORLD,
                        );
                        assert_eq!(code, SUCCESS);
                        assert_eq!(endpoint.barrier(RawComm::WORLD), SUCCESS);
                        i32::from_ne_bytes(sum)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(sums, vec![6, 6, 6]);
    }
}
