//! Point to point communication
//!
//! Endpoints of communication are ranks of a `Communicator`. Messages are matched by source rank
//! and tag; receives may use the wildcards `ANY_SOURCE` and `ANY_TAG`. Messages between the same
//! source and destination with the same tag arrive in the order they were sent.
//!
//! Fixed-size buffers (a single value or a slice whose length the receiver knows) travel in one
//! transfer. Sequences and text whose length only the sender knows travel in two transfers under
//! the same destination and tag: first the number of elements as a `u64`, then the elements. The
//! receiver sizes its destination from the first transfer and takes the second one from the
//! source and tag the first one came with, so that a wildcard receive cannot mix up the header
//! of one sender with the body of another.
//!
//! # Unfinished features
//!
//! - Buffered, synchronous and ready send modes
//! - Send-receive
//! - Probe and matched probe

use std::mem;
use std::sync::Arc;

use conv::ConvUtil;
use log::{debug, trace};

use crate::datatype::traits::*;
use crate::error::{Error, Result};
use crate::raw::traits::*;
use crate::request::Request;
use crate::status::Status;
use crate::topology::Communicator;
use crate::transport::{RawRequest, RawStatus};
use crate::{Rank, Tag};

pub use crate::transport::{ANY_SOURCE, ANY_TAG};

/// Header of a variable-length transfer: the number of elements that follow
type Header = u64;

impl Communicator {
    /// Send the contents of a `Buffer` to `dest` with `tag`.
    ///
    /// Returns once the buffer may be reused.
    ///
    /// # Examples
    ///
    /// See `demos/hello.rs`
    pub fn send<B>(&self, buf: &B, dest: Rank, tag: Tag) -> Result<()>
    where
        B: Buffer + ?Sized,
    {
        trace!(
            "send {} x {} to {} with tag {}",
            buf.count(),
            buf.as_datatype(),
            dest,
            tag
        );
        self.check(self.transport().send(
            buf.as_bytes(),
            buf.as_datatype(),
            dest,
            tag,
            self.as_raw(),
        ))
    }

    /// Send a sequence of any length to `dest` with `tag`.
    ///
    /// The receiver takes it with `receive_sequence()` or `receive_sequence_into()`.
    pub fn send_sequence<T>(&self, seq: &[T], dest: Rank, tag: Tag) -> Result<()>
    where
        T: Equivalence,
    {
        let count = seq
            .len()
            .value_as::<Header>()
            .map_err(|_| Error::CountOverflow(seq.len()))?;
        debug!("sequence header {} to {} with tag {}", count, dest, tag);
        self.send(&count, dest, tag)?;
        self.send(seq, dest, tag)
    }

    /// Send text of any length to `dest` with `tag`.
    ///
    /// The receiver takes it with `receive_text()` or `receive_text_into()`.
    ///
    /// # Examples
    ///
    /// See `demos/hello.rs`
    pub fn send_text(&self, text: &str, dest: Rank, tag: Tag) -> Result<()> {
        self.send_sequence(text.as_bytes(), dest, tag)
    }

    /// Receive a message from `source` with `tag` into a `Buffer`.
    ///
    /// The message may be shorter than the buffer; `Status::count()` tells how much arrived. A
    /// longer message, or one of a different wire type, is an error.
    pub fn receive_into<B>(&self, buf: &mut B, source: Rank, tag: Tag) -> Result<Status>
    where
        B: BufferMut + ?Sized,
    {
        let datatype = buf.as_datatype();
        let mut status = RawStatus::default();
        let code = self.transport().recv(
            buf.as_bytes_mut(),
            datatype,
            source,
            tag,
            self.as_raw(),
            &mut status,
        );
        self.check(code)?;
        Ok(Status::from_raw(status))
    }

    /// Receive a single value from `source` with `tag`.
    ///
    /// # Examples
    ///
    /// See `demos/reduce.rs`
    pub fn receive<T>(&self, source: Rank, tag: Tag) -> Result<(T, Status)>
    where
        T: Equivalence,
    {
        let mut value = T::default();
        let status = self.receive_into(&mut value, source, tag)?;
        Ok((value, status))
    }

    /// Receive a sequence sent with `send_sequence()` into `seq`.
    ///
    /// `seq` is resized to exactly the number of elements sent.
    pub fn receive_sequence_into<T>(
        &self,
        seq: &mut Vec<T>,
        source: Rank,
        tag: Tag,
    ) -> Result<Status>
    where
        T: Equivalence,
    {
        let (count, header) = self.receive::<Header>(source, tag)?;
        let len = count
            .value_as::<usize>()
            .map_err(|_| Error::CountOverflow(usize::MAX))?;
        debug!(
            "sequence header {} from {} with tag {}",
            len,
            header.source_rank(),
            header.tag()
        );
        seq.clear();
        seq.resize(len, T::default());
        self.receive_into(&mut seq[..], header.source_rank(), header.tag())
    }

    /// Receive a sequence sent with `send_sequence()`.
    pub fn receive_sequence<T>(&self, source: Rank, tag: Tag) -> Result<(Vec<T>, Status)>
    where
        T: Equivalence,
    {
        let mut seq = Vec::new();
        let status = self.receive_sequence_into(&mut seq, source, tag)?;
        Ok((seq, status))
    }

    /// Receive text sent with `send_text()` into `text`, replacing its contents.
    ///
    /// Fails with `Error::InvalidText` if the bytes received are not UTF-8.
    pub fn receive_text_into(&self, text: &mut String, source: Rank, tag: Tag) -> Result<Status> {
        let mut bytes = mem::take(text).into_bytes();
        let status = self.receive_sequence_into(&mut bytes, source, tag)?;
        *text = String::from_utf8(bytes)?;
        Ok(status)
    }

    /// Receive text sent with `send_text()`.
    ///
    /// # Examples
    ///
    /// See `demos/hello.rs`
    pub fn receive_text(&self, source: Rank, tag: Tag) -> Result<(String, Status)> {
        let mut text = String::new();
        let status = self.receive_text_into(&mut text, source, tag)?;
        Ok((text, status))
    }

    /// Initiate sending the contents of a `Buffer` to `dest` with `tag`.
    ///
    /// The buffer stays borrowed until the returned request is resolved or dropped.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    pub fn immediate_send<'b, B>(&self, buf: &'b B, dest: Rank, tag: Tag) -> Result<Request<'b>>
    where
        B: Buffer + ?Sized,
    {
        let mut request = RawRequest::NULL;
        self.check(self.transport().isend(
            buf.as_bytes(),
            buf.as_datatype(),
            dest,
            tag,
            self.as_raw(),
            &mut request,
        ))?;
        trace!("posted send {:?} to {} with tag {}", request, dest, tag);
        Ok(Request::pending(
            Arc::clone(self.transport()),
            self.as_raw(),
            request,
            None,
        ))
    }

    /// Initiate receiving a message from `source` with `tag` into a `Buffer`.
    ///
    /// The buffer stays borrowed until the returned request is resolved or dropped, and holds the
    /// message once the request has been resolved by `wait()` or a successful `test()`.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    pub fn immediate_receive_into<'b, B>(
        &self,
        buf: &'b mut B,
        source: Rank,
        tag: Tag,
    ) -> Result<Request<'b>>
    where
        B: BufferMut + ?Sized,
    {
        let datatype = buf.as_datatype();
        let bytes = buf.as_bytes_mut();
        let mut request = RawRequest::NULL;
        self.check(self.transport().irecv(
            bytes.len(),
            datatype,
            source,
            tag,
            self.as_raw(),
            &mut request,
        ))?;
        trace!("posted receive {:?} from {} with tag {}", request, source, tag);
        Ok(Request::pending(
            Arc::clone(self.transport()),
            self.as_raw(),
            request,
            Some(bytes),
        ))
    }
}
