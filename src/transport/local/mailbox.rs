//! Per-rank message matching.
//!
//! A receive matches the earliest queued message whose source and tag agree with it, and a
//! message matches the earliest posted receive that accepts it. Together this keeps messages
//! between one pair of ranks with one tag in send order.

use std::collections::VecDeque;

use crate::datatype::WireTag;
use crate::transport::{ANY_SOURCE, ANY_TAG};
use crate::{Rank, Tag};

/// A message in flight.
#[derive(Debug)]
pub(super) struct Envelope {
    /// Request of the sending side, `0` for blocking sends
    pub sender: u64,
    pub source: Rank,
    pub tag: Tag,
    pub datatype: WireTag,
    pub payload: Vec<u8>,
}

/// A receive waiting for its message.
#[derive(Debug)]
pub(super) struct Posted {
    pub request: u64,
    pub source: Rank,
    pub tag: Tag,
}

impl Posted {
    fn accepts(&self, envelope: &Envelope) -> bool {
        (self.source == ANY_SOURCE || self.source == envelope.source)
            && (self.tag == ANY_TAG || self.tag == envelope.tag)
    }
}

#[derive(Debug, Default)]
pub(super) struct Mailbox {
    unexpected: VecDeque<Envelope>,
    posted: VecDeque<Posted>,
}

impl Mailbox {
    /// Hand `envelope` to the earliest posted receive that accepts it, returning that receive's
    /// request, or queue it behind the messages already waiting.
    pub fn deliver(&mut self, envelope: Envelope) -> Option<(u64, Envelope)> {
        match self.claim(&envelope) {
            Some(request) => Some((request, envelope)),
            None => {
                self.unexpected.push_back(envelope);
                None
            }
        }
    }

    /// Like `deliver`, but a queued envelope goes ahead of every waiting message.
    pub fn redeliver(&mut self, envelope: Envelope) -> Option<(u64, Envelope)> {
        match self.claim(&envelope) {
            Some(request) => Some((request, envelope)),
            None => {
                self.unexpected.push_front(envelope);
                None
            }
        }
    }

    fn claim(&mut self, envelope: &Envelope) -> Option<u64> {
        let position = self.posted.iter().position(|p| p.accepts(envelope))?;
        self.posted.remove(position).map(|p| p.request)
    }

    /// Match `posted` against the waiting messages, or keep it until a message arrives.
    pub fn post(&mut self, posted: Posted) -> Option<Envelope> {
        match self.unexpected.iter().position(|e| posted.accepts(e)) {
            Some(position) => self.unexpected.remove(position),
            None => {
                self.posted.push_back(posted);
                None
            }
        }
    }

    /// Forget the posted receive of `request`.
    pub fn withdraw(&mut self, request: u64) -> bool {
        match self.posted.iter().position(|p| p.request == request) {
            Some(position) => {
                self.posted.remove(position);
                true
            }
            None => false,
        }
    }

    /// Take back the unmatched message sent by `request`.
    pub fn recall(&mut self, request: u64) -> Option<Envelope> {
        let position = self.unexpected.iter().position(|e| e.sender == request)?;
        self.unexpected.remove(position)
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.unexpected.len()
    }
}
