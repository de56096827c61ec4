//! Completion metadata of point to point operations

use std::fmt;

use conv::ConvUtil;

use crate::datatype::Equivalence;
use crate::raw::AsRaw;
use crate::transport::{Code, RawStatus, SUCCESS};
use crate::{Count, Rank, Tag, UNDEFINED};

/// Describes the result of a completed receive or non-blocking operation
///
/// A `Status` only comes out of an operation that has completed. It records who sent the message,
/// under which tag, and how many bytes were transferred, so the number of elements can be
/// recovered with `count()` after the fact.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Status(RawStatus);

impl Status {
    /// Construct a `Status` value from the raw transport type
    pub fn from_raw(status: RawStatus) -> Status {
        Status(status)
    }

    /// The status of a completion that carried no message, e.g. waiting on an empty request.
    ///
    /// Its source and tag are the wildcards `ANY_SOURCE` and `ANY_TAG`.
    pub fn empty() -> Status {
        Status(RawStatus::default())
    }

    /// Whether this is an empty status
    pub fn is_empty(&self) -> bool {
        self.0 == RawStatus::default()
    }

    /// The rank of the message source
    pub fn source_rank(&self) -> Rank {
        self.0.source
    }

    /// The message tag
    pub fn tag(&self) -> Tag {
        self.0.tag
    }

    /// The return code of the operation
    pub fn error(&self) -> Code {
        self.0.error
    }

    /// Whether the operation succeeded
    pub fn is_success(&self) -> bool {
        self.0.error == SUCCESS
    }

    /// Number of bytes transferred
    pub fn bytes(&self) -> usize {
        self.0.bytes
    }

    /// Number of elements of type `T` contained in the message
    ///
    /// `UNDEFINED` if the transferred bytes are not a whole number of `T`s.
    pub fn count<T: Equivalence>(&self) -> Count {
        let width = T::WIRE_TAG.size();
        if self.0.bytes % width != 0 {
            return UNDEFINED;
        }
        (self.0.bytes / width)
            .value_as::<Count>()
            .unwrap_or(UNDEFINED)
    }
}

impl AsRaw for Status {
    type Raw = RawStatus;
    fn as_raw(&self) -> Self::Raw {
        self.0
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::empty()
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "Status {{ source_rank: {}, tag: {}, error: {}, bytes: {} }}",
            self.source_rank(),
            self.tag(),
            self.error(),
            self.bytes()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ANY_SOURCE, ANY_TAG, ERR_TRUNCATE};

    fn received(bytes: usize) -> Status {
        Status::from_raw(RawStatus {
            source: 2,
            tag: 7,
            error: SUCCESS,
            bytes,
        })
    }

    #[test]
    fn count_in_elements() {
        let status = received(24);
        assert_eq!(status.count::<f64>(), 3);
        assert_eq!(status.count::<u8>(), 24);
        assert_eq!(status.count::<i32>(), 6);
    }

    #[test]
    fn partial_elements_are_undefined() {
        assert_eq!(received(6).count::<u32>(), UNDEFINED);
        assert_eq!(received(0).count::<u32>(), 0);
    }

    #[test]
    fn empty_status() {
        let status = Status::empty();
        assert!(status.is_empty());
        assert!(status.is_success());
        assert_eq!(status.source_rank(), ANY_SOURCE);
        assert_eq!(status.tag(), ANY_TAG);
        assert!(!received(0).is_empty());
    }

    #[test]
    fn failed_status() {
        let status = Status::from_raw(RawStatus {
            error: ERR_TRUNCATE,
            ..RawStatus::default()
        });
        assert!(!status.is_success());
        assert_eq!(status.error(), ERR_TRUNCATE);
    }
}
