//! Error handling and the error policy
//!
//! Every transport call returns a code. What happens to a code other than `SUCCESS` is decided
//! when the crate is built, by the `ErrorPolicy` selected through Cargo features:
//!
//! - no feature: `Recoverable`, the failure is returned as `Err(Error::Transport { .. })`
//! - `abort-on-error`: `Fatal`, the transport's description is printed to stderr and the whole
//!   group is aborted
//! - `ignore-errors`: `Silent`, the code is dropped and the operation reports success
//!
//! Enabling both features does not compile.

use std::io;
use std::string::FromUtf8Error;

use log::debug;

use crate::transport::{Code, RawComm, Transport, SUCCESS};

#[cfg(all(feature = "abort-on-error", feature = "ignore-errors"))]
compile_error!("features `abort-on-error` and `ignore-errors` cannot be enabled together");

/// Result type of the fallible operations of this crate
pub type Result<T> = std::result::Result<T, Error>;

macro_rules! build_error_kind {
    {
        $(#[$doc:meta])*
        pub enum $name:ident {
            $(
                 $(#[doc = $err_doc:expr])*
                 #[err($class:ident)]
                 $rust_err:ident,
            )*
        }
    } => {
        use crate::transport::{
            $(
            $class,
            )*
        };

        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
            $(#[doc = $err_doc])*
            $rust_err,
            )*
        }

        impl $name {
            /// Convert an error class into its Rust variant.
            pub fn from_class(class: Code) -> Option<$name> {
                $(
                if class == $class {
                    return Some($name::$rust_err)
                }
                )*
                None
            }

            /// The error class this variant stands for
            pub fn class(&self) -> Code {
                match *self {
                    $(
                    $name::$rust_err => $class,
                    )*
                }
            }
        }
    }
}

build_error_kind! {
    /// Set of error classes a transport can report.
    pub enum ErrorKind {
        /// Invalid buffer argument
        #[err(ERR_BUFFER)]
        Buffer,
        /// Invalid count argument
        #[err(ERR_COUNT)]
        Count,
        /// Invalid datatype argument, or a message of a different wire tag than expected
        #[err(ERR_TYPE)]
        Type,
        /// Invalid tag argument
        #[err(ERR_TAG)]
        Tag,
        /// Invalid communicator argument
        #[err(ERR_COMM)]
        Comm,
        /// Invalid rank argument
        #[err(ERR_RANK)]
        Rank,
        /// Invalid root argument
        #[err(ERR_ROOT)]
        Root,
        /// Invalid operation argument, or an operation applied to a type it is not defined on
        #[err(ERR_OP)]
        Op,
        /// Message truncated on receive
        #[err(ERR_TRUNCATE)]
        Truncate,
        /// Invalid request argument
        #[err(ERR_REQUEST)]
        Request,
        /// Collective argument not identical on all processes, or collective routines called in
        /// a different order by different processes
        #[err(ERR_NOT_SAME)]
        NotSame,
        /// Operation failed because a peer process has aborted
        #[err(ERR_PROC_ABORTED)]
        ProcAborted,
        /// Internal transport error
        #[err(ERR_INTERN)]
        Intern,
        /// Invalid argument of some other kind
        #[err(ERR_ARG)]
        Arg,
        /// Known error not in this list
        #[err(ERR_OTHER)]
        Other,
        /// Unknown error
        #[err(ERR_UNKNOWN)]
        Unknown,
    }
}

/// Errors of this crate
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The transport reported a failure
    #[error("{message} (code {code}, {kind:?})")]
    Transport {
        /// Class of the failure
        kind: ErrorKind,
        /// The code the transport returned
        code: Code,
        /// The transport's description of `code`
        message: String,
    },

    /// The environment has already been initialized on this rank
    #[error("the environment has already been initialized")]
    AlreadyInitialized,

    /// The environment has not been initialized on this rank
    #[error("the environment has not been initialized")]
    NotInitialized,

    /// The environment has already been finalized on this rank
    #[error("the environment has already been finalized")]
    Finalized,

    /// Received text is not UTF-8
    #[error("received text is not valid UTF-8")]
    InvalidText(#[from] FromUtf8Error),

    /// A length does not fit the count type of the transport
    #[error("length {0} does not fit the transport's count type")]
    CountOverflow(usize),

    /// A rank thread of the local fabric could not be started
    #[error("failed to spawn a rank thread")]
    Spawn(#[source] io::Error),
}

impl Error {
    /// Describe the transport failure `code`.
    pub(crate) fn from_code(transport: &dyn Transport, code: Code) -> Error {
        let mut class = ERR_UNKNOWN;
        if transport.error_class(code, &mut class) != SUCCESS {
            class = ERR_UNKNOWN;
        }
        Error::Transport {
            kind: ErrorKind::from_class(class).unwrap_or(ErrorKind::Unknown),
            code,
            message: transport.error_string(code),
        }
    }

    /// The class of a transport failure, `None` for the other errors
    pub fn kind(&self) -> Option<ErrorKind> {
        match *self {
            Error::Transport { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// What to do with a failed transport call
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Return the failure to the caller
    Recoverable,
    /// Print the failure and abort the whole group
    Fatal,
    /// Ignore the failure
    Silent,
}

/// The policy this build applies
#[cfg(feature = "abort-on-error")]
pub const POLICY: ErrorPolicy = ErrorPolicy::Fatal;
/// The policy this build applies
#[cfg(all(feature = "ignore-errors", not(feature = "abort-on-error")))]
pub const POLICY: ErrorPolicy = ErrorPolicy::Silent;
/// The policy this build applies
#[cfg(not(any(feature = "abort-on-error", feature = "ignore-errors")))]
pub const POLICY: ErrorPolicy = ErrorPolicy::Recoverable;

/// Apply `POLICY` to the return code of a transport call made on `comm`.
pub(crate) fn check(transport: &dyn Transport, comm: RawComm, code: Code) -> Result<()> {
    if code == SUCCESS {
        return Ok(());
    }
    match POLICY {
        ErrorPolicy::Recoverable => Err(Error::from_code(transport, code)),
        ErrorPolicy::Silent => {
            debug!("ignoring transport error {}", code);
            Ok(())
        }
        ErrorPolicy::Fatal => {
            eprintln!("{}", Error::from_code(transport, code));
            transport.abort(comm, code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalFabric;
    use crate::transport::{ERR_LASTCODE, ERR_NOT_SAME, ERR_TRUNCATE};

    #[test]
    fn every_class_has_a_kind() {
        for class in 1..=ERR_LASTCODE {
            let kind = ErrorKind::from_class(class).unwrap();
            assert_eq!(kind.class(), class);
        }
        assert_eq!(ErrorKind::from_class(SUCCESS), None);
        assert_eq!(ErrorKind::from_class(ERR_LASTCODE + 1), None);
    }

    #[test]
    fn kinds_with_long_descriptions() {
        assert_eq!(ErrorKind::from_class(ERR_NOT_SAME), Some(ErrorKind::NotSame));
        assert_eq!(ErrorKind::NotSame.class(), ERR_NOT_SAME);
        assert_eq!(ErrorKind::Unknown.class(), ERR_UNKNOWN);
    }

    #[test]
    fn transport_errors_carry_the_description() {
        let fabric = LocalFabric::new(1).unwrap();
        let endpoint = fabric.endpoint(0).unwrap();
        let error = Error::from_code(&endpoint, ERR_TRUNCATE);
        assert_eq!(error.kind(), Some(ErrorKind::Truncate));
        assert_eq!(
            error.to_string(),
            format!("message truncated (code {}, Truncate)", ERR_TRUNCATE)
        );

        let unknown = Error::from_code(&endpoint, 4711);
        assert_eq!(unknown.kind(), Some(ErrorKind::Unknown));
    }

    #[test]
    fn lifecycle_errors_have_no_kind() {
        assert_eq!(Error::NotInitialized.kind(), None);
    }

    #[cfg(not(any(feature = "abort-on-error", feature = "ignore-errors")))]
    #[test]
    fn recoverable_by_default() {
        let fabric = LocalFabric::new(1).unwrap();
        let endpoint = fabric.endpoint(0).unwrap();
        assert_eq!(POLICY, ErrorPolicy::Recoverable);
        assert!(check(&endpoint, RawComm::WORLD, SUCCESS).is_ok());
        let error = check(&endpoint, RawComm::WORLD, ERR_TRUNCATE).unwrap_err();
        assert_eq!(error.kind(), Some(ErrorKind::Truncate));
    }

    #[cfg(feature = "ignore-errors")]
    #[test]
    fn silent_policy_swallows_failures() {
        let fabric = LocalFabric::new(1).unwrap();
        let endpoint = fabric.endpoint(0).unwrap();
        assert!(check(&endpoint, RawComm::WORLD, ERR_TRUNCATE).is_ok());
    }
}
