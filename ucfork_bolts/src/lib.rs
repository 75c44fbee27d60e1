/*!
* Welcome to `ucfork_bolts`
*
* The small building blocks the guest session in `ucfork` is made of:
* the crate-wide [`Error`], shared coverage maps in [`shmem`], and unix helpers in [`os`].
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::ptr_as_ptr
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]

pub mod os;
pub mod shmem;

use core::{
    fmt::{self, Display},
    num::{ParseIntError, TryFromIntError},
};
use std::{env::VarError, io};

/// Main error struct for `ucfork`
#[derive(Debug)]
pub enum Error {
    /// The image magic matched, but its structure is inconsistent
    MalformedImage(String),
    /// The image names a machine we have no architecture tag for
    UnsupportedArchitecture(String),
    /// This is not supported (yet)
    NotImplemented(String),
    /// One or more guest memory ranges could not be accessed
    MemoryAccess(String),
    /// A restored mapping collided with a mapping that is still live
    MappingConflict(String),
    /// I/O on the forkserver control or status channel failed
    Protocol(String),
    /// A helper process could not be started
    Spawn(String),
    /// The session cannot continue in a known state
    Fatal(String),
    /// File related error
    File(io::Error),
    /// No elements in the current item
    Empty(String),
    /// You're holding it wrong
    IllegalState(String),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String),
    /// Something else happened
    Unknown(String),
}

impl Error {
    /// The image magic matched, but its structure is inconsistent
    #[must_use]
    pub fn malformed_image<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::MalformedImage(arg.into())
    }
    /// The image names a machine we have no architecture tag for
    #[must_use]
    pub fn unsupported_architecture<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::UnsupportedArchitecture(arg.into())
    }
    /// This is not supported (yet)
    #[must_use]
    pub fn not_implemented<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::NotImplemented(arg.into())
    }
    /// One or more guest memory ranges could not be accessed
    #[must_use]
    pub fn memory_access<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::MemoryAccess(arg.into())
    }
    /// A restored mapping collided with a mapping that is still live
    #[must_use]
    pub fn mapping_conflict<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::MappingConflict(arg.into())
    }
    /// I/O on the forkserver control or status channel failed
    #[must_use]
    pub fn protocol<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Protocol(arg.into())
    }
    /// A helper process could not be started
    #[must_use]
    pub fn spawn<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Spawn(arg.into())
    }
    /// The session cannot continue in a known state
    #[must_use]
    pub fn fatal<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Fatal(arg.into())
    }
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg)
    }
    /// No elements in the current item
    #[must_use]
    pub fn empty<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Empty(arg.into())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into())
    }

    /// Error with the last OS error, prefixed with `msg`
    #[must_use]
    pub fn last_os_error<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        let err = io::Error::last_os_error();
        Error::Unknown(format!("{}: {err}", msg.into()))
    }

    /// `true` if the control loop cannot go on after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Spawn(_) | Self::Fatal(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MalformedImage(s) => write!(f, "Malformed image: {0}", &s),
            Self::UnsupportedArchitecture(s) => write!(f, "Unsupported architecture: {0}", &s),
            Self::NotImplemented(s) => write!(f, "Not implemented: {0}", &s),
            Self::MemoryAccess(s) => write!(f, "Guest memory access failed: {0}", &s),
            Self::MappingConflict(s) => write!(f, "Conflicting guest mapping: {0}", &s),
            Self::Protocol(s) => write!(f, "Forkserver protocol failure: {0}", &s),
            Self::Spawn(s) => write!(f, "Failed to spawn process: {0}", &s),
            Self::Fatal(s) => write!(f, "Fatal: {0}", &s),
            Self::File(err) => write!(f, "File IO failed: {:?}", &err),
            Self::Empty(s) => write!(f, "No items in {0}", &s),
            Self::IllegalState(s) => write!(f, "Illegal state: {0}", &s),
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {0}", &s),
            Self::Unknown(s) => write!(f, "Unknown error: {0}", &s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(err) => Some(err),
            _ => None,
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::unknown(format!("Unix error: {err:?}"))
    }
}

/// Create an `ucfork` Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

impl From<VarError> for Error {
    fn from(err: VarError) -> Self {
        Self::empty(format!("Could not get env var: {err:?}"))
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::unknown(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::illegal_state(format!("Expected conversion failed: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use crate::Error;

    #[test]
    fn test_fatal_classes() {
        assert!(Error::protocol("short read").is_fatal());
        assert!(Error::spawn("/bin/cat").is_fatal());
        assert!(Error::fatal("restore").is_fatal());
        assert!(!Error::memory_access("0x1000-0x2000").is_fatal());
        assert!(!Error::not_implemented("darwin stat").is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::malformed_image("truncated program header");
        assert_eq!(
            err.to_string(),
            "Malformed image: truncated program header"
        );
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, Error::File(_)));
    }
}
