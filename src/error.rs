//! Error handling utils.
//!
//! Two layers exist. [`ErrorObject`] is the structured error value that
//! travels through the fiber error channel: suspension points fail with
//! one, a joining fiber receives the joinee's object verbatim and user
//! code may raise its own objects with arbitrary codes and categories.
//! [`Error`] is the host-facing enum returned by runtime-management and
//! container-channel APIs.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for the host-facing routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{0}")]
    Object(#[from] ErrorObject),

    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("malformed container frame: {0}")]
    Frame(#[from] crate::container::FrameError),
}

impl Error {
    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Object(_) => "Object",
            Self::IO(_) => "IO",
            Self::Frame(_) => "Frame",
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Error categories
////////////////////////////////////////////////////////////////////////////////

/// Category of the error kinds owned by this crate's scheduler core.
pub const CORE_CATEGORY: &str = "spindle.core";

/// Category of the value-codec error kinds ([`CodecError`]).
pub const CODEC_CATEGORY: &str = "spindle.codec";

/// Category of the OS-flavored error kinds ([`GenericError`]). Codes in
/// this category are `errno` values.
pub const GENERIC_CATEGORY: &str = "generic";

/// Error kinds raised by the scheduler core itself.
///
/// The discriminants are stable: they are the `code` field of the
/// [`ErrorObject`]s raised under [`CORE_CATEGORY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u32)]
#[non_exhaustive]
pub enum CoreError {
    #[error("cannot have a module with this name")]
    InvalidModuleName = 1,
    #[error("module not found")]
    ModuleNotFound = 2,
    #[error("the root module doesn't have a parent and can't reference one")]
    RootCannotImportParent = 3,
    #[error("the module being imported has a dependency on the current module")]
    CyclicImport = 4,
    #[error("a leaf module cannot import child modules")]
    LeafCannotImportChild = 5,
    #[error("you can only import modules from the main fiber")]
    OnlyMainFiberMayImport = 6,
    #[error("bad root context")]
    BadRootContext = 7,
    #[error("requested key wasn't found in the handle")]
    BadIndex = 8,
    #[error("the fiber coroutine is reserved to the scheduler")]
    BadCoroutine = 9,
    #[error("suspension already allowed")]
    SuspensionAlreadyAllowed = 10,
    #[error("interrupt-ability already allowed")]
    InterruptionAlreadyAllowed = 11,
    #[error("operation not permitted within a forbid-suspend block")]
    ForbidSuspendBlock = 12,
    #[error("fiber interrupted")]
    Interrupted = 13,
    #[error("scope_cleanup_pop() called w/o a matching scope_cleanup_push()")]
    UnmatchedScopeCleanup = 14,
    #[error("channel closed")]
    ChannelClosed = 15,
    #[error("broadcast the address before attempting to receive on it")]
    NoSenders = 16,
    #[error("user code cannot import this module directly")]
    InternalModule = 17,
    #[error("raise() failed")]
    RaiseError = 18,
}

/// OS-flavored error kinds raised by the core. Codes are `errno` values
/// under [`GENERIC_CATEGORY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenericError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not supported")]
    NotSupported,
    #[error("device or resource busy")]
    DeviceOrResourceBusy,
    #[error("resource deadlock would occur")]
    ResourceDeadlockWouldOccur,
    #[error("not enough memory")]
    NotEnoughMemory,
    #[error("operation not permitted")]
    OperationNotPermitted,
}

impl GenericError {
    #[inline]
    pub const fn errno(self) -> u32 {
        match self {
            Self::InvalidArgument => libc::EINVAL as u32,
            Self::NotSupported => libc::ENOTSUP as u32,
            Self::DeviceOrResourceBusy => libc::EBUSY as u32,
            Self::ResourceDeadlockWouldOccur => libc::EDEADLK as u32,
            Self::NotEnoughMemory => libc::ENOMEM as u32,
            Self::OperationNotPermitted => libc::EPERM as u32,
        }
    }

    fn from_errno(code: u32) -> Option<Self> {
        const EINVAL: u32 = libc::EINVAL as u32;
        const ENOTSUP: u32 = libc::ENOTSUP as u32;
        const EBUSY: u32 = libc::EBUSY as u32;
        const EDEADLK: u32 = libc::EDEADLK as u32;
        const ENOMEM: u32 = libc::ENOMEM as u32;
        const EPERM: u32 = libc::EPERM as u32;
        match code {
            EINVAL => Some(Self::InvalidArgument),
            ENOTSUP => Some(Self::NotSupported),
            EBUSY => Some(Self::DeviceOrResourceBusy),
            EDEADLK => Some(Self::ResourceDeadlockWouldOccur),
            ENOMEM => Some(Self::NotEnoughMemory),
            EPERM => Some(Self::OperationNotPermitted),
            _ => None,
        }
    }
}

/// Error kinds raised by the cross-instance value codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u32)]
#[non_exhaustive]
pub enum CodecError {
    #[error("value contains a reference cycle")]
    CycleExists = 1,
    #[error("value is nested too deep")]
    TooManyLevels = 2,
    #[error("array is too long")]
    ArrayTooLong = 3,
}

fn core_message(code: u32) -> Option<&'static str> {
    let m = match code {
        1 => "cannot have a module with this name",
        2 => "module not found",
        3 => "the root module doesn't have a parent and can't reference one",
        4 => "the module being imported has a dependency on the current module",
        5 => "a leaf module cannot import child modules",
        6 => "you can only import modules from the main fiber",
        7 => "bad root context",
        8 => "requested key wasn't found in the handle",
        9 => "the fiber coroutine is reserved to the scheduler",
        10 => "suspension already allowed",
        11 => "interrupt-ability already allowed",
        12 => "operation not permitted within a forbid-suspend block",
        13 => "fiber interrupted",
        14 => "scope_cleanup_pop() called w/o a matching scope_cleanup_push()",
        15 => "channel closed",
        16 => "broadcast the address before attempting to receive on it",
        17 => "user code cannot import this module directly",
        18 => "raise() failed",
        _ => return None,
    };
    Some(m)
}

fn codec_message(code: u32) -> Option<&'static str> {
    match code {
        1 => Some("value contains a reference cycle"),
        2 => Some("value is nested too deep"),
        3 => Some("array is too long"),
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////////////
// ErrorObject
////////////////////////////////////////////////////////////////////////////////

/// Ancillary values attached to an [`ErrorObject`], e.g. the index of
/// the offending argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Str(Box<str>),
    Int(i64),
}

impl From<&str> for Field {
    #[inline(always)]
    fn from(s: &str) -> Self {
        Self::Str(s.into())
    }
}

impl From<i64> for Field {
    #[inline(always)]
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Structured info about a failure raised into a fiber.
///
/// Equivalent objects compare equal, which is what makes "the joinee's
/// error is delivered verbatim" checkable by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub code: u32,
    pub category: Box<str>,
    pub fields: BTreeMap<Box<str>, Field>,
}

impl ErrorObject {
    #[inline]
    pub fn new(code: u32, category: impl Into<Box<str>>) -> Self {
        Self {
            code,
            category: category.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Attaches an ancillary field, e.g. `.with_field("arg", 1)`.
    #[inline]
    pub fn with_field(mut self, key: impl Into<Box<str>>, value: impl Into<Field>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    /// True iff this is the given core error kind, ignoring fields.
    #[inline]
    pub fn is(&self, kind: CoreError) -> bool {
        self.code == kind as u32 && &*self.category == CORE_CATEGORY
    }

    #[inline]
    pub fn is_generic(&self, kind: GenericError) -> bool {
        self.code == kind.errno() && &*self.category == GENERIC_CATEGORY
    }

    #[inline]
    pub fn is_codec(&self, kind: CodecError) -> bool {
        self.code == kind as u32 && &*self.category == CODEC_CATEGORY
    }

    #[inline(always)]
    pub fn is_interrupted(&self) -> bool {
        self.is(CoreError::Interrupted)
    }

    pub(crate) fn invalid_arg(index: i64) -> Self {
        Self::from(GenericError::InvalidArgument).with_field("arg", index)
    }

    pub(crate) fn panic(message: String) -> Self {
        Self::new(0, "panic").with_field("message", &*message)
    }
}

impl From<CoreError> for ErrorObject {
    #[inline]
    fn from(e: CoreError) -> Self {
        Self::new(e as u32, CORE_CATEGORY)
    }
}

impl From<GenericError> for ErrorObject {
    #[inline]
    fn from(e: GenericError) -> Self {
        Self::new(e.errno(), GENERIC_CATEGORY)
    }
}

impl From<CodecError> for ErrorObject {
    #[inline]
    fn from(e: CodecError) -> Self {
        Self::new(e as u32, CODEC_CATEGORY)
    }
}

impl Display for ErrorObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let message = match &*self.category {
            CORE_CATEGORY => core_message(self.code),
            CODEC_CATEGORY => codec_message(self.code),
            GENERIC_CATEGORY => {
                GenericError::from_errno(self.code).map(|e| match e {
                    GenericError::InvalidArgument => "invalid argument",
                    GenericError::NotSupported => "not supported",
                    GenericError::DeviceOrResourceBusy => "device or resource busy",
                    GenericError::ResourceDeadlockWouldOccur => "resource deadlock would occur",
                    GenericError::NotEnoughMemory => "not enough memory",
                    GenericError::OperationNotPermitted => "operation not permitted",
                })
            }
            _ => None,
        };
        match message {
            Some(m) => write!(f, "{}", m)?,
            None => write!(f, "error {} ({})", self.code, self.category)?,
        }
        for (key, value) in &self.fields {
            match value {
                Field::Str(s) => write!(f, "; {}: {}", key, s)?,
                Field::Int(i) => write!(f, "; {}: {}", key, i)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for ErrorObject {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_codes_are_stable() {
        assert_eq!(CoreError::InvalidModuleName as u32, 1);
        assert_eq!(CoreError::Interrupted as u32, 13);
        assert_eq!(CoreError::ChannelClosed as u32, 15);
        assert_eq!(CoreError::RaiseError as u32, 18);
    }

    #[test]
    fn object_equality_ignores_nothing() {
        let a = ErrorObject::from(CoreError::Interrupted);
        let b = ErrorObject::from(CoreError::Interrupted);
        assert_eq!(a, b);
        assert_ne!(a, a.clone().with_field("arg", 1));
    }

    #[test]
    fn display_includes_fields() {
        let e = ErrorObject::invalid_arg(1);
        assert_eq!(e.to_string(), "invalid argument; arg: 1");
        let e = ErrorObject::new(42, "x");
        assert_eq!(e.to_string(), "error 42 (x)");
    }

    #[test]
    fn kind_checks() {
        assert!(ErrorObject::from(CoreError::NoSenders).is(CoreError::NoSenders));
        assert!(!ErrorObject::from(CoreError::NoSenders).is(CoreError::ChannelClosed));
        assert!(ErrorObject::from(CodecError::CycleExists).is_codec(CodecError::CycleExists));
        assert!(ErrorObject::from(GenericError::InvalidArgument)
            .is_generic(GenericError::InvalidArgument));
    }
}
