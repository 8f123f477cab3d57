//! Process-level surface: exit modes and signal raising.

use crate::error::{ErrorObject, GenericError, StdResult};
use crate::value::Value;

/// How [`Actor::exit`](crate::Actor::exit) terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMode {
    /// Request an orderly shutdown; cleanup code runs and pending
    /// operations are cancelled.
    Graceful,
    /// Terminate the process right away, skipping cleanup.
    Quick,
    /// Abort the process.
    Abort,
}

impl ExitMode {
    /// Parses the `force` option value: absent or `0` is a graceful
    /// exit, `2` a quick exit and `"abort"` an abort. `1` (run only the
    /// C++-style static destructors) is rejected as `not_supported`;
    /// anything else is an `invalid_argument`.
    pub fn from_force(force: Option<&Value>) -> StdResult<Self, ErrorObject> {
        match force {
            None => Ok(Self::Graceful),
            Some(Value::Number(n)) if *n == 0.0 => Ok(Self::Graceful),
            Some(Value::Number(n)) if *n == 1.0 => Err(GenericError::NotSupported.into()),
            Some(Value::Number(n)) if *n == 2.0 => Ok(Self::Quick),
            Some(Value::Str(s)) if s == "abort" => Ok(Self::Abort),
            Some(_) => Err(ErrorObject::invalid_arg(1)),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Signals
////////////////////////////////////////////////////////////////////////////////

pub const SIGHUP: i32 = libc::SIGHUP;
pub const SIGINT: i32 = libc::SIGINT;
pub const SIGQUIT: i32 = libc::SIGQUIT;
pub const SIGILL: i32 = libc::SIGILL;
pub const SIGABRT: i32 = libc::SIGABRT;
pub const SIGFPE: i32 = libc::SIGFPE;
pub const SIGKILL: i32 = libc::SIGKILL;
pub const SIGSEGV: i32 = libc::SIGSEGV;
pub const SIGPIPE: i32 = libc::SIGPIPE;
pub const SIGALRM: i32 = libc::SIGALRM;
pub const SIGTERM: i32 = libc::SIGTERM;
pub const SIGUSR1: i32 = libc::SIGUSR1;
pub const SIGUSR2: i32 = libc::SIGUSR2;
pub const SIGCHLD: i32 = libc::SIGCHLD;
pub const SIGCONT: i32 = libc::SIGCONT;
pub const SIGSTOP: i32 = libc::SIGSTOP;
pub const SIGTSTP: i32 = libc::SIGTSTP;
pub const SIGTTIN: i32 = libc::SIGTTIN;
pub const SIGTTOU: i32 = libc::SIGTTOU;
pub const SIGURG: i32 = libc::SIGURG;
pub const SIGWINCH: i32 = libc::SIGWINCH;

/// Whether the default disposition of `signo` terminates the process.
fn default_disposition_terminates(signo: i32) -> bool {
    !matches!(
        signo,
        libc::SIGCHLD
            | libc::SIGCONT
            | libc::SIGURG
            | libc::SIGWINCH
            | libc::SIGSTOP
            | libc::SIGTSTP
            | libc::SIGTTIN
            | libc::SIGTTOU
    )
}

/// Raises `signo` in the current process. Non-master instances may only
/// raise signals whose default disposition does not terminate the
/// process.
pub(crate) fn raise_gated(signo: i32, is_master: bool) -> StdResult<(), ErrorObject> {
    if !is_master && default_disposition_terminates(signo) {
        return Err(GenericError::OperationNotPermitted.into());
    }
    if unsafe { libc::raise(signo) } != 0 {
        return Err(crate::error::CoreError::RaiseError.into());
    }
    Ok(())
}
