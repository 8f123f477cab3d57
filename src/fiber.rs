//! Fiber bookkeeping and lifecycle.
//!
//! A fiber is a cooperative task running inside one actor instance. The
//! registry entry for each live fiber is a [`FiberRecord`] owned by the
//! instance; user code holds a [`FiberHandle`] which can join, detach
//! or interrupt the fiber.
//!
//! Suspension is always explicit: a suspension point first checks the
//! per-fiber counters (suspension forbidden, interruption disabled) and
//! the interrupt latch, then installs a one-shot [`Interrupter`] that
//! knows how to unblock the fiber, and only then parks the task. The
//! interrupter is cleared before user code runs again, so firing it a
//! second time is impossible.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;

use crate::error::{CoreError, ErrorObject, GenericError, StdResult};
use crate::value::{Payload, Value};
use crate::vm::{Actor, Core};

/// What a fiber body produces: its return values or the error object it
/// raised.
pub type FiberResult = StdResult<Vec<Value>, ErrorObject>;

pub(crate) type Task = LocalBoxFuture<'static, FiberResult>;

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Scheduling identity of a fiber, unique within its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub(crate) u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Registry records
////////////////////////////////////////////////////////////////////////////////

/// Who is waiting for the fiber to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Joiner {
    /// Nobody yet; a user handle may still join or detach.
    Pending,
    /// Detached; errors other than an interruption print a panic.
    Detached,
    /// A fiber is suspended in `join` on this one.
    Joined(FiberId),
}

/// Argument delivered to a suspended fiber when it is resumed. `None`
/// (at the `Option` level) is a plain wake with nothing attached.
pub(crate) enum Resume {
    /// Completion of a `send` or another unit-shaped wait.
    Unit(StdResult<(), ErrorObject>),
    /// Completion of a `recv` or an external operation.
    Payload(StdResult<Payload, ErrorObject>),
    /// Completion of a `join`.
    Join(StdResult<JoinOutcome, ErrorObject>),
}

/// One-shot cancellation action installed at a suspension point.
///
/// A typed enum instead of an opaque callable: no allocation on the hot
/// suspension paths and no user code runs from inside the interrupter
/// except for the explicit `Callback` used by external-operation glue.
pub(crate) enum Interrupter {
    /// Clears the inbox receiver slot and wakes the fiber.
    CancelRecv,
    /// Posts a scan to the destination inbox that removes the queued
    /// message and wakes the sender.
    CancelSend {
        dest: std::sync::Weak<Core>,
        origin: Arc<Core>,
        fiber: FiberId,
    },
    /// Unlinks the joiner from the joinee and wakes the joiner.
    CancelJoin { target: FiberId },
    /// Cancels an external operation.
    Callback(Box<dyn FnOnce(&Actor)>),
}

impl Interrupter {
    /// Runs the cancellation. `owner` is the fiber the interrupter was
    /// installed for.
    pub(crate) fn fire(self, actor: &Actor, owner: FiberId) {
        match self {
            Interrupter::CancelRecv => {
                {
                    let mut state = actor.state_mut();
                    if state.inbox.recv_fiber == Some(owner) {
                        state.inbox.recv_fiber = None;
                        state.inbox.recv_guard = None;
                    }
                }
                actor.core().strand.post(Box::new(move |a: &Actor| {
                    a.resume(
                        owner,
                        Some(Resume::Payload(Err(CoreError::Interrupted.into()))),
                    );
                }));
            }
            Interrupter::CancelSend {
                dest,
                origin,
                fiber,
            } => {
                let dest = match dest.upgrade() {
                    Some(dest) => dest,
                    None => return,
                };
                dest.strand.post(Box::new(move |dest_actor: &Actor| {
                    // FIFO order on the destination strand guarantees
                    // the delivery was enqueued before us; if the entry
                    // is gone, the message was already consumed and
                    // there is nothing to interrupt.
                    let removed = {
                        let mut state = dest_actor.state_mut();
                        let pos = state
                            .inbox
                            .incoming
                            .iter()
                            .position(|s| s.is_from(&origin, fiber));
                        pos.and_then(|i| state.inbox.incoming.remove(i))
                    };
                    if removed.is_none() {
                        return;
                    }
                    origin.strand.post(Box::new(move |a: &Actor| {
                        a.resume(
                            fiber,
                            Some(Resume::Unit(Err(CoreError::Interrupted.into()))),
                        );
                    }));
                }));
            }
            Interrupter::CancelJoin { target } => {
                {
                    let mut state = actor.state_mut();
                    if let Some(rec) = state.fibers.get_mut(&target) {
                        if rec.joiner == Joiner::Joined(owner) {
                            rec.joiner = Joiner::Pending;
                            if let Some(cell) = rec.user_handle.upgrade() {
                                cell.join_in_progress.set(false);
                            }
                        }
                    }
                }
                actor.core().strand.post(Box::new(move |a: &Actor| {
                    a.resume(owner, Some(Resume::Join(Ok(JoinOutcome::Interrupted))));
                }));
            }
            Interrupter::Callback(f) => f(actor),
        }
    }

    pub(crate) fn wait_reason(&self) -> &'static str {
        match self {
            Interrupter::CancelRecv => "inbox receive",
            Interrupter::CancelSend { .. } => "channel send",
            Interrupter::CancelJoin { .. } => "join",
            Interrupter::Callback(_) => "external operation",
        }
    }
}

pub(crate) struct FiberRecord {
    pub name: Option<Box<str>>,
    /// The task future. `None` while the fiber is being polled or after
    /// it finished.
    pub task: Option<Task>,
    pub joiner: Joiner,
    pub user_handle: Weak<HandleCell>,
    /// Set once the fiber finished while nobody was joining.
    pub status: Option<FiberResult>,
    pub source_path: Arc<str>,
    pub main: bool,
    pub spawned_at: &'static Location<'static>,
    pub local: Option<BTreeMap<String, Value>>,
    pub cleanup: Vec<Box<dyn FnOnce(&Actor)>>,
    pub interrupted: bool,
    pub interruption_disabled: u32,
    pub suspension_disallowed: u32,
    pub interrupter: Option<Interrupter>,
    pub wait_reason: Option<&'static str>,
    pub resume_arg: Option<Resume>,
}

impl FiberRecord {
    pub(crate) fn new(
        name: Option<Box<str>>,
        source_path: Arc<str>,
        main: bool,
        spawned_at: &'static Location<'static>,
        user_handle: Weak<HandleCell>,
        joiner: Joiner,
    ) -> Self {
        Self {
            name,
            task: None,
            joiner,
            user_handle,
            status: None,
            source_path,
            main,
            spawned_at,
            local: None,
            cleanup: Vec::new(),
            interrupted: false,
            interruption_disabled: 0,
            suspension_disallowed: 0,
            interrupter: None,
            wait_reason: None,
            resume_arg: None,
        }
    }

    /// Identity label without the "fiber" noun, so callers can prefix
    /// "fiber"/"main fiber" as appropriate.
    pub(crate) fn describe(&self, id: FiberId) -> String {
        match &self.name {
            Some(name) => format!("{} '{}'", id, name),
            None => format!("{}", id),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberHandle
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct HandleCell {
    pub fiber: Cell<Option<FiberId>>,
    pub interruption_caught: Cell<Option<bool>>,
    pub join_in_progress: Cell<bool>,
}

/// Result of a successful [`FiberHandle::join`].
#[derive(Debug, PartialEq)]
pub enum JoinOutcome {
    /// The fiber ran to completion; these are its return values.
    Completed(Vec<Value>),
    /// Either the joined fiber died of an interruption, or the joining
    /// fiber was itself interrupted while waiting. In the first case
    /// [`FiberHandle::interruption_caught`] reports `true`.
    Interrupted,
}

/// Owner-side handle to a spawned fiber.
///
/// Dropping the handle detaches the fiber.
pub struct FiberHandle {
    pub(crate) actor: Actor,
    pub(crate) cell: Rc<HandleCell>,
}

impl FiberHandle {
    /// Blocks the calling fiber until the target finishes.
    ///
    /// Returns the target's values, raises the target's error object
    /// verbatim, or reports [`JoinOutcome::Interrupted`] when either
    /// side was interrupted. Joining the current fiber fails with
    /// `resource_deadlock_would_occur`.
    pub fn join(&mut self) -> JoinFuture<'_> {
        JoinFuture {
            handle: self,
            started: false,
        }
    }

    /// Detaches the fiber: nobody will collect its result, and an error
    /// other than an interruption will print a panic report.
    pub fn detach(&self) -> StdResult<(), ErrorObject> {
        let target = match self.cell.fiber.get() {
            Some(t) if !self.cell.join_in_progress.get() => t,
            _ => return Err(ErrorObject::invalid_arg(1)),
        };
        self.actor.collect_or_detach(target);
        self.cell.fiber.set(None);
        Ok(())
    }

    /// Latches the interrupt flag and, if the fiber is currently
    /// blocked, fires the installed interrupter. Idempotent; a no-op on
    /// a finished fiber.
    pub fn interrupt(&self) {
        let target = match self.cell.fiber.get() {
            Some(t) => t,
            None => return,
        };
        let interrupter = {
            let mut state = self.actor.state_mut();
            let current = state.current_fiber;
            let rec = match state.fibers.get_mut(&target) {
                Some(rec) => rec,
                None => return,
            };
            rec.interrupted = true;
            if current == Some(target) {
                return;
            }
            rec.interrupter.take()
        };
        if let Some(interrupter) = interrupter {
            interrupter.fire(&self.actor, target);
        }
    }

    /// Only valid after a `join` that returned due to an interruption
    /// of the joined fiber.
    pub fn interruption_caught(&self) -> StdResult<bool, ErrorObject> {
        self.cell
            .interruption_caught
            .get()
            .ok_or_else(|| ErrorObject::from(GenericError::InvalidArgument))
    }

    /// True iff the fiber has not finished, been detached, or is being
    /// joined right now.
    pub fn joinable(&self) -> bool {
        self.cell.fiber.get().is_some() && !self.cell.join_in_progress.get()
    }
}

impl Drop for FiberHandle {
    fn drop(&mut self) {
        // A handle cannot be dropped mid-join: the join future borrows
        // it for as long as the join is in progress.
        if self.cell.fiber.get().is_some() {
            let _ = self.detach();
        }
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("fiber", &self.cell.fiber.get())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the
/// new fiber before spawning it.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber-to-be; the name shows up in panic and deadlock
    /// reports.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawns the fiber on the given actor. The body runs on the next
    /// scheduler turn.
    #[track_caller]
    pub fn spawn<F, Fut>(self, actor: &Actor, f: F) -> FiberHandle
    where
        F: FnOnce(Actor) -> Fut,
        Fut: Future<Output = FiberResult> + 'static,
    {
        actor.spawn_with(self.name.map(Into::into), Location::caller(), f)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Suspension futures
////////////////////////////////////////////////////////////////////////////////

/// Future returned by [`FiberHandle::join`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct JoinFuture<'a> {
    handle: &'a mut FiberHandle,
    started: bool,
}

impl<'a> Future for JoinFuture<'a> {
    type Output = StdResult<JoinOutcome, ErrorObject>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let actor = self.handle.actor.clone();
        if self.started {
            let mut state = actor.state_mut();
            let me = state.expect_current();
            return match state.take_resume(me) {
                Some(Resume::Join(result)) => Poll::Ready(result),
                Some(_) | None => Poll::Pending,
            };
        }

        let mut state = actor.state_mut();
        if let Err(e) = state.check_suspend_allowed() {
            return Poll::Ready(Err(e));
        }
        let cell = &self.handle.cell;
        let target = match cell.fiber.get() {
            Some(t) if !cell.join_in_progress.get() => t,
            _ => return Poll::Ready(Err(ErrorObject::invalid_arg(1))),
        };
        let me = state.expect_current();
        if target == me {
            return Poll::Ready(Err(GenericError::ResourceDeadlockWouldOccur.into()));
        }

        let finished = {
            let rec = state
                .fibers
                .get_mut(&target)
                .expect("live handle refers to a registered fiber");
            rec.status.is_some()
        };
        if finished {
            let rec = state.fibers.remove(&target).unwrap();
            cell.fiber.set(None);
            return match rec.status.unwrap() {
                Ok(values) => {
                    cell.interruption_caught.set(Some(false));
                    Poll::Ready(Ok(JoinOutcome::Completed(values)))
                }
                Err(obj) if obj.is_interrupted() => {
                    cell.interruption_caught.set(Some(true));
                    Poll::Ready(Ok(JoinOutcome::Interrupted))
                }
                Err(obj) => {
                    cell.interruption_caught.set(Some(false));
                    Poll::Ready(Err(obj))
                }
            };
        }

        let rec = state.fibers.get_mut(&target).unwrap();
        rec.joiner = Joiner::Joined(me);
        rec.user_handle = Rc::downgrade(cell);
        cell.join_in_progress.set(true);
        state.install_interrupter(me, Interrupter::CancelJoin { target });
        drop(state);
        self.started = true;
        Poll::Pending
    }
}

/// Future returned by [`Actor::yield_now`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldFuture {
    pub(crate) actor: Actor,
    pub(crate) started: bool,
}

impl Future for YieldFuture {
    type Output = StdResult<(), ErrorObject>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.started {
            return Poll::Ready(Ok(()));
        }
        let actor = self.actor.clone();
        let mut state = actor.state_mut();
        if let Err(e) = state.check_suspend_allowed() {
            return Poll::Ready(Err(e));
        }
        let me = state.expect_current();
        if let Some(rec) = state.fibers.get_mut(&me) {
            rec.wait_reason = Some("yield");
        }
        drop(state);
        // Deferred, not posted: already-queued work runs first, and a
        // fiber yielding in a loop cannot monopolize the strand.
        actor.core().strand.defer(Box::new(move |a: &Actor| {
            a.resume(me, None);
        }));
        self.started = true;
        Poll::Pending
    }
}

////////////////////////////////////////////////////////////////////////////////
// Panic report
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn print_panic(
    color: bool,
    is_main: bool,
    description: &str,
    error: &ErrorObject,
    spawned_at: &'static Location<'static>,
) {
    let (red, underline, reset_red, reset_underline, dim, reset_dim) = if color {
        (
            "\x1b[31;1m",
            "\x1b[4m",
            "\x1b[22;39m",
            "\x1b[24m",
            "\x1b[2m",
            "\x1b[22m",
        )
    } else {
        ("", "", "", "", "", "")
    };
    let what = if is_main { "main fiber" } else { "fiber" };
    eprintln!(
        "{}{} {} panicked: '{}{}{}'{}\n{}spawned at {}:{}{}",
        red,
        what,
        description,
        underline,
        error,
        reset_underline,
        reset_red,
        dim,
        spawned_at.file(),
        spawned_at.line(),
        reset_dim,
    );
}
