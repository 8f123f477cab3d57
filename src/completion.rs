//! Completion adapter for external operations.
//!
//! [`Actor::wait_external`](crate::Actor::wait_external) parks the
//! calling fiber and hands a [`Completion`] to the starter closure. The
//! wait is wired into the instance's cancellation machinery twice over:
//! an interrupter unblocks the fiber when it is interrupted, and a
//! pending-operation node cancels the external work if the instance
//! shuts down first. The completion unlinks its pending node before it
//! resumes the fiber, so neither path can race the other: whichever
//! side takes the node wins, the loser no-ops.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::{CoreError, ErrorObject, StdResult};
use crate::fiber::{FiberId, Interrupter, Resume};
use crate::pending::{PendingOperation, Ticket};
use crate::strand::{Strand, WorkGuard};
use crate::transfer;
use crate::value::{Payload, Value};
use crate::vm::Actor;

type Canceller = Box<dyn FnOnce() + 'static>;

/// One-shot handle finishing an external wait. Safe to move to any
/// thread. Completing after the fiber was interrupted or the instance
/// closed is a no-op.
pub struct Completion {
    strand: Strand,
    fiber: FiberId,
    ticket: Ticket,
    fired: Arc<AtomicBool>,
    _guard: WorkGuard,
}

impl Completion {
    /// Delivers the operation's result and wakes the waiting fiber.
    pub fn complete(self, result: StdResult<Payload, ErrorObject>) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let fiber = self.fiber;
        let ticket = self.ticket;
        self.strand.post(Box::new(move |a: &Actor| {
            // Unlink before running user code; a cancellation that beat
            // us to the node already woke the fiber.
            if !a.complete_pending(ticket) {
                return;
            }
            a.resume(fiber, Some(Resume::Payload(result)));
        }));
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("fiber", &self.fiber)
            .finish_non_exhaustive()
    }
}

/// Pending-operation node backing one external wait.
struct ExternalWait {
    fired: Arc<AtomicBool>,
    canceller: Rc<RefCell<Option<Canceller>>>,
}

impl PendingOperation for ExternalWait {
    fn cancel(&mut self) {
        self.fired.store(true, Ordering::Release);
        if let Some(canceller) = self.canceller.borrow_mut().take() {
            canceller();
        }
    }
}

/// Future returned by [`Actor::wait_external`](crate::Actor::wait_external).
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct ExternalFuture<S> {
    actor: Actor,
    start: Option<S>,
    started: bool,
}

impl<S> ExternalFuture<S> {
    pub(crate) fn new(actor: Actor, start: S) -> Self {
        Self {
            actor,
            start: Some(start),
            started: false,
        }
    }
}

impl<S> Unpin for ExternalFuture<S> {}

impl<S> Future for ExternalFuture<S>
where
    S: FnOnce(Completion) -> Canceller,
{
    type Output = StdResult<Value, ErrorObject>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let actor = this.actor.clone();
        if this.started {
            let mut state = actor.state_mut();
            let me = state.expect_current();
            return match state.take_resume(me) {
                Some(Resume::Payload(result)) => {
                    drop(state);
                    Poll::Ready(result.map(transfer::reify))
                }
                Some(_) | None => Poll::Pending,
            };
        }

        let (me, ticket, fired, canceller_slot) = {
            let mut state = actor.state_mut();
            if let Err(e) = state.check_suspend_allowed() {
                return Poll::Ready(Err(e));
            }
            let me = state.expect_current();
            let fired = Arc::new(AtomicBool::new(false));
            let canceller_slot: Rc<RefCell<Option<Canceller>>> = Rc::new(RefCell::new(None));
            let ticket = state.pending.register(Box::new(ExternalWait {
                fired: fired.clone(),
                canceller: canceller_slot.clone(),
            }));
            state.install_interrupter(
                me,
                Interrupter::Callback(Box::new(move |a: &Actor| {
                    // Taking the node cancels the external work; if the
                    // completion got there first, nothing to do.
                    if !a.cancel_pending(ticket) {
                        return;
                    }
                    a.core().strand.post(Box::new(move |a: &Actor| {
                        a.resume(
                            me,
                            Some(Resume::Payload(Err(CoreError::Interrupted.into()))),
                        );
                    }));
                })),
            );
            (me, ticket, fired, canceller_slot)
        };

        let completion = Completion {
            strand: actor.core().strand.clone(),
            fiber: me,
            ticket,
            fired,
            _guard: actor.core().strand.work_guard(),
        };
        let start = this.start.take().expect("external wait started twice");
        let canceller = start(completion);
        *canceller_slot.borrow_mut() = Some(canceller);
        this.started = true;
        Poll::Pending
    }
}
