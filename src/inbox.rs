//! Actor mailboxes.
//!
//! Each instance owns exactly one inbox: an unbuffered rendezvous
//! channel with any number of senders and a single receiver. An
//! [`Address`] is the send capability; it holds a weak reference to the
//! destination plus a work guard on the destination's strand, and the
//! outstanding-address count (`nsenders`) is what turns an empty inbox
//! into the `no_senders` error instead of a wait that can never end.
//!
//! Delivery and its cancellation are both posted to the destination
//! strand. FIFO order between the two is what makes cancellation safe:
//! the cancel scan can trust that a missing queue entry means the
//! message was already consumed.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use crate::error::{CoreError, ErrorObject, StdResult};
use crate::fiber::{FiberId, Interrupter, Resume};
use crate::strand::WorkGuard;
use crate::transfer;
use crate::value::{Payload, Value};
use crate::vm::{Actor, Core};

////////////////////////////////////////////////////////////////////////////////
// Inbox state
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct InboxState {
    /// Fiber currently blocked in `recv`, if any.
    pub recv_fiber: Option<FiberId>,
    /// Keeps the loop alive while a receive is pending.
    pub recv_guard: Option<WorkGuard>,
    /// Senders waiting for a receiver, in arrival order.
    pub incoming: VecDeque<SenderState>,
    pub open: bool,
    /// Set once the inbox capability was handed out in a message; the
    /// main fiber's exit then no longer retires the inbox.
    pub imported: bool,
}

impl InboxState {
    pub(crate) fn new() -> Self {
        Self {
            recv_fiber: None,
            recv_guard: None,
            incoming: VecDeque::new(),
            open: true,
            imported: false,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// SenderState
////////////////////////////////////////////////////////////////////////////////

/// Snapshot of one suspended `send`, moved into the destination's
/// queue. Dropping it with `wake_on_destruct` still set resumes the
/// sender fiber with `channel_closed`; that is how every "the message
/// can no longer be delivered" path wakes the sender, including jobs
/// that never ran because the destination strand already closed.
pub(crate) struct SenderState {
    pub origin: Arc<Core>,
    pub fiber: FiberId,
    pub msg: Option<Payload>,
    pub wake_on_destruct: bool,
    _guard: WorkGuard,
}

impl SenderState {
    pub(crate) fn new(origin: Arc<Core>, fiber: FiberId, msg: Payload) -> Self {
        let guard = origin.strand.work_guard();
        Self {
            origin,
            fiber,
            msg: Some(msg),
            wake_on_destruct: true,
            _guard: guard,
        }
    }

    /// Same-sender check used by the cancel scan; the payload is
    /// ignored.
    pub(crate) fn is_from(&self, origin: &Arc<Core>, fiber: FiberId) -> bool {
        Arc::ptr_eq(&self.origin, origin) && self.fiber == fiber
    }
}

impl Drop for SenderState {
    fn drop(&mut self) {
        if !self.wake_on_destruct {
            return;
        }
        let fiber = self.fiber;
        self.origin.strand.post(Box::new(move |a: &Actor| {
            a.resume(
                fiber,
                Some(Resume::Unit(Err(CoreError::ChannelClosed.into()))),
            );
        }));
    }
}

////////////////////////////////////////////////////////////////////////////////
// Address
////////////////////////////////////////////////////////////////////////////////

struct AddressInner {
    dest: Weak<Core>,
    _guard: WorkGuard,
}

/// Send capability for some actor's inbox.
///
/// Cloning increments the destination's sender count; dropping the last
/// address while a receiver is blocked wakes it with `no_senders`.
pub struct Address {
    inner: Option<AddressInner>,
}

impl Address {
    pub(crate) fn new(dest: &Arc<Core>) -> Self {
        dest.nsenders.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Some(AddressInner {
                dest: Arc::downgrade(dest),
                _guard: dest.strand.work_guard(),
            }),
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Core>> {
        self.inner.as_ref().and_then(|i| i.dest.upgrade())
    }

    pub(crate) fn is_closed_handle(&self) -> bool {
        self.inner.is_none()
    }

    /// Sends a value to the destination actor, suspending the calling
    /// fiber until the message is taken by the receiver.
    ///
    /// Fails with `channel_closed` when the destination inbox is closed
    /// or gone, `invalid_argument`/`not_supported` when the value is
    /// not transferable, and with a codec error when the value graph
    /// breaks the cycle/depth/length rules.
    pub fn send<'a>(&'a self, actor: &Actor, value: Value) -> SendFuture<'a> {
        SendFuture {
            actor: actor.clone(),
            address: self,
            value: Some(value),
            started: false,
        }
    }

    /// Drops the capability carried by this handle. Idempotent; a
    /// closed handle fails every `send` with `channel_closed`.
    pub fn close(&mut self) {
        self.inner = None;
    }
}

impl Clone for Address {
    fn clone(&self) -> Self {
        match &self.inner {
            Some(inner) => match inner.dest.upgrade() {
                Some(dest) => Self::new(&dest),
                // The destination died; keep a dead weak reference so
                // sends keep failing with channel_closed.
                None => Self {
                    inner: Some(AddressInner {
                        dest: inner.dest.clone(),
                        _guard: inner._guard.clone(),
                    }),
                },
            },
            None => Self { inner: None },
        }
    }
}

impl Drop for Address {
    fn drop(&mut self) {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return,
        };
        let dest = match inner.dest.upgrade() {
            Some(dest) => dest,
            None => return,
        };
        if dest.nsenders.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last address gone: wake a blocked receiver with `no_senders`.
        // The count is re-checked on the destination strand because a
        // fiber over there may have created a fresh address in between.
        dest.strand.post(Box::new(move |a: &Actor| {
            if a.core().nsenders.load(Ordering::Acquire) != 0 {
                return;
            }
            let receiver = {
                let mut state = a.state_mut();
                match state.inbox.recv_fiber.take() {
                    Some(r) => {
                        state.inbox.recv_guard = None;
                        r
                    }
                    None => return,
                }
            };
            a.resume(
                receiver,
                Some(Resume::Payload(Err(CoreError::NoSenders.into()))),
            );
        }));
    }
}

impl PartialEq for Address {
    /// Two addresses are equal when they reference the same actor.
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Weak::ptr_eq(&a.dest, &b.dest),
            _ => false,
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            None => "closed",
            Some(inner) if inner.dest.strong_count() == 0 => "dead",
            Some(_) => "open",
        };
        f.debug_struct("Address").field("state", &state).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// SendFuture
////////////////////////////////////////////////////////////////////////////////

/// Future returned by [`Address::send`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct SendFuture<'a> {
    actor: Actor,
    address: &'a Address,
    value: Option<Value>,
    started: bool,
}

impl<'a> Future for SendFuture<'a> {
    type Output = StdResult<(), ErrorObject>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let actor = self.actor.clone();
        if self.started {
            let mut state = actor.state_mut();
            let me = state.expect_current();
            return match state.take_resume(me) {
                Some(Resume::Unit(result)) => Poll::Ready(result),
                Some(_) | None => Poll::Pending,
            };
        }

        {
            let state = actor.state_mut();
            if let Err(e) = state.check_suspend_allowed() {
                return Poll::Ready(Err(e));
            }
        }
        if self.address.is_closed_handle() {
            return Poll::Ready(Err(CoreError::ChannelClosed.into()));
        }
        let dest = match self.address.upgrade() {
            Some(dest) => dest,
            None => return Poll::Ready(Err(CoreError::ChannelClosed.into())),
        };

        let value = self.value.take().expect("send polled twice before start");
        let payload = match transfer::serialize(&actor, &value) {
            Ok(payload) => payload,
            Err(e) => return Poll::Ready(Err(e)),
        };

        let origin = actor.core().clone();
        let me = {
            let mut state = actor.state_mut();
            let me = state.expect_current();
            state.install_interrupter(
                me,
                Interrupter::CancelSend {
                    dest: Arc::downgrade(&dest),
                    origin: origin.clone(),
                    fiber: me,
                },
            );
            me
        };

        let sender = SenderState::new(origin, me, payload);
        // If the destination strand is already closed the job is
        // dropped right away and the sender-state drop wakes us with
        // `channel_closed`; either way we suspend now.
        dest.strand.post(Box::new(move |dest_actor: &Actor| {
            deliver(dest_actor, sender);
        }));
        self.started = true;
        Poll::Pending
    }
}

/// Delivery action, running on the destination strand.
fn deliver(dest_actor: &Actor, mut sender: SenderState) {
    let mut state = dest_actor.state_mut();
    if !state.inbox.open {
        // Dropping `sender` with wake_on_destruct set resumes the
        // sender fiber with `channel_closed`.
        return;
    }
    match state.inbox.recv_fiber.take() {
        Some(receiver) => {
            state.inbox.recv_guard = None;
            let payload = sender.msg.take().expect("queued sender keeps its payload");
            sender.wake_on_destruct = false;
            let origin = sender.origin.clone();
            let fiber = sender.fiber;
            drop(sender);
            drop(state);
            dest_actor.resume(receiver, Some(Resume::Payload(Ok(payload))));
            origin.strand.post(Box::new(move |a: &Actor| {
                a.resume(fiber, Some(Resume::Unit(Ok(()))));
            }));
        }
        None => {
            // The sender lives in the queue now; a drop from here on is
            // an explicit close path which re-sets the flag first.
            sender.wake_on_destruct = false;
            state.inbox.incoming.push_back(sender);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// RecvFuture
////////////////////////////////////////////////////////////////////////////////

/// Future returned by [`Actor::recv`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct RecvFuture {
    pub(crate) actor: Actor,
    pub(crate) started: bool,
}

impl Future for RecvFuture {
    type Output = StdResult<Value, ErrorObject>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let actor = self.actor.clone();
        if self.started {
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

        let mut state = actor.state_mut();
        if let Err(e) = state.check_suspend_allowed() {
            return Poll::Ready(Err(e));
        }
        if !state.inbox.open {
            return Poll::Ready(Err(CoreError::ChannelClosed.into()));
        }
        if state.inbox.recv_fiber.is_some() {
            return Poll::Ready(Err(crate::error::GenericError::DeviceOrResourceBusy.into()));
        }

        if let Some(mut sender) = state.inbox.incoming.pop_front() {
            let payload = sender.msg.take().expect("queued sender keeps its payload");
            let fiber = sender.fiber;
            let origin = sender.origin.clone();
            drop(state);
            drop(sender);
            origin.strand.post(Box::new(move |a: &Actor| {
                a.resume(fiber, Some(Resume::Unit(Ok(()))));
            }));
            return Poll::Ready(Ok(transfer::reify(payload)));
        }

        // Logical errors are checked before runtime ones.
        if actor.core().nsenders.load(Ordering::Acquire) == 0 {
            return Poll::Ready(Err(CoreError::NoSenders.into()));
        }

        let me = state.expect_current();
        state.inbox.recv_fiber = Some(me);
        state.inbox.recv_guard = Some(actor.core().strand.work_guard());
        state.install_interrupter(me, Interrupter::CancelRecv);
        drop(state);
        self.started = true;
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strand::Strand;
    use std::sync::atomic::AtomicUsize;

    fn test_core() -> Arc<Core> {
        Arc::new(Core {
            strand: Strand::new(),
            nsenders: AtomicUsize::new(0),
            name: "test".into(),
        })
    }

    #[test]
    fn address_counts_senders() {
        let core = test_core();
        let a = Address::new(&core);
        assert_eq!(core.nsenders.load(Ordering::Acquire), 1);
        let b = a.clone();
        assert_eq!(core.nsenders.load(Ordering::Acquire), 2);
        drop(a);
        assert_eq!(core.nsenders.load(Ordering::Acquire), 1);
        drop(b);
        assert_eq!(core.nsenders.load(Ordering::Acquire), 0);
    }

    #[test]
    fn address_equality_is_by_destination() {
        let core = test_core();
        let other = test_core();
        let a = Address::new(&core);
        let b = a.clone();
        let c = Address::new(&other);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut closed = a.clone();
        closed.close();
        assert_ne!(closed, b);
        assert!(closed.is_closed_handle());
    }

    #[test]
    fn close_is_idempotent() {
        let core = test_core();
        let mut a = Address::new(&core);
        a.close();
        a.close();
        assert_eq!(core.nsenders.load(Ordering::Acquire), 0);
    }
}
