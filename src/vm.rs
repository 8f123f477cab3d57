//! Actor instances and the resume machinery.
//!
//! An instance owns a strand, a fiber registry, an inbox and a
//! pending-operations registry, and is driven by one thread that drains
//! the strand queue. [`Actor`] is the handle fiber bodies use to reach
//! their own instance; it never leaves the owning thread.
//!
//! The resume protocol: a job calls [`Actor::resume`], the prologue
//! installs the fiber as current and clears its interrupter, the task
//! is polled once, and the epilogue dispatches on the result. When a
//! joined fiber finishes, control is handed to the joiner in the same
//! turn, iteratively, so arbitrarily long join chains cannot grow the
//! host stack.

use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;

use crate::completion::ExternalFuture;
use crate::error::{CoreError, ErrorObject, StdResult};
use crate::fiber::{
    print_panic, Builder, FiberHandle, FiberId, FiberRecord, FiberResult, HandleCell,
    Interrupter, JoinOutcome, Joiner, Resume, Task, YieldFuture,
};
use crate::inbox::{Address, InboxState, RecvFuture, SenderState};
use crate::pending::{PendingOperation, PendingOps, Ticket};
use crate::runtime::{AppInner, Program};
use crate::strand::{NextJob, Strand};
use crate::system::ExitMode;
use crate::value::Value;

pub(crate) const MAIN_FIBER: FiberId = FiberId(1);

////////////////////////////////////////////////////////////////////////////////
// Core
////////////////////////////////////////////////////////////////////////////////

/// The cross-thread part of an instance: everything an [`Address`] or a
/// posted job may touch from another thread.
pub(crate) struct Core {
    pub strand: Strand,
    /// Outstanding send capabilities for this instance's inbox.
    pub nsenders: AtomicUsize,
    pub name: Box<str>,
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct State {
    pub valid: bool,
    /// The allocation-failure analogue: an unrecoverable internal
    /// fault. Forces a close at the next epilogue.
    pub oom: bool,
    pub exit_request: bool,
    pub suppress_tail_errors: bool,
    pub current_fiber: Option<FiberId>,
    pub fibers: BTreeMap<FiberId, FiberRecord>,
    pub next_fiber: u64,
    pub inbox: InboxState,
    pub pending: PendingOps,
    pub deadlocks: Vec<String>,
    pub cleanup_fault: Option<FiberId>,
}

impl State {
    fn new() -> Self {
        Self {
            valid: true,
            oom: false,
            exit_request: false,
            suppress_tail_errors: false,
            current_fiber: None,
            fibers: BTreeMap::new(),
            next_fiber: MAIN_FIBER.0,
            inbox: InboxState::new(),
            pending: PendingOps::default(),
            deadlocks: Vec::new(),
            cleanup_fault: None,
        }
    }

    pub(crate) fn expect_current(&self) -> FiberId {
        self.current_fiber
            .expect("operation is only reachable from inside a running fiber")
    }

    /// The three-step suspension check: suspension forbidden beats
    /// everything, a disabled interruption masks the latch, and an
    /// observed latch fails the suspension point.
    pub(crate) fn check_suspend_allowed(&self) -> StdResult<(), ErrorObject> {
        let rec = &self.fibers[&self.expect_current()];
        if rec.suspension_disallowed != 0 {
            return Err(CoreError::ForbidSuspendBlock.into());
        }
        if rec.interruption_disabled > 0 {
            return Ok(());
        }
        if rec.interrupted {
            return Err(CoreError::Interrupted.into());
        }
        Ok(())
    }

    /// Installs the one-shot interrupter for a suspension point. With
    /// interruption disabled nothing is installed; the latch alone is
    /// enough, since it is observed at the next enabled suspension.
    pub(crate) fn install_interrupter(&mut self, fiber: FiberId, interrupter: Interrupter) {
        let rec = self
            .fibers
            .get_mut(&fiber)
            .expect("suspending fiber is registered");
        rec.wait_reason = Some(interrupter.wait_reason());
        if rec.interruption_disabled == 0 {
            rec.interrupter = Some(interrupter);
        }
    }

    pub(crate) fn take_resume(&mut self, fiber: FiberId) -> Option<Resume> {
        self.fibers.get_mut(&fiber).and_then(|rec| rec.resume_arg.take())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Actor
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Shared {
    core: Arc<Core>,
    app: Arc<AppInner>,
    state: RefCell<State>,
}

/// Handle to the current actor instance, passed to every fiber body.
///
/// Cloning is cheap; the handle never leaves the instance's thread.
#[derive(Clone)]
pub struct Actor {
    shared: Rc<Shared>,
}

enum Outcome {
    Suspended(Task),
    Finished(FiberResult),
}

impl Actor {
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.shared.core
    }

    pub(crate) fn app(&self) -> &Arc<AppInner> {
        &self.shared.app
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, State> {
        self.shared.state.borrow_mut()
    }

    fn color(&self) -> bool {
        self.shared.app.color_output()
    }

    ////////////////////////////////////////////////////////////////////////////
    // Fiber API
    ////////////////////////////////////////////////////////////////////////////

    /// Spawns a fiber running `f`; the body runs on the next scheduler
    /// turn. Equivalent to [`Builder::new().spawn(..)`](Builder).
    #[track_caller]
    pub fn spawn<F, Fut>(&self, f: F) -> FiberHandle
    where
        F: FnOnce(Actor) -> Fut,
        Fut: Future<Output = FiberResult> + 'static,
    {
        Builder::new().spawn(self, f)
    }

    pub(crate) fn spawn_with<F, Fut>(
        &self,
        name: Option<Box<str>>,
        spawned_at: &'static Location<'static>,
        f: F,
    ) -> FiberHandle
    where
        F: FnOnce(Actor) -> Fut,
        Fut: Future<Output = FiberResult> + 'static,
    {
        let cell = Rc::new(HandleCell {
            fiber: std::cell::Cell::new(None),
            interruption_caught: std::cell::Cell::new(None),
            join_in_progress: std::cell::Cell::new(false),
        });
        let id = {
            let mut state = self.state_mut();
            state.next_fiber += 1;
            let id = FiberId(state.next_fiber);
            let source_path = match state.current_fiber {
                Some(current) => state.fibers[&current].source_path.clone(),
                None => Arc::from(&*self.shared.core.name),
            };
            let record = FiberRecord::new(
                name,
                source_path,
                false,
                spawned_at,
                Rc::downgrade(&cell),
                Joiner::Pending,
            );
            state.fibers.insert(id, record);
            id
        };
        cell.fiber.set(Some(id));

        let task: Task = f(self.clone()).boxed_local();
        self.state_mut()
            .fibers
            .get_mut(&id)
            .expect("record was just inserted")
            .task = Some(task);

        self.shared.core.strand.post(Box::new(move |a: &Actor| {
            a.resume(id, None);
        }));
        FiberHandle {
            actor: self.clone(),
            cell,
        }
    }

    /// Cooperative yield: reschedules the current fiber behind the work
    /// already queued on the strand.
    pub fn yield_now(&self) -> YieldFuture {
        YieldFuture {
            actor: self.clone(),
            started: false,
        }
    }

    /// Masks interrupt observation for the current fiber. Counts; every
    /// call needs a matching [`restore_interruption`](Self::restore_interruption).
    pub fn disable_interruption(&self) {
        let mut state = self.state_mut();
        let id = state.expect_current();
        state.fibers.get_mut(&id).unwrap().interruption_disabled += 1;
    }

    pub fn restore_interruption(&self) -> StdResult<(), ErrorObject> {
        let mut state = self.state_mut();
        let id = state.expect_current();
        let rec = state.fibers.get_mut(&id).unwrap();
        if rec.interruption_disabled == 0 {
            return Err(CoreError::InterruptionAlreadyAllowed.into());
        }
        rec.interruption_disabled -= 1;
        Ok(())
    }

    /// Forbids suspension of the current fiber: any suspension point
    /// fails with `forbid_suspend_block` until the matching
    /// [`allow_suspend`](Self::allow_suspend).
    pub fn forbid_suspend(&self) {
        let mut state = self.state_mut();
        let id = state.expect_current();
        state.fibers.get_mut(&id).unwrap().suspension_disallowed += 1;
    }

    pub fn allow_suspend(&self) -> StdResult<(), ErrorObject> {
        let mut state = self.state_mut();
        let id = state.expect_current();
        let rec = state.fibers.get_mut(&id).unwrap();
        if rec.suspension_disallowed == 0 {
            return Err(CoreError::SuspensionAlreadyAllowed.into());
        }
        rec.suspension_disallowed -= 1;
        Ok(())
    }

    /// Reads a value from the current fiber's local storage.
    pub fn get_local(&self, key: &str) -> Option<Value> {
        let mut state = self.state_mut();
        let id = state.expect_current();
        state
            .fibers
            .get_mut(&id)
            .unwrap()
            .local
            .as_ref()
            .and_then(|map| map.get(key).cloned())
    }

    /// Writes a value into the current fiber's local storage (created
    /// lazily on first write).
    pub fn set_local(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut state = self.state_mut();
        let id = state.expect_current();
        state
            .fibers
            .get_mut(&id)
            .unwrap()
            .local
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// True inside the instance's main fiber.
    pub fn is_main(&self) -> bool {
        let state = self.state_mut();
        let id = state.expect_current();
        state.fibers[&id].main
    }

    /// Scheduling identity of the current fiber.
    pub fn fiber_id(&self) -> FiberId {
        self.state_mut().expect_current()
    }

    /// Pushes a cleanup handler for the current fiber. Remaining
    /// handlers run in reverse order when the fiber finishes.
    pub fn scope_cleanup_push(&self, f: impl FnOnce(&Actor) + 'static) {
        let mut state = self.state_mut();
        let id = state.expect_current();
        state.fibers.get_mut(&id).unwrap().cleanup.push(Box::new(f));
    }

    /// Pops the most recent cleanup handler, running it when `execute`
    /// is set. Fails with `unmatched_scope_cleanup` on an empty stack.
    pub fn scope_cleanup_pop(&self, execute: bool) -> StdResult<(), ErrorObject> {
        let handler = {
            let mut state = self.state_mut();
            let id = state.expect_current();
            match state.fibers.get_mut(&id).unwrap().cleanup.pop() {
                Some(h) => h,
                None => return Err(CoreError::UnmatchedScopeCleanup.into()),
            }
        };
        if execute {
            handler(self);
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Inbox API
    ////////////////////////////////////////////////////////////////////////////

    /// Receives the next message from this instance's inbox, suspending
    /// until a sender arrives.
    pub fn recv(&self) -> RecvFuture {
        RecvFuture {
            actor: self.clone(),
            started: false,
        }
    }

    /// Closes the inbox: a blocked receiver wakes with `channel_closed`
    /// and every queued sender is woken the same way.
    pub fn close_inbox(&self) {
        let (receiver, drained) = {
            let mut state = self.state_mut();
            if !state.inbox.open {
                return;
            }
            state.inbox.open = false;
            let receiver = state.inbox.recv_fiber.take();
            if receiver.is_some() {
                state.inbox.recv_guard = None;
            }
            let mut drained: Vec<SenderState> = state.inbox.incoming.drain(..).collect();
            for sender in &mut drained {
                sender.wake_on_destruct = true;
            }
            (receiver, drained)
        };
        if let Some(receiver) = receiver {
            self.shared.core.strand.post(Box::new(move |a: &Actor| {
                a.resume(
                    receiver,
                    Some(Resume::Payload(Err(CoreError::ChannelClosed.into()))),
                );
            }));
        }
        // Dropping the queue entries posts the channel_closed wakes.
        drop(drained);
    }

    /// Hands out a fresh send capability for this instance's inbox and
    /// remembers that the capability escaped.
    pub(crate) fn export_inbox(&self) -> Address {
        self.state_mut().inbox.imported = true;
        Address::new(&self.shared.core)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Actor management API
    ////////////////////////////////////////////////////////////////////////////

    /// Spawns another actor instance running the named module; `"."`
    /// spawns the current fiber's own module. Returns the send
    /// capability for the new instance's inbox.
    pub fn spawn_actor(&self, module: &str) -> StdResult<Address, ErrorObject> {
        let module: Arc<str> = if module == "." {
            let state = self.state_mut();
            let id = state.expect_current();
            state.fibers[&id].source_path.clone()
        } else {
            Arc::from(module)
        };
        crate::runtime::spawn_instance(&self.shared.app, &module)
    }

    /// True for the first instance spawned by the runtime.
    pub fn is_master(&self) -> bool {
        self.shared.app.is_master(&self.shared.core)
    }

    /// Requests termination. `Graceful` marks this instance for
    /// shutdown (and, from the master, stops every instance and sets
    /// the process exit code); it takes effect at the next epilogue.
    /// `Quick` and `Abort` do not return.
    pub fn exit(&self, code: i32, mode: ExitMode) {
        match mode {
            ExitMode::Quick => std::process::exit(code),
            ExitMode::Abort => std::process::abort(),
            ExitMode::Graceful => {
                self.state_mut().exit_request = true;
                if self.is_master() {
                    self.shared.app.set_exit_code(code);
                    let self_core = self.shared.core.clone();
                    self.shared.app.for_each_instance(|core| {
                        if Arc::ptr_eq(&core, &self_core) {
                            return;
                        }
                        core.strand.post(Box::new(|a: &Actor| {
                            a.state_mut().exit_request = true;
                            a.close();
                        }));
                    });
                }
            }
        }
    }

    /// Sends a signal to the current process. Only the master instance
    /// may raise signals whose default disposition terminates the
    /// process.
    pub fn raise(&self, signo: i32) -> StdResult<(), ErrorObject> {
        crate::system::raise_gated(signo, self.is_master())
    }

    ////////////////////////////////////////////////////////////////////////////
    // External-operation glue
    ////////////////////////////////////////////////////////////////////////////

    /// Suspends until an external operation completes.
    ///
    /// `start` receives the [`Completion`](crate::completion::Completion)
    /// used to finish the wait from any thread and returns the
    /// cancellation action, which runs if the fiber is interrupted or
    /// the instance shuts down first.
    pub fn wait_external<S>(&self, start: S) -> ExternalFuture<S>
    where
        S: FnOnce(crate::completion::Completion) -> Box<dyn FnOnce() + 'static>,
    {
        ExternalFuture::new(self.clone(), start)
    }

    /// Registers cleanup code to run if the instance shuts down before
    /// [`complete_pending`](Self::complete_pending) unlinks it.
    pub fn register_pending(&self, op: Box<dyn PendingOperation>) -> Ticket {
        self.state_mut().pending.register(op)
    }

    /// Unlinks a pending operation without cancelling it. Must be
    /// called before a completion handler runs user code. Stale tickets
    /// return `false`.
    pub fn complete_pending(&self, ticket: Ticket) -> bool {
        self.state_mut().pending.complete(ticket)
    }

    /// Unlinks a pending operation and runs its cancellation now.
    pub fn cancel_pending(&self, ticket: Ticket) -> bool {
        self.state_mut().pending.cancel_now(ticket)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Resume machinery
    ////////////////////////////////////////////////////////////////////////////

    /// Resumes a fiber with an optional argument. A no-op when the
    /// instance is closed or the fiber is gone: completion handlers
    /// that fire after `close()` fall through here.
    pub(crate) fn resume(&self, fiber: FiberId, arg: Option<Resume>) {
        let task = {
            let mut state = self.state_mut();
            if !state.valid {
                return;
            }
            debug_assert!(
                state.current_fiber.is_none(),
                "strand handlers never nest resumes"
            );
            let rec = match state.fibers.get_mut(&fiber) {
                Some(rec) => rec,
                None => return,
            };
            let task = match rec.task.take() {
                Some(task) => task,
                None => return,
            };
            // Prologue: the interrupter is cleared before user code
            // runs, so firing it twice is impossible.
            rec.interrupter = None;
            rec.wait_reason = None;
            rec.resume_arg = arg;
            state.current_fiber = Some(fiber);
            task
        };
        let outcome = self.poll_task(fiber, task);
        self.finish_epilogue(fiber, outcome);
    }

    fn poll_task(&self, fiber: FiberId, mut task: Task) -> Outcome {
        let waker = waker::fiber_waker(self.shared.core.strand.clone(), fiber);
        let mut cx = Context::from_waker(&waker);
        match catch_unwind(AssertUnwindSafe(|| task.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => Outcome::Suspended(task),
            Ok(Poll::Ready(result)) => Outcome::Finished(result),
            Err(payload) => Outcome::Finished(Err(ErrorObject::panic(panic_message(&payload)))),
        }
    }

    fn finish_epilogue(&self, mut cur: FiberId, mut outcome: Outcome) {
        loop {
            {
                let state = self.state_mut();
                if !state.valid {
                    return;
                }
                if state.oom || state.cleanup_fault.is_some() || state.exit_request {
                    drop(state);
                    self.close();
                    return;
                }
            }
            match outcome {
                Outcome::Suspended(task) => {
                    let mut state = self.state_mut();
                    if let Some(rec) = state.fibers.get_mut(&cur) {
                        rec.task = Some(task);
                    }
                    state.current_fiber = None;
                    return;
                }
                Outcome::Finished(result) => {
                    if !self.run_cleanup_handlers(cur) {
                        return; // a handler faulted; the instance closed
                    }
                    {
                        let state = self.state_mut();
                        if state.exit_request || state.oom {
                            drop(state);
                            self.close();
                            return;
                        }
                    }
                    let joiner = {
                        let state = self.state_mut();
                        state
                            .fibers
                            .get(&cur)
                            .map(|rec| rec.joiner)
                            .unwrap_or(Joiner::Detached)
                    };
                    match joiner {
                        Joiner::Detached => {
                            self.finish_detached(cur, result);
                            return;
                        }
                        Joiner::Pending => {
                            // The user handle is still around; park the
                            // result until it joins or detaches.
                            let mut state = self.state_mut();
                            if let Some(rec) = state.fibers.get_mut(&cur) {
                                rec.status = Some(result);
                            }
                            state.current_fiber = None;
                            return;
                        }
                        Joiner::Joined(joiner_id) => {
                            let task = {
                                let mut state = self.state_mut();
                                let rec = state
                                    .fibers
                                    .remove(&cur)
                                    .expect("finished fiber is still registered");
                                let cell = rec.user_handle.upgrade();
                                let arg = match result {
                                    Ok(values) => {
                                        update_handle(&cell, Some(false));
                                        Ok(JoinOutcome::Completed(values))
                                    }
                                    Err(obj) if obj.is_interrupted() => {
                                        update_handle(&cell, Some(true));
                                        Ok(JoinOutcome::Interrupted)
                                    }
                                    Err(obj) => {
                                        update_handle(&cell, Some(false));
                                        Err(obj)
                                    }
                                };
                                // Tail-style transfer: the joiner runs in
                                // this same turn instead of bouncing
                                // through the queue.
                                let jrec = match state.fibers.get_mut(&joiner_id) {
                                    Some(rec) => rec,
                                    None => {
                                        state.current_fiber = None;
                                        return;
                                    }
                                };
                                jrec.interrupter = None;
                                jrec.wait_reason = None;
                                jrec.resume_arg = Some(Resume::Join(arg));
                                let task = jrec.task.take();
                                state.current_fiber = Some(joiner_id);
                                match task {
                                    Some(task) => task,
                                    None => {
                                        state.current_fiber = None;
                                        return;
                                    }
                                }
                            };
                            outcome = self.poll_task(joiner_id, task);
                            cur = joiner_id;
                        }
                    }
                }
            }
        }
    }

    /// Runs the fiber's remaining cleanup handlers, LIFO. Returns
    /// `false` when a handler faulted and the instance was closed.
    fn run_cleanup_handlers(&self, fiber: FiberId) -> bool {
        let handlers = {
            let mut state = self.state_mut();
            state
                .fibers
                .get_mut(&fiber)
                .map(|rec| std::mem::take(&mut rec.cleanup))
                .unwrap_or_default()
        };
        for handler in handlers.into_iter().rev() {
            if catch_unwind(AssertUnwindSafe(|| handler(self))).is_err() {
                self.state_mut().cleanup_fault = Some(fiber);
                self.close();
                return false;
            }
        }
        true
    }

    fn finish_detached(&self, fiber: FiberId, result: FiberResult) {
        let mut state = self.state_mut();
        let rec = state
            .fibers
            .remove(&fiber)
            .expect("finished fiber is still registered");
        state.current_fiber = None;
        let description = rec.describe(fiber);
        let color = self.color();

        if rec.main {
            // Main fiber exit retires the inbox unless its capability
            // was handed out in a message.
            if !state.inbox.imported {
                state.inbox.open = false;
                let mut drained: Vec<SenderState> = state.inbox.incoming.drain(..).collect();
                for sender in &mut drained {
                    sender.wake_on_destruct = true;
                }
                drop(state);
                drop(drained);
            } else {
                drop(state);
            }
            if let Err(obj) = &result {
                print_panic(color, true, &description, obj, rec.spawned_at);
                self.state_mut().suppress_tail_errors = true;
                self.close();
            }
            return;
        }

        drop(state);
        if let Err(obj) = &result {
            if !obj.is_interrupted() {
                print_panic(color, false, &description, obj, rec.spawned_at);
            }
        }
    }

    /// Collects a finished fiber or marks a running one detached; used
    /// by handle detach and drop.
    pub(crate) fn collect_or_detach(&self, fiber: FiberId) {
        let collected = {
            let mut state = self.state_mut();
            let rec = match state.fibers.get_mut(&fiber) {
                Some(rec) => rec,
                None => return,
            };
            if rec.status.is_none() {
                rec.joiner = Joiner::Detached;
                return;
            }
            state.fibers.remove(&fiber)
        };
        if let Some(rec) = collected {
            if let Some(Err(obj)) = &rec.status {
                if !obj.is_interrupted() {
                    print_panic(
                        self.color(),
                        rec.main,
                        &rec.describe(fiber),
                        obj,
                        rec.spawned_at,
                    );
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Shutdown
    ////////////////////////////////////////////////////////////////////////////

    /// The shutdown sequencer. Runs at most once; after it returns no
    /// completion handler can resume a fiber.
    pub(crate) fn close(&self) {
        let (fibers, drained, recv_guard, mut pending) = {
            let mut state = self.state_mut();
            if !state.valid {
                return;
            }

            if state.oom {
                log::error!(
                    target: "spindle",
                    "instance '{}' forcibly closed: out of memory",
                    self.shared.core.name,
                );
                state.suppress_tail_errors = true;
            }
            if !state.suppress_tail_errors {
                if let Some(fiber) = state.cleanup_fault {
                    log::error!(
                        target: "spindle",
                        "instance '{}' forcibly closed: error raised by a cleanup handler of fiber {}",
                        self.shared.core.name,
                        fiber,
                    );
                    state.suppress_tail_errors = true;
                }
            }
            if !state.suppress_tail_errors && !state.deadlocks.is_empty() {
                log::error!(
                    target: "spindle",
                    "possible deadlock(s) detected during shutdown of instance '{}':\n\t{}",
                    self.shared.core.name,
                    state.deadlocks.join("\n\t"),
                );
            }

            state.valid = false;
            state.current_fiber = None;
            let fibers = std::mem::take(&mut state.fibers);

            state.inbox.open = false;
            state.inbox.recv_fiber = None;
            let recv_guard = state.inbox.recv_guard.take();
            let mut drained: Vec<SenderState> = state.inbox.incoming.drain(..).collect();
            for sender in &mut drained {
                sender.wake_on_destruct = true;
            }

            let pending = std::mem::take(&mut state.pending);
            (fibers, drained, recv_guard, pending)
        };

        self.shared.core.strand.close();
        // Task drop glue may reach back into the instance; the borrow
        // is released by now and `valid` is already false.
        drop(fibers);
        drop(drained);
        drop(recv_guard);
        pending.drain();
    }

    /// Called when the queue ran dry with no guard left: either the
    /// instance is simply done, or its remaining fibers can never be
    /// woken again.
    fn on_starved(&self) {
        {
            let mut state = self.state_mut();
            if state.valid {
                let stuck: Vec<String> = state
                    .fibers
                    .iter()
                    .filter(|(_, rec)| rec.task.is_some())
                    .map(|(id, rec)| {
                        format!(
                            "fiber {} suspended on {}",
                            rec.describe(*id),
                            rec.wait_reason.unwrap_or("an unknown wait"),
                        )
                    })
                    .collect();
                state.deadlocks.extend(stuck);
            }
        }
        self.close();
    }
}

fn update_handle(cell: &Option<Rc<HandleCell>>, caught: Option<bool>) {
    if let Some(cell) = cell {
        cell.fiber.set(None);
        cell.interruption_caught.set(caught);
        cell.join_in_progress.set(false);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).into()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unidentified panic payload".into()
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.shared.core.name)
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Instance bootstrap and loop
////////////////////////////////////////////////////////////////////////////////

/// Entry point of an actor thread: builds the instance, spawns the main
/// fiber from `program` and drains the strand until the instance dies.
pub(crate) fn boot_and_run(core: Arc<Core>, app: Arc<AppInner>, program: Program) {
    let actor = Actor {
        shared: Rc::new(Shared {
            core: core.clone(),
            app,
            state: RefCell::new(State::new()),
        }),
    };

    {
        let mut state = actor.state_mut();
        let mut record = FiberRecord::new(
            Some("main".into()),
            Arc::from(&*core.name),
            true,
            Location::caller(),
            std::rc::Weak::new(),
            Joiner::Detached,
        );
        record.task = Some(program(actor.clone()));
        state.fibers.insert(MAIN_FIBER, record);
    }
    core.strand.post(Box::new(|a: &Actor| {
        a.resume(MAIN_FIBER, None);
    }));

    loop {
        match core.strand.next() {
            NextJob::Run(job) => job(&actor),
            NextJob::Starved => actor.on_starved(),
            NextJob::Shutdown => break,
        }
    }
    actor.close();
}

////////////////////////////////////////////////////////////////////////////////
// Waker
////////////////////////////////////////////////////////////////////////////////

mod waker {
    use std::sync::Arc;
    use std::task::{Wake, Waker};

    use super::Actor;
    use crate::fiber::FiberId;
    use crate::strand::Strand;

    /// Waker handed to fiber tasks. A wake posts a plain resume; the
    /// crate's suspension futures treat a resume with no argument as
    /// spurious, so foreign wakes cannot complete a wait early.
    struct FiberWaker {
        strand: Strand,
        fiber: FiberId,
    }

    impl Wake for FiberWaker {
        fn wake(self: Arc<Self>) {
            self.wake_by_ref();
        }

        fn wake_by_ref(self: &Arc<Self>) {
            let fiber = self.fiber;
            self.strand.post(Box::new(move |a: &Actor| {
                a.resume(fiber, None);
            }));
        }
    }

    pub(super) fn fiber_waker(strand: Strand, fiber: FiberId) -> Waker {
        Waker::from(Arc::new(FiberWaker { strand, fiber }))
    }
}
