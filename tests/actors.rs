//! End-to-end scenarios driving whole actor instances.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use spindle::completion::Completion;
use spindle::error::{CodecError, CoreError, GenericError};
use spindle::fiber::Builder;
use spindle::{Actor, ExitMode, JoinOutcome, Runtime, Table, Value};

type Reports = Arc<Mutex<Vec<String>>>;

fn report(reports: &Reports, message: impl Into<String>) {
    reports.lock().unwrap().push(message.into());
}

fn assert_reported(reports: &Reports, expected: &[&str]) {
    let mut got = reports.lock().unwrap().clone();
    let mut want: Vec<String> = expected.iter().map(|s| (*s).into()).collect();
    got.sort();
    want.sort();
    assert_eq!(got, want);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: ping/pong with an embedded reply address
////////////////////////////////////////////////////////////////////////////////

#[test]
fn ping_pong_and_no_senders_after_close() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let server_reports = reports.clone();
    runtime.register("pong-server", move |actor: Actor| {
        let reports = server_reports.clone();
        async move {
            let msg = actor.recv().await?;
            let table = msg.as_table().expect("ping carries a table").clone();
            assert_eq!(table.get("cmd").unwrap().as_str(), Some("ping"));
            let reply = table.get("reply").unwrap();
            let reply = reply.as_address().expect("ping carries a reply address");

            let pong = Table::new();
            pong.set("cmd", "pong");
            reply.send(&actor, Value::Table(pong)).await?;
            drop(msg);

            match actor.recv().await {
                Err(e) if e.is(CoreError::NoSenders) => {
                    report(&reports, "server saw no_senders");
                }
                other => panic!("expected no_senders, got {:?}", other.map(|_| ())),
            }
            Ok(vec![])
        }
    });

    let driver_reports = reports.clone();
    runtime.register("driver", move |actor: Actor| {
        let reports = driver_reports.clone();
        async move {
            let mut server = actor.spawn_actor("pong-server")?;

            let ping = Table::new();
            ping.set("cmd", "ping");
            ping.set("reply", Value::OwnInbox);
            server.send(&actor, Value::Table(ping)).await?;

            let pong = actor.recv().await?;
            assert_eq!(
                pong.as_table().unwrap().get("cmd").unwrap().as_str(),
                Some("pong"),
            );
            report(&reports, "driver saw pong");

            server.close();
            match actor.recv().await {
                Err(e) if e.is(CoreError::NoSenders) => {
                    report(&reports, "driver saw no_senders");
                }
                other => panic!("expected no_senders, got {:?}", other.map(|_| ())),
            }
            Ok(vec![])
        }
    });

    let mut driver = runtime.spawn_actor("driver").unwrap();
    driver.close();
    assert_eq!(runtime.run(), 0);
    assert_reported(
        &reports,
        &["driver saw pong", "driver saw no_senders", "server saw no_senders"],
    );
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: join success and join error
////////////////////////////////////////////////////////////////////////////////

#[test]
fn join_returns_the_fibers_values() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let main_reports = reports.clone();
    runtime.register("main", move |actor: Actor| {
        let reports = main_reports.clone();
        async move {
            let mut worker = Builder::new().name("worker").spawn(&actor, |_| async {
                Ok(vec![Value::Number(1.0), Value::str("two"), Value::Bool(true)])
            });
            assert!(worker.joinable());
            match worker.join().await? {
                JoinOutcome::Completed(values) => {
                    assert_eq!(values.len(), 3);
                    assert_eq!(values[0].as_number(), Some(1.0));
                    assert_eq!(values[1].as_str(), Some("two"));
                    assert!(matches!(values[2], Value::Bool(true)));
                    report(&reports, "joined");
                }
                other => panic!("unexpected join outcome: {:?}", other),
            }
            assert!(!worker.joinable());
            Ok(vec![])
        }
    });

    let mut main = runtime.spawn_actor("main").unwrap();
    main.close();
    runtime.run();
    assert_reported(&reports, &["joined"]);
}

#[test]
fn join_raises_the_fibers_error_verbatim() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let main_reports = reports.clone();
    runtime.register("main", move |actor: Actor| {
        let reports = main_reports.clone();
        async move {
            let raised = spindle::ErrorObject::new(42, "x").with_field("detail", "boom");
            let thrown = raised.clone();
            let mut worker = actor.spawn(move |_| async move { Err(thrown) });
            match worker.join().await {
                Err(e) => {
                    assert_eq!(e, raised);
                    assert_eq!(worker.interruption_caught(), Ok(false));
                    report(&reports, "error came back verbatim");
                }
                Ok(other) => panic!("unexpected join outcome: {:?}", other),
            }
            Ok(vec![])
        }
    });

    let mut main = runtime.spawn_actor("main").unwrap();
    main.close();
    runtime.run();
    assert_reported(&reports, &["error came back verbatim"]);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: interrupting a fiber blocked in recv
////////////////////////////////////////////////////////////////////////////////

#[test]
fn interrupt_unblocks_a_blocked_receive() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let victim_reports = reports.clone();
    runtime.register("victim", move |actor: Actor| {
        let reports = victim_reports.clone();
        async move {
            // Handshake first, so the driver's reply address does not
            // race with the blocked fiber's receive.
            let hello = actor.recv().await?;
            let reply = hello.as_table().unwrap().get("reply").unwrap();
            let reply = reply.as_address().unwrap().clone();
            drop(hello);

            let mut blocked = actor.spawn(|a| async move {
                // The driver still holds our address, so this parks
                // instead of failing with no_senders.
                let value = a.recv().await?;
                Ok(vec![value])
            });
            actor.yield_now().await?;

            blocked.interrupt();
            match blocked.join().await? {
                JoinOutcome::Interrupted => {
                    assert_eq!(blocked.interruption_caught(), Ok(true));
                    report(&reports, "join observed the interruption");
                }
                other => panic!("unexpected join outcome: {:?}", other),
            }

            reply.send(&actor, Value::str("done")).await?;

            // The receiver slot must be free again: once the driver
            // drops our address, a fresh recv reports no_senders
            // instead of device_or_resource_busy.
            match actor.recv().await {
                Err(e) if e.is(CoreError::NoSenders) => {
                    report(&reports, "receiver slot was cleared");
                }
                Err(e) if e.is_generic(GenericError::DeviceOrResourceBusy) => {
                    panic!("stale receiver left in the inbox");
                }
                other => panic!("expected no_senders, got {:?}", other.map(|_| ())),
            }
            Ok(vec![])
        }
    });

    runtime.register("driver", move |actor: Actor| async move {
        let mut victim = actor.spawn_actor("victim")?;
        let hello = Table::new();
        hello.set("reply", Value::OwnInbox);
        victim.send(&actor, Value::Table(hello)).await?;

        let done = actor.recv().await?;
        assert_eq!(done.as_str(), Some("done"));
        victim.close();
        Ok(vec![])
    });

    let mut driver = runtime.spawn_actor("driver").unwrap();
    driver.close();
    runtime.run();
    assert_reported(
        &reports,
        &["join observed the interruption", "receiver slot was cleared"],
    );
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: interrupting a sender whose message is queued
////////////////////////////////////////////////////////////////////////////////

#[test]
fn interrupt_removes_a_queued_send() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();
    let parked: Arc<Mutex<Option<Completion>>> = Default::default();

    let slot = parked.clone();
    runtime.register("parked", move |actor: Actor| {
        let slot = slot.clone();
        async move {
            // Park the main fiber without receiving, so every incoming
            // message stays queued.
            let value = actor
                .wait_external(move |completion| {
                    *slot.lock().unwrap() = Some(completion);
                    Box::new(|| {})
                })
                .await?;
            assert_eq!(value.as_str(), Some("unpark"));
            Ok(vec![])
        }
    });

    let driver_reports = reports.clone();
    let driver_parked = parked.clone();
    runtime.register("driver", move |actor: Actor| {
        let reports = driver_reports.clone();
        let parked = driver_parked.clone();
        async move {
            let server = actor.spawn_actor("parked")?;

            // Wait until the peer is provably parked.
            loop {
                if parked.lock().unwrap().is_some() {
                    break;
                }
                actor.yield_now().await?;
            }

            let to_server = server.clone();
            let mut sender = actor.spawn(move |a| async move {
                match to_server.send(&a, Value::str("never delivered")).await {
                    Err(e) if e.is(CoreError::Interrupted) => Err(e),
                    other => panic!("expected interrupted, got {:?}", other),
                }
            });
            actor.yield_now().await?;

            sender.interrupt();
            match sender.join().await? {
                JoinOutcome::Interrupted => report(&reports, "sender interrupted"),
                other => panic!("unexpected join outcome: {:?}", other),
            }

            let completion = parked.lock().unwrap().take().unwrap();
            completion.complete(Ok(spindle::Payload::Str("unpark".into())));
            Ok(vec![])
        }
    });

    let mut driver = runtime.spawn_actor("driver").unwrap();
    driver.close();
    runtime.run();
    assert_reported(&reports, &["sender interrupted"]);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: forbid_suspend blocks suspension points
////////////////////////////////////////////////////////////////////////////////

#[test]
fn forbid_suspend_fails_yield_and_leaves_counter_intact() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let main_reports = reports.clone();
    runtime.register("main", move |actor: Actor| {
        let reports = main_reports.clone();
        async move {
            actor.forbid_suspend();
            match actor.yield_now().await {
                Err(e) if e.is(CoreError::ForbidSuspendBlock) => {}
                other => panic!("expected forbid_suspend_block, got {:?}", other),
            }
            // The failed suspension must not have touched the counter:
            // one allow_suspend balances, the second underflows.
            actor.allow_suspend()?;
            match actor.allow_suspend() {
                Err(e) if e.is(CoreError::SuspensionAlreadyAllowed) => {
                    report(&reports, "counter balanced");
                }
                other => panic!("expected suspension_already_allowed, got {:?}", other),
            }
            actor.yield_now().await?;
            Ok(vec![])
        }
    });

    let mut main = runtime.spawn_actor("main").unwrap();
    main.close();
    runtime.run();
    assert_reported(&reports, &["counter balanced"]);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: masked interruption is latched, observed on restore
////////////////////////////////////////////////////////////////////////////////

#[test]
fn disabled_interruption_latches_until_restored() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let main_reports = reports.clone();
    runtime.register("main", move |actor: Actor| {
        let reports = main_reports.clone();
        async move {
            let mut worker = actor.spawn(|a| async move {
                a.disable_interruption();
                a.yield_now().await.expect("masked yield must succeed");
                a.yield_now().await.expect("still masked");
                a.restore_interruption().expect("counter is positive");
                match a.yield_now().await {
                    Err(e) if e.is(CoreError::Interrupted) => Err(e),
                    other => panic!("expected interrupted, got {:?}", other),
                }
            });
            actor.yield_now().await?;
            worker.interrupt();
            match worker.join().await? {
                JoinOutcome::Interrupted => report(&reports, "latch observed after restore"),
                other => panic!("unexpected join outcome: {:?}", other),
            }
            Ok(vec![])
        }
    });

    let mut main = runtime.spawn_actor("main").unwrap();
    main.close();
    runtime.run();
    assert_reported(&reports, &["latch observed after restore"]);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: a second receiver is busy-rejected
////////////////////////////////////////////////////////////////////////////////

#[test]
fn concurrent_receives_are_rejected() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let main_reports = reports.clone();
    runtime.register("main", move |actor: Actor| {
        let reports = main_reports.clone();
        async move {
            let mut blocked = actor.spawn(|a| async move {
                let _ = a.recv().await;
                Ok(vec![])
            });
            actor.yield_now().await?;

            match actor.recv().await {
                Err(e) if e.is_generic(GenericError::DeviceOrResourceBusy) => {
                    report(&reports, "second receiver rejected");
                }
                other => panic!("expected busy, got {:?}", other.map(|_| ())),
            }
            blocked.interrupt();
            blocked.join().await?;
            // The test harness keeps our address alive for the whole
            // run; ask for an orderly stop instead of draining it.
            actor.exit(0, ExitMode::Graceful);
            Ok(vec![])
        }
    });

    // The address is held (not closed) so the blocked receive really
    // parks; it drops after run() returns.
    let _main = runtime.spawn_actor("main").unwrap();
    assert_eq!(runtime.run(), 0);
    assert_reported(&reports, &["second receiver rejected"]);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: closing the inbox wakes receiver and queued senders
////////////////////////////////////////////////////////////////////////////////

#[test]
fn inbox_close_wakes_everyone_with_channel_closed() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();
    let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let closer_reports = reports.clone();
    let closer_flag = closed.clone();
    runtime.register("closer", move |actor: Actor| {
        let reports = closer_reports.clone();
        let flag = closer_flag.clone();
        async move {
            let mut blocked = actor.spawn(|a| async move {
                match a.recv().await {
                    Err(e) if e.is(CoreError::ChannelClosed) => Ok(vec![]),
                    other => panic!("expected channel_closed, got {:?}", other.map(|_| ())),
                }
            });
            actor.yield_now().await?;
            actor.close_inbox();
            flag.store(true, Ordering::SeqCst);
            match blocked.join().await? {
                JoinOutcome::Completed(_) => report(&reports, "receiver woke with channel_closed"),
                other => panic!("unexpected join outcome: {:?}", other),
            }
            Ok(vec![])
        }
    });

    let sender_reports = reports.clone();
    let sender_flag = closed.clone();
    runtime.register("driver", move |actor: Actor| {
        let reports = sender_reports.clone();
        let flag = sender_flag.clone();
        async move {
            let closer = actor.spawn_actor("closer")?;
            // Only send once the inbox is provably closed, so the
            // message cannot be consumed by the doomed receiver.
            while !flag.load(Ordering::SeqCst) {
                actor.yield_now().await?;
            }
            match closer.send(&actor, Value::str("too late")).await {
                Err(e) if e.is(CoreError::ChannelClosed) => {
                    report(&reports, "sender woke with channel_closed");
                }
                other => panic!("expected channel_closed, got {:?}", other),
            }
            Ok(vec![])
        }
    });

    let mut driver = runtime.spawn_actor("driver").unwrap();
    driver.close();
    runtime.run();
    assert_reported(
        &reports,
        &[
            "receiver woke with channel_closed",
            "sender woke with channel_closed",
        ],
    );
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: process-level exit drains pending operations
////////////////////////////////////////////////////////////////////////////////

#[test]
fn master_exit_cancels_pending_operations_once() {
    let runtime = Runtime::new();
    let cancelled = Arc::new(AtomicUsize::new(0));

    let counter = cancelled.clone();
    runtime.register("master", move |actor: Actor| {
        let counter = counter.clone();
        async move {
            let waiter_counter = counter.clone();
            let waiter = actor.spawn(move |a| {
                let counter = waiter_counter.clone();
                async move {
                    // Blocks forever; only the shutdown drain can end it.
                    let _ = a
                        .wait_external(move |completion| {
                            // Never completed.
                            let _parked = completion;
                            Box::new(move || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            })
                        })
                        .await;
                    Ok(vec![])
                }
            });
            waiter.detach().expect("fresh handle is detachable");
            actor.yield_now().await?;

            actor.exit(7, ExitMode::Graceful);
            Ok(vec![])
        }
    });

    let mut master = runtime.spawn_actor("master").unwrap();
    master.close();
    assert_eq!(runtime.run(), 7);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: detached fiber errors do not take the instance down
////////////////////////////////////////////////////////////////////////////////

#[test]
fn detached_fiber_error_spares_the_instance() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let main_reports = reports.clone();
    runtime.register("main", move |actor: Actor| {
        let reports = main_reports.clone();
        async move {
            let doomed = actor.spawn(|_| async {
                Err(spindle::ErrorObject::new(99, "test-category"))
            });
            doomed.detach().unwrap();
            actor.yield_now().await?;
            actor.yield_now().await?;
            report(&reports, "main survived");
            Ok(vec![])
        }
    });

    let mut main = runtime.spawn_actor("main").unwrap();
    main.close();
    assert_eq!(runtime.run(), 0);
    assert_reported(&reports, &["main survived"]);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: self-spawn via "."
////////////////////////////////////////////////////////////////////////////////

#[test]
fn spawning_dot_clones_the_current_module() {
    let runtime = Runtime::new();
    let instances = Arc::new(AtomicUsize::new(0));

    let counter = instances.clone();
    runtime.register("replicator", move |actor: Actor| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let msg = actor.recv().await?;
            let depth = msg.as_number().unwrap();
            if depth > 0.0 {
                let mut child = actor.spawn_actor(".")?;
                child.send(&actor, Value::Number(depth - 1.0)).await?;
                child.close();
            }
            Ok(vec![])
        }
    });

    runtime.register("driver", move |actor: Actor| async move {
        let mut root = actor.spawn_actor("replicator")?;
        root.send(&actor, Value::Number(2.0)).await?;
        root.close();
        Ok(vec![])
    });

    let mut driver = runtime.spawn_actor("driver").unwrap();
    driver.close();
    runtime.run();
    assert_eq!(instances.load(Ordering::SeqCst), 3);
}

#[test]
fn unknown_modules_are_rejected() {
    let runtime = Runtime::new();
    match runtime.spawn_actor("no-such-module") {
        Err(spindle::Error::Object(e)) if e.is(CoreError::ModuleNotFound) => {}
        other => panic!("expected module_not_found, got {:?}", other.map(|_| ())),
    }
    match runtime.spawn_actor("") {
        Err(spindle::Error::Object(e)) if e.is(CoreError::InvalidModuleName) => {}
        other => panic!("expected invalid_module_name, got {:?}", other.map(|_| ())),
    }
    runtime.run();
}

////////////////////////////////////////////////////////////////////////////////
// Serializer laws, exercised through real sends
////////////////////////////////////////////////////////////////////////////////

#[test]
fn transfer_round_trips_structure() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let sink_reports = reports.clone();
    runtime.register("sink", move |actor: Actor| {
        let reports = sink_reports.clone();
        async move {
            let value = actor.recv().await?;
            let table = value.as_table().unwrap();
            assert_eq!(table.get("name").unwrap().as_str(), Some("job"));
            assert_eq!(table.get("ratio").unwrap().as_number(), Some(0.5));
            assert!(matches!(table.get("live"), Some(Value::Bool(true))));
            // Non-string keys and callables disappeared in transit.
            assert!(table.get(7).is_none());
            assert!(table.get("callback").is_none());

            let steps = table.get("steps").unwrap();
            let steps = steps.as_table().unwrap();
            assert!(steps.is_array());
            assert_eq!(steps.len(), 2);
            // A shared table arrives as two independent copies: the
            // transfer is a deep copy, not a reference graph.
            let a = steps.item(0).unwrap();
            let b = steps.item(1).unwrap();
            assert_ne!(a.as_table().unwrap(), b.as_table().unwrap());
            assert_eq!(
                a.as_table().unwrap().get("p").unwrap().as_number(),
                Some(1.0),
            );
            report(&reports, "structure arrived intact");
            Ok(vec![])
        }
    });

    runtime.register("driver", move |actor: Actor| async move {
        let mut sink = actor.spawn_actor("sink")?;

        let shared = Table::new();
        shared.set("p", 1.0);
        let steps = Table::new();
        steps.push(Value::Table(shared.clone()));
        steps.push(Value::Table(shared));

        let msg = Table::new();
        msg.set("name", "job");
        msg.set("ratio", 0.5);
        msg.set("live", true);
        msg.set("steps", Value::Table(steps));
        msg.set(7, "skipped");
        msg.set("callback", Value::Callable);

        sink.send(&actor, Value::Table(msg)).await?;
        sink.close();
        Ok(vec![])
    });

    let mut driver = runtime.spawn_actor("driver").unwrap();
    driver.close();
    runtime.run();
    assert_reported(&reports, &["structure arrived intact"]);
}

#[test]
fn transfer_rejects_bad_roots_and_cycles() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    runtime.register("sink", |actor: Actor| async move {
        // Nothing valid is ever sent here; wait for the driver to
        // drop its address.
        match actor.recv().await {
            Err(e) if e.is(CoreError::NoSenders) => Ok(vec![]),
            other => panic!("expected no_senders, got {:?}", other.map(|_| ())),
        }
    });

    let driver_reports = reports.clone();
    runtime.register("driver", move |actor: Actor| {
        let reports = driver_reports.clone();
        async move {
            let mut sink = actor.spawn_actor("sink")?;

            match sink.send(&actor, Value::Callable).await {
                Err(e) if e.is_generic(GenericError::InvalidArgument) => {}
                other => panic!("expected invalid_argument, got {:?}", other),
            }

            let exotic = Table::new();
            exotic.set_opaque_meta();
            match sink.send(&actor, Value::Table(exotic)).await {
                Err(e) if e.is_generic(GenericError::NotSupported) => {}
                other => panic!("expected not_supported, got {:?}", other),
            }

            let cyclic = Table::new();
            let inner = Table::new();
            inner.set("back", Value::Table(cyclic.clone()));
            cyclic.set("inner", Value::Table(inner));
            match sink.send(&actor, Value::Table(cyclic)).await {
                Err(e) if e.is_codec(CodecError::CycleExists) => {}
                other => panic!("expected cycle_exists, got {:?}", other),
            }

            let mut deep = Table::new();
            for _ in 0..=spindle::MAX_LEVELS {
                let outer = Table::new();
                outer.set("next", Value::Table(deep));
                deep = outer;
            }
            match sink.send(&actor, Value::Table(deep)).await {
                Err(e) if e.is_codec(CodecError::TooManyLevels) => {}
                other => panic!("expected too_many_levels, got {:?}", other),
            }

            let long = Table::new();
            for _ in 0..spindle::MAX_ARRAY + 1 {
                long.push(Value::Bool(false));
            }
            match sink.send(&actor, Value::Table(long)).await {
                Err(e) if e.is_codec(CodecError::ArrayTooLong) => {}
                other => panic!("expected array_too_long, got {:?}", other),
            }

            report(&reports, "all bad values rejected");
            sink.close();
            Ok(vec![])
        }
    });

    let mut driver = runtime.spawn_actor("driver").unwrap();
    driver.close();
    runtime.run();
    assert_reported(&reports, &["all bad values rejected"]);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: fiber identity, locals and cleanup scopes
////////////////////////////////////////////////////////////////////////////////

#[test]
fn fiber_locals_and_identity() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let main_reports = reports.clone();
    runtime.register("main", move |actor: Actor| {
        let reports = main_reports.clone();
        async move {
            assert!(actor.is_main());
            let main_id = actor.fiber_id();
            actor.set_local("who", "main");

            let mut worker = actor.spawn(move |a| async move {
                assert!(!a.is_main());
                assert_ne!(a.fiber_id(), main_id);
                // Local storage is per fiber, not per instance.
                assert!(a.get_local("who").is_none());
                a.set_local("who", "worker");
                Ok(vec![a.get_local("who").unwrap()])
            });
            match worker.join().await? {
                JoinOutcome::Completed(values) => {
                    assert_eq!(values[0].as_str(), Some("worker"));
                }
                other => panic!("unexpected join outcome: {:?}", other),
            }
            assert_eq!(
                actor.get_local("who").as_ref().and_then(|v| v.as_str()),
                Some("main"),
            );
            report(&reports, "locals are per fiber");
            Ok(vec![])
        }
    });

    let mut main = runtime.spawn_actor("main").unwrap();
    main.close();
    runtime.run();
    assert_reported(&reports, &["locals are per fiber"]);
}

#[test]
fn cleanup_scopes_run_in_reverse_on_fiber_end() {
    let runtime = Runtime::new();
    let order: Arc<Mutex<Vec<&'static str>>> = Default::default();

    let log = order.clone();
    runtime.register("main", move |actor: Actor| {
        let log = log.clone();
        async move {
            let (a, b, c) = (log.clone(), log.clone(), log.clone());
            let mut worker = actor.spawn(move |actor| async move {
                actor.scope_cleanup_push(move |_| a.lock().unwrap().push("outer"));
                actor.scope_cleanup_push(move |_| b.lock().unwrap().push("inner"));
                actor.scope_cleanup_push(move |_| c.lock().unwrap().push("popped"));
                // An explicit pop executes right here ...
                actor.scope_cleanup_pop(true)?;
                // ... and popping past the bottom is a usage error.
                Ok(vec![])
            });
            worker.join().await?;
            match actor.scope_cleanup_pop(false) {
                Err(e) if e.is(CoreError::UnmatchedScopeCleanup) => {}
                other => panic!("expected unmatched_scope_cleanup, got {:?}", other),
            }
            Ok(vec![])
        }
    });

    let mut main = runtime.spawn_actor("main").unwrap();
    main.close();
    runtime.run();
    // The explicit pop first, then the remaining handlers LIFO when the
    // fiber finished.
    assert_eq!(&*order.lock().unwrap(), &["popped", "inner", "outer"]);
}

////////////////////////////////////////////////////////////////////////////////
// Scenario: external completion delivers a value
////////////////////////////////////////////////////////////////////////////////

#[test]
fn external_completion_resumes_with_the_result() {
    let runtime = Runtime::new();
    let reports: Reports = Default::default();

    let main_reports = reports.clone();
    runtime.register("main", move |actor: Actor| {
        let reports = main_reports.clone();
        async move {
            let value = actor
                .wait_external(|completion| {
                    let worker = std::thread::spawn(move || {
                        completion.complete(Ok(spindle::Payload::Number(14.0)));
                    });
                    let _ = worker;
                    Box::new(|| {})
                })
                .await?;
            assert_eq!(value.as_number(), Some(14.0));
            report(&reports, "external result delivered");
            Ok(vec![])
        }
    });

    let mut main = runtime.spawn_actor("main").unwrap();
    main.close();
    runtime.run();
    assert_reported(&reports, &["external result delivered"]);
}
