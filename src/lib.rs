//! Cooperative fiber and actor execution core.
//!
//! A [`Runtime`] hosts isolated actor instances. Each instance runs on
//! a single thread whose job queue (its *strand*) serialises every
//! callback, owns one inbox, and schedules any number of cooperative
//! fibers. Instances share nothing; they communicate by sending deep
//! copies of [`Value`] graphs through [`Address`] capabilities.
//!
//! ```no_run
//! use spindle::{Runtime, Value};
//!
//! let runtime = Runtime::new();
//! runtime.register("greeter", |actor: spindle::Actor| async move {
//!     let message = actor.recv().await?;
//!     let name = message.as_str().unwrap_or("world").to_owned();
//!     println!("hello, {}", name);
//!     Ok(vec![])
//! });
//! let greeter = runtime.spawn_actor("greeter").unwrap();
//!
//! runtime.register("main", move |actor: spindle::Actor| {
//!     let greeter = greeter.clone();
//!     async move {
//!         greeter.send(&actor, Value::str("fibers")).await?;
//!         Ok(vec![])
//!     }
//! });
//! // (register "main" before spawning it in real code)
//! runtime.run();
//! ```
//!
//! The crate provides:
//!
//! - [Fibers](fiber): spawn/join/detach, interruption with one-shot
//!   interrupters, interruption-disable and forbid-suspend counters,
//!   fiber-local storage.
//! - [Inboxes and addresses](inbox): unbuffered rendezvous delivery,
//!   FIFO-safe cancellation, `no_senders` wake-up when the last address
//!   drops.
//! - [Cross-instance value transfer](value): cycle- and depth-checked
//!   deep copies, with address capabilities moving between instances.
//! - [External-operation glue](completion): completion handles wired
//!   into cancellation and shutdown.
//! - [Container wire format](container): NaN-boxed frames with
//!   descriptor passing for instances living behind a process boundary.
//! - [Logging](mod@log) and a structured [error taxonomy](error).

pub mod completion;
pub mod container;
pub mod error;
pub mod fiber;
pub mod inbox;
pub mod log;
pub mod pending;
pub mod system;
pub mod value;

mod runtime;
mod strand;
mod transfer;
mod vm;

pub use error::{
    CodecError, CoreError, Error, ErrorObject, Field, GenericError, Result,
};
pub use fiber::{FiberHandle, FiberId, FiberResult, JoinOutcome};
pub use inbox::Address;
pub use runtime::Runtime;
pub use system::ExitMode;
pub use transfer::{MAX_ARRAY, MAX_LEVELS};
pub use value::{Key, Payload, Table, Value};
pub use vm::Actor;
