//! The application context: program registry, instance lifecycle and
//! process-level exit code.
//!
//! A [`Runtime`] owns the mapping from module names to main-fiber
//! bodies and tracks every spawned instance. Each instance runs on its
//! own thread, whose loop is the instance's strand; the runtime's
//! [`run`](Runtime::run) joins them all and reports the exit code the
//! master instance requested. The first instance spawned is the master.
//!
//! Process-wide state (the logger, the level table) is initialised
//! lazily before any actor starts and torn down never: actors first,
//! context last.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::error::{CoreError, ErrorObject, GenericError, Result, StdResult};
use crate::fiber::FiberResult;
use crate::inbox::Address;
use crate::strand::Strand;
use crate::vm::{self, Actor, Core};

pub(crate) type Program =
    Arc<dyn Fn(Actor) -> LocalBoxFuture<'static, FiberResult> + Send + Sync>;

pub(crate) struct AppInner {
    programs: Mutex<HashMap<String, Program>>,
    instances: Mutex<Vec<Weak<Core>>>,
    /// The first instance ever spawned; never re-elected.
    master: Mutex<Option<Weak<Core>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    exit_code: AtomicI32,
    color: AtomicBool,
}

impl AppInner {
    pub(crate) fn is_master(&self, core: &Arc<Core>) -> bool {
        self.master
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|master| Arc::ptr_eq(&master, core))
            .unwrap_or(false)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub(crate) fn color_output(&self) -> bool {
        self.color.load(Ordering::Relaxed)
    }

    /// Visits every live instance core.
    pub(crate) fn for_each_instance(&self, mut f: impl FnMut(Arc<Core>)) {
        let cores: Vec<Arc<Core>> = {
            let mut instances = self.instances.lock().unwrap();
            instances.retain(|weak| weak.strong_count() != 0);
            instances.iter().filter_map(Weak::upgrade).collect()
        };
        for core in cores {
            f(core);
        }
    }
}

/// Executes actor instances until they all finish.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<AppInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        crate::log::init();
        Self {
            inner: Arc::new(AppInner {
                programs: Mutex::new(HashMap::new()),
                instances: Mutex::new(Vec::new()),
                master: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
                exit_code: AtomicI32::new(0),
                color: AtomicBool::new(false),
            }),
        }
    }

    /// Enables ANSI color in fiber panic reports.
    pub fn set_color_output(&self, enabled: bool) {
        self.inner.color.store(enabled, Ordering::Relaxed);
    }

    /// Registers a module: a main-fiber body instantiated by every
    /// [`spawn_actor`](Self::spawn_actor) of `name`.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Actor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FiberResult> + 'static,
    {
        let program: Program = Arc::new(move |actor| f(actor).boxed_local());
        self.inner
            .programs
            .lock()
            .unwrap()
            .insert(name.into(), program);
    }

    /// Spawns an instance of the named module and returns the send
    /// capability for its inbox. The first instance becomes the master.
    pub fn spawn_actor(&self, module: &str) -> Result<Address> {
        spawn_instance(&self.inner, module).map_err(Into::into)
    }

    /// Waits for every instance to finish, including the ones spawned
    /// while waiting. Returns the exit code requested via the master
    /// instance (0 when nobody asked to exit).
    pub fn run(&self) -> i32 {
        loop {
            let handle = self.inner.threads.lock().unwrap().pop();
            match handle {
                Some(handle) => {
                    if handle.join().is_err() {
                        log::error!(target: "spindle", "an instance thread panicked");
                    }
                }
                None => break,
            }
        }
        self.inner.exit_code.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

/// Shared spawn path for [`Runtime::spawn_actor`] and
/// [`Actor::spawn_actor`].
pub(crate) fn spawn_instance(
    app: &Arc<AppInner>,
    module: &str,
) -> StdResult<Address, ErrorObject> {
    if module.is_empty() || module == "." {
        return Err(CoreError::InvalidModuleName.into());
    }
    let program = app
        .programs
        .lock()
        .unwrap()
        .get(module)
        .cloned()
        .ok_or_else(|| ErrorObject::from(CoreError::ModuleNotFound))?;

    let core = Arc::new(Core {
        strand: Strand::new(),
        nsenders: std::sync::atomic::AtomicUsize::new(0),
        name: module.into(),
    });
    let address = Address::new(&core);

    {
        let mut master = app.master.lock().unwrap();
        if master.is_none() {
            *master = Some(Arc::downgrade(&core));
        }
    }
    app.instances.lock().unwrap().push(Arc::downgrade(&core));

    let thread_core = core.clone();
    let thread_app = app.clone();
    let handle = thread::Builder::new()
        .name(format!("actor:{}", module))
        .spawn(move || vm::boot_and_run(thread_core, thread_app, program))
        .map_err(|e| match e.raw_os_error() {
            Some(errno) => ErrorObject::new(errno as u32, crate::error::GENERIC_CATEGORY),
            None => ErrorObject::from(GenericError::NotEnoughMemory),
        })?;
    app.threads.lock().unwrap().push(handle);

    Ok(address)
}
