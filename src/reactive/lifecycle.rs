//! Observer bookkeeping and the lazy mount/unmount lifecycle.
//!
//! Both reactive primitives share one core: a value, a listener list and a
//! mount slot. The setup hook runs exactly once when the observer count goes
//! from zero to one; teardown runs once after the count returns to zero and
//! a grace delay elapses. The delay is served by a dedicated timer worker;
//! cancellation works by checking liveness when the timer fires, not by
//! clearing the timer itself, so a rapid unsubscribe-then-resubscribe never
//! thrashes the notifier subscription.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::trace;

use crate::error::PersistResult;

/// Grace window between the last observer leaving and teardown running.
pub const DEFAULT_UNMOUNT_GRACE: Duration = Duration::from_secs(1);

/// Teardown closure returned by a mount hook; runs once on deactivation.
pub type TeardownFn = Box<dyn FnOnce() + Send>;

pub(crate) type SetupFn = dyn Fn() -> PersistResult<Option<TeardownFn>> + Send + Sync;

/// Lock helper: a panicking listener must not wedge the store.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Shared<V, L: ?Sized> {
    pub(crate) grace: Duration,
    pub(crate) state: Mutex<Core<V, L>>,
}

pub(crate) struct Core<V, L: ?Sized> {
    pub(crate) value: V,
    pub(crate) listeners: Vec<(u64, Arc<L>)>,
    next_id: u64,
    mounted: bool,
    unmount_gen: u64,
    setup: Option<Arc<SetupFn>>,
    teardown: Option<TeardownFn>,
}

impl<V, L: ?Sized> Core<V, L> {
    pub(crate) fn new(value: V) -> Self {
        Self {
            value,
            listeners: Vec::new(),
            next_id: 1,
            mounted: false,
            unmount_gen: 0,
            setup: None,
            teardown: None,
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

pub(crate) fn set_mount_hook<V, L: ?Sized>(
    shared: &Shared<V, L>,
    hook: impl Fn() -> PersistResult<Option<TeardownFn>> + Send + Sync + 'static,
) {
    lock(&shared.state).setup = Some(Arc::new(hook));
}

/// Add a listener, running the mount hook on the zero-to-one transition.
///
/// The hook runs outside the state lock so it may freely mutate the store
/// (hydration does exactly that). If it fails, the listener is rolled back
/// and the store stays unmounted.
pub(crate) fn add_listener<V, L>(
    shared: &Arc<Shared<V, L>>,
    cb: Arc<L>,
) -> PersistResult<Subscription>
where
    V: Send + 'static,
    L: ?Sized + Send + Sync + 'static,
{
    let id;
    let setup;
    {
        let mut core = lock(&shared.state);
        id = core.next_id;
        core.next_id += 1;
        core.listeners.push((id, cb));
        setup = if core.listeners.len() == 1 && !core.mounted {
            core.mounted = true;
            core.setup.clone()
        } else {
            None
        };
    }

    if let Some(setup) = setup {
        match setup() {
            Ok(teardown) => {
                lock(&shared.state).teardown = teardown;
            }
            Err(e) => {
                let mut core = lock(&shared.state);
                core.listeners.retain(|(lid, _)| *lid != id);
                core.mounted = false;
                core.teardown = None;
                return Err(e);
            }
        }
    }

    let weak = Arc::downgrade(shared);
    Ok(Subscription {
        cancel: Some(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                remove_listener(&shared, id);
            }
        })),
    })
}

fn remove_listener<V, L>(shared: &Arc<Shared<V, L>>, id: u64)
where
    V: Send + 'static,
    L: ?Sized + Send + Sync + 'static,
{
    let generation = {
        let mut core = lock(&shared.state);
        core.listeners.retain(|(lid, _)| *lid != id);
        if core.listeners.is_empty() && core.mounted {
            core.unmount_gen += 1;
            Some(core.unmount_gen)
        } else {
            None
        }
    };

    let Some(generation) = generation else { return };

    let weak: Weak<Shared<V, L>> = Arc::downgrade(shared);
    GraceTimer::shared().schedule(
        shared.grace,
        Box::new(move || {
            let Some(shared) = weak.upgrade() else { return };
            let teardown = {
                let mut core = lock(&shared.state);
                // Liveness check: a resubscribe, or a later unsubscribe with
                // its own timer, supersedes this one.
                if core.mounted && core.listeners.is_empty() && core.unmount_gen == generation {
                    core.mounted = false;
                    core.teardown.take()
                } else {
                    None
                }
            };
            if let Some(teardown) = teardown {
                trace!("grace elapsed, tearing down");
                teardown();
            }
        }),
    );
}

/// Handle for one active listener registration on a reactive store.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) removes the
/// listener; when the last one goes, the store schedules deactivation after
/// the grace delay.
#[must_use = "dropping a Subscription immediately removes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

type TimerTask = Box<dyn FnOnce() + Send>;

struct Scheduled {
    fire_at: Instant,
    task: TimerTask,
}

/// Process-wide timer worker serving deactivation grace delays.
struct GraceTimer {
    tx: Sender<Scheduled>,
}

impl GraceTimer {
    fn shared() -> &'static GraceTimer {
        static TIMER: OnceLock<GraceTimer> = OnceLock::new();
        TIMER.get_or_init(GraceTimer::start)
    }

    fn start() -> Self {
        let (tx, rx) = unbounded::<Scheduled>();
        thread::Builder::new()
            .name("persistore-unmount".to_string())
            .spawn(move || timer_loop(&rx))
            .expect("failed to spawn persistore unmount timer");
        Self { tx }
    }

    fn schedule(&self, delay: Duration, task: TimerTask) {
        let _ = self.tx.send(Scheduled {
            fire_at: Instant::now() + delay,
            task,
        });
    }
}

fn drain_due(pending: &mut Vec<Scheduled>) -> Vec<TimerTask> {
    let now = Instant::now();
    let mut ready = Vec::new();
    let mut i = 0;
    while i < pending.len() {
        if pending[i].fire_at <= now {
            ready.push(pending.swap_remove(i).task);
        } else {
            i += 1;
        }
    }
    ready
}

fn timer_loop(rx: &Receiver<Scheduled>) {
    let mut pending: Vec<Scheduled> = Vec::new();
    loop {
        for task in drain_due(&mut pending) {
            task();
        }

        let next = pending
            .iter()
            .map(|s| s.fire_at)
            .min()
            .map(|t| t.saturating_duration_since(Instant::now()));
        match next {
            None => match rx.recv() {
                Ok(scheduled) => pending.push(scheduled),
                Err(_) => break,
            },
            Some(wait) => match rx.recv_timeout(wait) {
                Ok(scheduled) => pending.push(scheduled),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Serve what is already queued, then exit.
                    while !pending.is_empty() {
                        for task in drain_due(&mut pending) {
                            task();
                        }
                        if let Some(t) = pending.iter().map(|s| s.fire_at).min() {
                            thread::sleep(t.saturating_duration_since(Instant::now()));
                        }
                    }
                    break;
                }
            },
        }
    }
}
