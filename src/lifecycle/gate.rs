//! Consumer-counting gate with delayed deactivation.

use crate::error::{CacheError, Result};
use crate::scheduler::{Scheduler, TimerHandle};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace};

type Hook = Box<dyn Fn() + Send + Sync>;

struct GateState {
    consumers: usize,
    active: bool,
    pending: Option<TimerHandle>,
    /// Bumped whenever a pending deactivation is scheduled or cancelled.
    generation: u64,
}

/// Defers deactivation of a resource until it has had no consumers for a
/// grace period.
///
/// Attaching while a deactivation is pending cancels it and calls neither
/// hook, so attach/detach churn inside the window costs nothing. A hook
/// runs while `transitions` is held, so hooks never overtake each other.
pub struct DelayedLifecycleGate {
    name: String,
    scheduler: Arc<dyn Scheduler>,
    default_delay: Duration,
    state: Mutex<GateState>,
    transitions: ReentrantMutex<()>,
    on_activate: Hook,
    on_deactivate: Hook,
    self_ref: Weak<Self>,
}

impl DelayedLifecycleGate {
    pub fn new(
        name: impl Into<String>,
        scheduler: Arc<dyn Scheduler>,
        default_delay: Duration,
        on_activate: impl Fn() + Send + Sync + 'static,
        on_deactivate: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak| Self {
            name,
            scheduler,
            default_delay,
            state: Mutex::new(GateState {
                consumers: 0,
                active: false,
                pending: None,
                generation: 0,
            }),
            transitions: ReentrantMutex::new(()),
            on_activate: Box::new(on_activate),
            on_deactivate: Box::new(on_deactivate),
            self_ref: weak.clone(),
        })
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    /// Register a consumer.
    pub fn attach(&self) {
        let _transition = self.transitions.lock();
        let activate = {
            let mut state = self.state.lock();
            state.consumers += 1;

            if let Some(pending) = state.pending.take() {
                pending.cancel();
                state.generation += 1;
                trace!(gate = %self.name, "Cancelled pending deactivation");
                false
            } else if !state.active {
                state.active = true;
                true
            } else {
                false
            }
        };

        if activate {
            debug!(gate = %self.name, "Activating");
            (self.on_activate)();
        }
    }

    /// Unregister a consumer.
    ///
    /// When the last consumer leaves, deactivation runs after `delay`
    /// (the gate's default when `None`), or immediately for a zero delay.
    pub fn detach(&self, delay: Option<Duration>) -> Result<()> {
        let delay = delay.unwrap_or(self.default_delay);

        let _transition = self.transitions.lock();
        let deactivate_now = {
            let mut state = self.state.lock();
            if state.consumers == 0 {
                error!(gate = %self.name, "Detach without a matching attach");
                return Err(CacheError::GateUnderflow(self.name.clone()));
            }
            state.consumers -= 1;
            if state.consumers > 0 || !state.active {
                return Ok(());
            }

            if delay.is_zero() {
                state.active = false;
                true
            } else {
                state.generation += 1;
                let generation = state.generation;
                let weak = self.self_ref.clone();
                let handle = self.scheduler.schedule(
                    delay,
                    Box::new(move || {
                        if let Some(gate) = weak.upgrade() {
                            gate.fire(generation);
                        }
                    }),
                );
                state.pending = Some(handle);
                trace!(gate = %self.name, delay_ms = delay.as_millis() as u64, "Scheduled deactivation");
                false
            }
        };

        if deactivate_now {
            debug!(gate = %self.name, "Deactivating");
            (self.on_deactivate)();
        }
        Ok(())
    }

    fn fire(&self, generation: u64) {
        let _transition = self.transitions.lock();
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.pending.is_none() || state.consumers > 0 {
                return;
            }
            state.pending = None;
            state.active = false;
        }

        debug!(gate = %self.name, "Deactivating after delay");
        (self.on_deactivate)();
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers
    }

    pub fn has_pending_deactivation(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}
