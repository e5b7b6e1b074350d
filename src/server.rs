use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, RwLock,
};

use crate::{config::Config, hooks::Registry, internal};

/// Accept-batch floor, restored every [`BATCH_RESET_SECS`].
pub const NUM_ACCEPT_START: usize = 20;
/// Hard ceiling for the adaptive accept batch.
pub const NUM_ACCEPT_CAP: usize = 1000;
/// How often the accept batch decays back to its floor.
pub const BATCH_RESET_SECS: u64 = 30;

/// All mutable per-worker state: the pause gate, the adaptive accept
/// batch, counters, and the swappable plugin chain plus configuration.
/// One instance per worker process; nothing here crosses a fork.
pub struct ServerState {
    paused: AtomicBool,
    num_accept: AtomicUsize,
    accepted: AtomicU64,
    active: AtomicU64,
    rejected_black: AtomicU64,
    rejected_white: AtomicU64,
    config: RwLock<Arc<Config>>,
    registry: RwLock<Arc<Registry>>,
}

impl ServerState {
    #[must_use]
    pub fn new(config: Config, registry: Registry) -> Self {
        Self {
            paused: AtomicBool::new(false),
            num_accept: AtomicUsize::new(NUM_ACCEPT_START),
            accepted: AtomicU64::new(0),
            active: AtomicU64::new(0),
            rejected_black: AtomicU64::new(0),
            rejected_white: AtomicU64::new(0),
            config: RwLock::new(Arc::new(config)),
            registry: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn pause(&self) {
        internal!(level = INFO, "pausing");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        internal!(level = INFO, "resuming");
        self.paused.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Current accept batch size.
    #[must_use]
    pub fn batch(&self) -> usize {
        self.num_accept.load(Ordering::Relaxed)
    }

    /// A fully drained batch doubles the next one, up to the cap. An
    /// underfull batch leaves it alone; the periodic reset shrinks it.
    pub fn adapt_batch(&self, saturated: bool) {
        if saturated {
            let current = self.num_accept.load(Ordering::Relaxed);
            let next = (current * 2).min(NUM_ACCEPT_CAP);
            if next != current {
                internal!(level = DEBUG, "accept batch {current} -> {next}");
                self.num_accept.store(next, Ordering::Relaxed);
            }
        }
    }

    pub fn reset_batch(&self) {
        self.num_accept.store(NUM_ACCEPT_START, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Policy rejection counters: permanent 5xx land in rejected-black,
    /// temporary 4xx in rejected-white.
    pub fn record_rejection(&self, permanent: bool) {
        if permanent {
            self.rejected_black.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected_white.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn status_line(&self) -> String {
        format!(
            "accepted={} active={} rejected-black={} rejected-white={} paused={}",
            self.accepted.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.rejected_black.load(Ordering::Relaxed),
            self.rejected_white.load(Ordering::Relaxed),
            self.is_paused(),
        )
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .map(|config| Arc::clone(&config))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        self.registry
            .read()
            .map(|registry| Arc::clone(&registry))
            .unwrap_or_default()
    }

    /// Swap in a freshly built configuration and plugin chain. Sessions
    /// already running keep the chain they started with.
    pub fn install(&self, config: Config, registry: Registry) {
        if let Ok(mut slot) = self.config.write() {
            *slot = Arc::new(config);
        }
        if let Ok(mut slot) = self.registry.write() {
            *slot = Arc::new(registry);
        }
    }
}
