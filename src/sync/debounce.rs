//! Per-path debounce bookkeeping for the local watcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Entries beyond this count trigger eviction of idle paths.
const PRUNE_THRESHOLD: usize = 4096;

#[derive(Debug, Default)]
pub struct DebounceState {
    busy: bool,
    last_fired: Option<Instant>,
}

impl DebounceState {
    /// Accept an event at `now` unless the path is busy or fired less than
    /// `min_interval` ago. An accepted event marks the path busy.
    pub fn try_acquire(&mut self, now: Instant, min_interval: Duration) -> bool {
        if self.busy || self.in_window(now, min_interval) {
            return false;
        }
        self.busy = true;
        self.last_fired = Some(now);
        true
    }

    pub fn release(&mut self) {
        self.busy = false;
    }

    /// Idle entries behave exactly like fresh ones, so they can be dropped.
    fn is_idle(&self, now: Instant, min_interval: Duration) -> bool {
        !self.busy && !self.in_window(now, min_interval)
    }

    fn in_window(&self, now: Instant, min_interval: Duration) -> bool {
        self.last_fired
            .is_some_and(|t| now.saturating_duration_since(t) < min_interval)
    }
}

/// Debounce states keyed by path.
#[derive(Debug)]
pub struct Debouncer {
    min_interval: Duration,
    states: Mutex<HashMap<PathBuf, Arc<Mutex<DebounceState>>>>,
}

/// Held while an accepted event is being handled; releases the path on drop.
#[derive(Debug)]
pub struct Permit {
    state: Arc<Mutex<DebounceState>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Ok(mut s) = self.state.lock() {
            s.release();
        }
    }
}

impl Debouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, path: &Path) -> Option<Permit> {
        self.try_acquire_at(path, Instant::now())
    }

    fn try_acquire_at(&self, path: &Path, now: Instant) -> Option<Permit> {
        let state = {
            let mut states = self.states.lock().ok()?;
            if states.len() >= PRUNE_THRESHOLD {
                self.prune(&mut states, now);
            }
            states.entry(path.to_path_buf()).or_default().clone()
        };

        let accepted = state.lock().ok()?.try_acquire(now, self.min_interval);
        accepted.then_some(Permit { state })
    }

    fn prune(&self, states: &mut HashMap<PathBuf, Arc<Mutex<DebounceState>>>, now: Instant) {
        let before = states.len();
        states.retain(|_, s| {
            s.lock()
                .map(|s| !s.is_idle(now, self.min_interval))
                .unwrap_or(false)
        });
        tracing::trace!(before, after = states.len(), "pruned debounce states");
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.states.lock().map(|s| s.len()).unwrap_or(0)
    }
}
