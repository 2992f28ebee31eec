use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// One running boost session. The generation token ties the expiry timer
/// to the session that armed it: a restart or stop invalidates any timer
/// still in flight.
#[derive(Debug)]
struct BoostSession {
    temp: f64,
    until: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Per-zone one-shot boost overrides with restart semantics.
#[derive(Debug, Default)]
pub(crate) struct BoostController {
    sessions: HashMap<String, BoostSession>,
    next_generation: u64,
}

impl BoostController {
    /// Records a new session, cancelling any previous expiry timer for the
    /// zone first. Returns the generation token to arm the new timer with.
    pub fn begin(&mut self, zone_id: &str, temp: f64, duration: Duration) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(previous) = self.sessions.remove(zone_id) {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
            debug!(zone = %zone_id, "boost restarted, previous expiry cancelled");
        }
        self.sessions.insert(
            zone_id.to_string(),
            BoostSession {
                temp,
                until: Instant::now() + duration,
                generation,
                timer: None,
            },
        );
        generation
    }

    pub fn arm(&mut self, zone_id: &str, timer: JoinHandle<()>) {
        match self.sessions.get_mut(zone_id) {
            Some(session) => session.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Expiry-timer callback. Deactivates the session only when the
    /// generation still matches; stale timers are ignored.
    pub fn expire(&mut self, zone_id: &str, generation: u64) -> bool {
        match self.sessions.get(zone_id) {
            Some(session) if session.generation == generation => {
                self.sessions.remove(zone_id);
                true
            }
            _ => false,
        }
    }

    /// Manual stop. Returns whether a session was actually running.
    pub fn cancel(&mut self, zone_id: &str) -> bool {
        match self.sessions.remove(zone_id) {
            Some(session) => {
                if let Some(timer) = session.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, zone_id: &str) -> bool {
        self.sessions.contains_key(zone_id)
    }

    pub fn active_temp(&self, zone_id: &str) -> Option<f64> {
        self.sessions.get(zone_id).map(|s| s.temp)
    }

    pub fn remaining(&self, zone_id: &str) -> Option<Duration> {
        self.sessions
            .get(zone_id)
            .map(|s| s.until.saturating_duration_since(Instant::now()))
    }

    pub fn clear(&mut self) {
        for (_, session) in self.sessions.drain() {
            if let Some(timer) = session.timer {
                timer.abort();
            }
        }
    }
}

#[derive(Debug, Default)]
struct WindowState {
    open: bool,
    delay_pending: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Per-zone window contacts with an open-side debounce: opening arms a
/// delay timer before the heating lockout takes effect, closing reacts
/// immediately.
#[derive(Debug, Default)]
pub(crate) struct WindowController {
    windows: HashMap<String, WindowState>,
    next_generation: u64,
}

impl WindowController {
    /// Marks the zone open and starts a new debounce round. Returns `None`
    /// when the zone was already open (no new timer wanted).
    pub fn open(&mut self, zone_id: &str) -> Option<u64> {
        if self.windows.get(zone_id).is_some_and(|s| s.open) {
            return None;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let state = self.windows.entry(zone_id.to_string()).or_default();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.open = true;
        state.delay_pending = true;
        state.generation = generation;
        Some(generation)
    }

    pub fn arm(&mut self, zone_id: &str, timer: JoinHandle<()>) {
        match self.windows.get_mut(zone_id) {
            Some(state) if state.delay_pending => state.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Delay-timer callback. Clears the pending marker only when the
    /// generation still matches and the window is still open.
    pub fn delay_elapsed(&mut self, zone_id: &str, generation: u64) -> bool {
        match self.windows.get_mut(zone_id) {
            Some(state) if state.open && state.generation == generation => {
                state.delay_pending = false;
                state.timer = None;
                true
            }
            _ => false,
        }
    }

    /// Closing always reacts instantly. Returns whether the zone was open.
    pub fn close(&mut self, zone_id: &str) -> bool {
        match self.windows.get_mut(zone_id) {
            Some(state) if state.open => {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                state.open = false;
                state.delay_pending = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_open(&self, zone_id: &str) -> bool {
        self.windows.get(zone_id).is_some_and(|s| s.open)
    }

    pub fn is_delay_active(&self, zone_id: &str) -> bool {
        self.windows.get(zone_id).is_some_and(|s| s.delay_pending)
    }

    /// Open and past the debounce delay, so the 0°C override applies.
    pub fn lockout_active(&self, zone_id: &str) -> bool {
        self.windows
            .get(zone_id)
            .is_some_and(|s| s.open && !s.delay_pending)
    }

    pub fn clear(&mut self) {
        for (_, state) in self.windows.drain() {
            if let Some(timer) = state.timer {
                timer.abort();
            }
        }
    }
}
