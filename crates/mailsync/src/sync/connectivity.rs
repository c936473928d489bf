//! Shared network condition
//!
//! The scheduler loop blocks on the gate while the network is down; network
//! status changes and explicit nudges wake it.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// What the host reports about a newly available network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub roaming: bool,
}

/// Why [`ConnectivityGate::wait_connected`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateWait {
    /// The network is available
    Connected,
    /// Woken without a state change
    Nudged,
    /// The wait ran its full length
    TimedOut,
}

#[derive(Debug)]
struct GateState {
    connected: bool,
    roaming: bool,
    /// Some thread is blocked waiting for the network
    holding: bool,
    /// Bumped by every signal and nudge so waiters notice
    generation: u64,
}

/// Network availability shared between the host and the scheduler
#[derive(Debug)]
pub struct ConnectivityGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl ConnectivityGate {
    /// Create a gate in the given initial state
    pub fn new(connected: bool) -> Self {
        Self {
            state: Mutex::new(GateState {
                connected,
                roaming: false,
                holding: false,
                generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_roaming(&self) -> bool {
        let state = self.state.lock();
        state.connected && state.roaming
    }

    /// Whether a thread is currently blocked waiting for the network
    pub fn is_holding(&self) -> bool {
        self.state.lock().holding
    }

    /// The network came up
    pub fn signal_connected(&self, info: NetworkInfo) {
        let mut state = self.state.lock();
        state.connected = true;
        state.roaming = info.roaming;
        state.generation += 1;
        self.changed.notify_all();
    }

    /// The network went away
    pub fn signal_disconnected(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.roaming = false;
        state.generation += 1;
        self.changed.notify_all();
    }

    /// Wake waiters without changing the state
    pub fn nudge(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        self.changed.notify_all();
    }

    /// Treat the network as available after waiting it out
    pub fn assume_connected(&self) {
        let mut state = self.state.lock();
        state.connected = true;
        state.generation += 1;
        self.changed.notify_all();
    }

    /// Block until connected, nudged, or `max` elapses
    pub fn wait_connected(&self, max: Duration) -> GateWait {
        let mut state = self.state.lock();
        if state.connected {
            return GateWait::Connected;
        }

        let generation = state.generation;
        state.holding = true;
        let timed_out = self
            .changed
            .wait_while_for(&mut state, |s| !s.connected && s.generation == generation, max)
            .timed_out();
        state.holding = false;

        if state.connected {
            GateWait::Connected
        } else if timed_out {
            GateWait::TimedOut
        } else {
            GateWait::Nudged
        }
    }
}

impl Default for ConnectivityGate {
    fn default() -> Self {
        Self::new(true)
    }
}
