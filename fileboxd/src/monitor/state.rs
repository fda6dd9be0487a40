use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(text)
    }
}

/// Identifies one connection attempt. Reports from older attempts are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// Push channel state machine with its reconnect timer.
///
/// The timer is armed exactly while the state is not `Connected`, except
/// after an explicit [`LinkMachine::suspend`], which parks the link until the
/// next [`LinkMachine::connect`].
#[derive(Debug)]
pub struct LinkMachine {
    state: LinkState,
    generation: u64,
    interval: Duration,
    reconnect_at: Option<Instant>,
}

impl LinkMachine {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: LinkState::Disconnected,
            generation: 0,
            interval,
            reconnect_at: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        Generation(self.generation)
    }

    pub fn next_reconnect(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Starts an attempt. Returns `None` when already connecting or connected.
    pub fn connect(&mut self, now: Instant) -> Option<Generation> {
        if self.state != LinkState::Disconnected {
            return None;
        }
        self.state = LinkState::Connecting;
        self.generation += 1;
        self.reconnect_at = Some(now + self.interval);
        Some(Generation(self.generation))
    }

    /// Handshake finished for `generation`.
    pub fn opened(&mut self, generation: Generation) -> bool {
        if generation.0 != self.generation || self.state != LinkState::Connecting {
            return false;
        }
        self.state = LinkState::Connected;
        self.reconnect_at = None;
        true
    }

    /// The channel of `generation` failed or was closed by the remote end.
    pub fn lost(&mut self, generation: Generation, now: Instant) -> bool {
        if generation.0 != self.generation || self.state == LinkState::Disconnected {
            return false;
        }
        self.state = LinkState::Disconnected;
        self.reconnect_at = Some(now + self.interval);
        true
    }

    /// The reconnect timer fired: re-arms it and starts an attempt if idle.
    pub fn timer_fired(&mut self, now: Instant) -> Option<Generation> {
        if self.state == LinkState::Connected || self.reconnect_at.is_none() {
            return None;
        }
        self.reconnect_at = Some(now + self.interval);
        self.connect(now)
    }

    /// Drops the current channel so the next `connect` starts over.
    pub fn reset(&mut self, now: Instant) {
        self.state = LinkState::Disconnected;
        self.generation += 1;
        self.reconnect_at = Some(now + self.interval);
    }

    /// Drops the current channel and stops retrying.
    pub fn suspend(&mut self) {
        self.state = LinkState::Disconnected;
        self.generation += 1;
        self.reconnect_at = None;
    }
}
