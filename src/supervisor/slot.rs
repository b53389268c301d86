//! Worker slot state tracking.
//!
//! A slot represents one supervised worker process. The state machine is
//! `Starting → Ready ⇄ Busy → Draining → Dead`, with a direct crash edge
//! from any live state to `Dead`. `Draining` is only entered voluntarily
//! (graceful shutdown or rolling replace), never on crash. `Dead` is
//! terminal; dead slots are reaped out of the pool.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Launched, waiting for the first heartbeat.
    Starting,
    /// Heartbeating and accepting work.
    Ready,
    /// Heartbeating and currently handling a request.
    Busy,
    /// Asked to stop; finishing in-flight work.
    Draining,
    /// Terminated; awaiting reap.
    Dead,
}

impl SlotState {
    /// Whether the slot counts toward serving capacity.
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    /// Whether the slot still has a live process.
    pub fn is_live(self) -> bool {
        self != Self::Dead
    }

    /// Whether a heartbeat deadline applies in this state.
    pub fn expects_heartbeat(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Busy)
    }

    /// Whether the state machine permits a transition.
    pub fn permits(self, to: SlotState) -> bool {
        use SlotState::*;
        match (self, to) {
            // Crash edge: any live state can die
            (Starting | Ready | Busy | Draining, Dead) => true,
            (Starting, Ready) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            // Draining is voluntary and can begin from any pre-drain state
            (Starting | Ready | Busy, Draining) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Dead => "dead",
        };
        write!(f, "{}", s)
    }
}

/// One supervised worker process.
///
/// `H` is the process handle type supplied by the launcher.
#[derive(Debug)]
pub struct WorkerSlot<H> {
    /// Stable, pool-unique identity.
    pub id: u32,
    /// Pool generation this worker belongs to. Bumped on rolling replace;
    /// workers of an older generation are drained out.
    pub generation: u64,
    /// Current lifecycle state.
    pub state: SlotState,
    /// When the process was launched.
    pub started_at: Instant,
    /// Last observed liveness signal (initialized to `started_at`, so the
    /// heartbeat deadline also covers workers that never become ready).
    pub last_heartbeat_at: Instant,
    /// Deadline for a voluntary drain before force-kill escalation.
    pub drain_deadline: Option<Instant>,
    /// Process handle.
    pub handle: H,
}

impl<H> WorkerSlot<H> {
    /// Create a slot for a freshly launched worker.
    pub fn new(id: u32, generation: u64, handle: H, now: Instant) -> Self {
        Self {
            id,
            generation,
            state: SlotState::Starting,
            started_at: now,
            last_heartbeat_at: now,
            drain_deadline: None,
            handle,
        }
    }

    /// Record a liveness signal.
    ///
    /// The first heartbeat moves the slot out of `Starting`; later ones
    /// toggle Ready/Busy. Heartbeats from a draining slot only refresh the
    /// timestamp.
    pub fn heartbeat(&mut self, busy: bool, now: Instant) {
        self.last_heartbeat_at = now;
        let target = if busy { SlotState::Busy } else { SlotState::Ready };
        if self.state.permits(target) {
            self.state = target;
        }
    }

    /// Enter the draining state with a bounded grace period.
    pub fn begin_drain(&mut self, grace: Duration, now: Instant) {
        debug_assert!(self.state.permits(SlotState::Draining));
        self.state = SlotState::Draining;
        self.drain_deadline = Some(now + grace);
    }

    /// Mark the slot dead. Valid from every live state.
    pub fn mark_dead(&mut self) {
        self.state = SlotState::Dead;
        self.drain_deadline = None;
    }

    /// Whether the heartbeat deadline has been exceeded.
    pub fn is_hung(&self, timeout: Duration, now: Instant) -> bool {
        self.state.expects_heartbeat()
            && now.duration_since(self.last_heartbeat_at) > timeout
    }

    /// Whether a drain grace period has expired.
    pub fn drain_expired(&self, now: Instant) -> bool {
        self.state == SlotState::Draining
            && self.drain_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Seconds since the process was launched.
    pub fn uptime_secs(&self, now: Instant) -> u64 {
        now.duration_since(self.started_at).as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(now: Instant) -> WorkerSlot<()> {
        WorkerSlot::new(0, 0, (), now)
    }

    #[test]
    fn test_permitted_transitions() {
        use SlotState::*;
        assert!(Starting.permits(Ready));
        assert!(Ready.permits(Busy));
        assert!(Busy.permits(Ready));
        assert!(Ready.permits(Draining));
        assert!(Busy.permits(Draining));
        assert!(Starting.permits(Draining));
        assert!(Draining.permits(Dead));
        // Crash edge from every live state
        for state in [Starting, Ready, Busy, Draining] {
            assert!(state.permits(Dead));
        }
    }

    #[test]
    fn test_forbidden_transitions() {
        use SlotState::*;
        // Dead is terminal
        for state in [Starting, Ready, Busy, Draining] {
            assert!(!Dead.permits(state));
        }
        // Draining never goes back to serving
        assert!(!Draining.permits(Ready));
        assert!(!Draining.permits(Busy));
        // Workers can't skip initialization
        assert!(!Starting.permits(Busy));
    }

    #[test]
    fn test_first_heartbeat_makes_ready() {
        let now = Instant::now();
        let mut s = slot(now);
        assert_eq!(s.state, SlotState::Starting);
        s.heartbeat(false, now + Duration::from_secs(1));
        assert_eq!(s.state, SlotState::Ready);
        assert_eq!(s.last_heartbeat_at, now + Duration::from_secs(1));
    }

    #[test]
    fn test_busy_tracking() {
        let now = Instant::now();
        let mut s = slot(now);
        s.heartbeat(true, now);
        // Starting can't jump straight to Busy; the heartbeat still counts
        assert_eq!(s.state, SlotState::Starting);
        s.heartbeat(false, now);
        assert_eq!(s.state, SlotState::Ready);
        s.heartbeat(true, now);
        assert_eq!(s.state, SlotState::Busy);
        s.heartbeat(false, now);
        assert_eq!(s.state, SlotState::Ready);
    }

    #[test]
    fn test_draining_heartbeat_keeps_state() {
        let now = Instant::now();
        let mut s = slot(now);
        s.heartbeat(false, now);
        s.begin_drain(Duration::from_secs(30), now);
        s.heartbeat(false, now + Duration::from_secs(1));
        assert_eq!(s.state, SlotState::Draining);
        assert_eq!(s.last_heartbeat_at, now + Duration::from_secs(1));
    }

    #[test]
    fn test_hung_detection() {
        let now = Instant::now();
        let timeout = Duration::from_secs(30);
        let mut s = slot(now);
        s.heartbeat(false, now);

        assert!(!s.is_hung(timeout, now + Duration::from_secs(30)));
        assert!(s.is_hung(timeout, now + Duration::from_secs(31)));

        // A slot that never became ready is covered too
        let stuck = slot(now);
        assert!(stuck.is_hung(timeout, now + Duration::from_secs(31)));

        // Draining slots are governed by the drain deadline, not heartbeats
        s.begin_drain(timeout, now);
        assert!(!s.is_hung(timeout, now + Duration::from_secs(120)));
    }

    #[test]
    fn test_drain_deadline() {
        let now = Instant::now();
        let mut s = slot(now);
        s.heartbeat(false, now);
        assert!(!s.drain_expired(now));
        s.begin_drain(Duration::from_secs(10), now);
        assert!(!s.drain_expired(now + Duration::from_secs(9)));
        assert!(s.drain_expired(now + Duration::from_secs(10)));
        s.mark_dead();
        assert!(!s.drain_expired(now + Duration::from_secs(20)));
    }
}
