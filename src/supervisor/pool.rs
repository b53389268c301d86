//! The supervisor loop.
//!
//! Single owner of the pool and its configuration. Runs a periodic
//! reconciliation tick; external commands arrive as queued messages and are
//! consumed between ticks, so nothing else ever mutates the pool.
//!
//! Each tick:
//! 1. consume worker events (ready, heartbeat, exit),
//! 2. force-kill hung workers (no heartbeat within the request timeout),
//! 3. escalate drains whose grace period expired,
//! 4. reap dead slots,
//! 5. reconcile actual vs desired worker count: launch at most one worker
//!    per tick (staggered), drain at most one at a time during rolling
//!    replace or scale-down, keeping at least one serving worker whenever
//!    the target is non-zero.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::control::Command;
use super::launcher::{WorkerEvent, WorkerLauncher};
use super::slot::{SlotState, WorkerSlot};
use crate::config::{Overrides, PoolConfig, resolve};
use crate::error::{PreforkdError, Result};

/// Time between reconciliation ticks when no command arrives.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Base delay for launch-failure backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Ceiling for launch-failure backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Launch attempts before the supervisor stops retrying and alerts.
const MAX_LAUNCH_ATTEMPTS: u32 = 6;

/// Supervisor lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Stopping { graceful: bool },
    Stopped,
}

/// Exponential backoff state for failed launches.
#[derive(Debug, Default)]
struct LaunchBackoff {
    attempts: u32,
    next_attempt_at: Option<Instant>,
    gave_up: bool,
}

impl LaunchBackoff {
    fn ready(&self, now: Instant) -> bool {
        !self.gave_up && self.next_attempt_at.is_none_or(|at| now >= at)
    }

    fn record_failure(&mut self, now: Instant) {
        self.attempts += 1;
        if self.attempts >= MAX_LAUNCH_ATTEMPTS {
            self.gave_up = true;
            return;
        }
        let delay = BACKOFF_BASE
            .saturating_mul(1 << (self.attempts - 1).min(16))
            .min(BACKOFF_CAP);
        self.next_attempt_at = Some(now + delay);
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Read-only view of one slot, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub id: u32,
    pub pid: Option<i32>,
    pub state: SlotState,
    pub generation: u64,
    pub uptime_secs: u64,
    pub secs_since_heartbeat: u64,
}

/// Read-only view of the pool, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub environment: String,
    pub target_workers: usize,
    pub generation: u64,
    pub slots: Vec<SlotSnapshot>,
}

/// The pool supervisor.
///
/// Generic over the launcher so the reconciliation logic is testable with a
/// fake; production uses [`super::launcher::ProcessLauncher`].
pub struct Supervisor<L: WorkerLauncher> {
    launcher: L,
    config: PoolConfig,
    /// Inputs for re-resolving the config on reload.
    environment: String,
    overrides: Overrides,
    /// Slot id -> slot; BTreeMap keeps creation order for drain selection.
    slots: BTreeMap<u32, WorkerSlot<L::Handle>>,
    next_slot_id: u32,
    /// Current pool generation; bumped on rolling replace.
    generation: u64,
    /// Max live slots allowed while an old generation drains out.
    reload_ceiling: usize,
    commands: Receiver<Command>,
    backoff: LaunchBackoff,
    tick_interval: Duration,
    phase: Phase,
    /// Whether any worker ever became ready; launch give-up is only fatal
    /// before that point.
    ever_served: bool,
    force_kills: u64,
}

impl<L: WorkerLauncher> Supervisor<L> {
    /// Create a supervisor. Workers are launched by the reconciliation
    /// ticks inside [`Supervisor::run`], not here.
    pub fn new(
        launcher: L,
        config: PoolConfig,
        environment: String,
        overrides: Overrides,
        commands: Receiver<Command>,
    ) -> Self {
        let reload_ceiling = config.worker_count;
        Self {
            launcher,
            config,
            environment,
            overrides,
            slots: BTreeMap::new(),
            next_slot_id: 0,
            generation: 0,
            reload_ceiling,
            commands,
            backoff: LaunchBackoff::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            phase: Phase::Running,
            ever_served: false,
            force_kills: 0,
        }
    }

    /// Number of slots currently in Ready or Busy state.
    pub fn serving_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state.is_serving())
            .count()
    }

    /// Total workers force-killed so far (hung or drain-expired).
    pub fn force_kill_count(&self) -> u64 {
        self.force_kills
    }

    /// Read-only pool snapshot for external monitoring.
    pub fn snapshot(&self, now: Instant) -> PoolSnapshot {
        PoolSnapshot {
            environment: self.config.environment.clone(),
            target_workers: self.config.worker_count,
            generation: self.generation,
            slots: self
                .slots
                .values()
                .map(|s| SlotSnapshot {
                    id: s.id,
                    pid: self.launcher.pid(&s.handle),
                    state: s.state,
                    generation: s.generation,
                    uptime_secs: s.uptime_secs(now),
                    secs_since_heartbeat: now.duration_since(s.last_heartbeat_at).as_secs(),
                })
                .collect(),
        }
    }

    /// Run until shutdown completes.
    ///
    /// Suspends between ticks on the command channel, so control commands
    /// are handled promptly without busy-waiting.
    pub fn run(&mut self) -> Result<()> {
        tracing::info!(
            environment = %self.config.environment,
            workers = self.config.worker_count,
            timeout_secs = self.config.timeout_secs(),
            preload = self.config.preload_app,
            "Supervisor starting"
        );

        self.tick(Instant::now())?;

        loop {
            match self.commands.recv_timeout(self.tick_interval) {
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // No controllers left; keep supervising on the timer
                    std::thread::sleep(self.tick_interval);
                }
            }

            self.tick(Instant::now())?;

            if self.phase == Phase::Stopped {
                tracing::info!(force_kills = self.force_kills, "Supervisor stopped");
                return Ok(());
            }
        }
    }

    /// Apply one queued control command.
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reload => self.reload(),
            Command::Scale(n) => {
                tracing::info!(workers = n, "Scale command");
                self.config.worker_count = n;
                self.backoff.reset();
            }
            Command::Grow => {
                self.config.worker_count += 1;
                tracing::info!(workers = self.config.worker_count, "Grow command");
                self.backoff.reset();
            }
            Command::Shrink => {
                self.config.worker_count = self.config.worker_count.saturating_sub(1);
                tracing::info!(workers = self.config.worker_count, "Shrink command");
            }
            Command::Shutdown { graceful } => {
                tracing::info!(graceful, "Shutdown command");
                if let Ok(json) = serde_json::to_string(&self.snapshot(Instant::now())) {
                    tracing::info!(pool = %json, "Pool at shutdown");
                }
                self.phase = Phase::Stopping { graceful };
            }
            Command::DumpStatus => {
                let snapshot = self.snapshot(Instant::now());
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::info!(pool = %json, "Pool status"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize pool status"),
                }
            }
        }
    }

    /// Re-resolve configuration; on success adopt it, bumping the pool
    /// generation when workers must be replaced. A resolve failure rejects
    /// the reload and keeps the old config.
    fn reload(&mut self) {
        let new = match resolve(&self.environment, &self.overrides) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Reload rejected, keeping current configuration");
                return;
            }
        };

        if new == self.config {
            tracing::info!("Reload: configuration unchanged");
            return;
        }

        if new.bind_addr != self.config.bind_addr {
            tracing::warn!(
                old = %self.config.bind_addr,
                new = %new.bind_addr,
                "Bind address change ignored; the shared socket is fixed at startup"
            );
        }

        // Timeout and preload changes are baked into running workers, so
        // they require a rolling replace; a worker-count change alone is
        // absorbed by ordinary reconciliation.
        let needs_replace = new.preload_app != self.config.preload_app
            || new.request_timeout != self.config.request_timeout;

        tracing::info!(
            workers = new.worker_count,
            timeout_secs = new.timeout_secs(),
            preload = new.preload_app,
            rolling_replace = needs_replace,
            "Reload: configuration adopted"
        );

        let mut new = new;
        new.bind_addr = self.config.bind_addr;

        if needs_replace {
            if let Err(e) = self.launcher.reconfigure(&new) {
                tracing::error!(error = %e, "Reload rejected: launcher refused new configuration");
                return;
            }
        }

        let live = self.slots.len();
        self.config = new;
        self.backoff.reset();

        if needs_replace {
            self.generation += 1;
            self.reload_ceiling = live.max(self.config.worker_count);
        }
    }

    /// One reconciliation tick. `now` is injected for testability.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        self.consume_events(now);
        self.kill_hung(now);
        self.escalate_drains(now);
        self.reap();

        match self.phase {
            Phase::Running => self.reconcile(now)?,
            Phase::Stopping { graceful } => self.wind_down(graceful, now),
            Phase::Stopped => {}
        }

        Ok(())
    }

    /// Step 1: drain pending worker events.
    fn consume_events(&mut self, now: Instant) {
        for slot in self.slots.values_mut() {
            for event in self.launcher.poll(&mut slot.handle) {
                match event {
                    WorkerEvent::Ready => {
                        if slot.state == SlotState::Starting {
                            tracing::info!(worker_id = slot.id, "Worker ready");
                        }
                        slot.heartbeat(false, now);
                        self.ever_served = true;
                        self.backoff.reset();
                    }
                    WorkerEvent::Heartbeat { busy } => {
                        slot.heartbeat(busy, now);
                    }
                    WorkerEvent::Exited(cause) => {
                        let was_draining = slot.state == SlotState::Draining;
                        slot.mark_dead();
                        if was_draining {
                            tracing::debug!(worker_id = slot.id, cause = %cause, "Worker drained");
                        } else {
                            tracing::warn!(
                                worker_id = slot.id,
                                cause = %cause,
                                "Worker died unexpectedly"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Step 2: a worker that has not heartbeat within the request timeout
    /// is hung, whether or not it is merely slow. Force-kill and replace.
    fn kill_hung(&mut self, now: Instant) {
        let timeout = self.config.request_timeout;
        for slot in self.slots.values_mut() {
            if slot.is_hung(timeout, now) {
                tracing::warn!(
                    worker_id = slot.id,
                    timeout_secs = timeout.as_secs(),
                    "Worker heartbeat timeout, killing"
                );
                self.launcher.kill(&mut slot.handle);
                slot.mark_dead();
                self.force_kills += 1;
            }
        }
    }

    /// Step 3: force-kill draining workers whose grace period expired.
    fn escalate_drains(&mut self, now: Instant) {
        for slot in self.slots.values_mut() {
            if slot.drain_expired(now) {
                tracing::warn!(worker_id = slot.id, "Drain grace period expired, killing");
                self.launcher.kill(&mut slot.handle);
                slot.mark_dead();
                self.force_kills += 1;
            }
        }
    }

    /// Step 4: remove dead slots from the pool.
    fn reap(&mut self) {
        let dead: Vec<u32> = self
            .slots
            .iter()
            .filter(|(_, s)| !s.state.is_live())
            .map(|(&id, _)| id)
            .collect();
        for id in dead {
            self.slots.remove(&id);
            tracing::debug!(worker_id = id, "Slot reaped");
        }
    }

    /// Step 5: drive the pool toward the desired worker count.
    fn reconcile(&mut self, now: Instant) -> Result<()> {
        let desired = self.config.worker_count;
        let live = self.slots.len();
        let new_gen_live = self
            .slots
            .values()
            .filter(|s| s.generation == self.generation)
            .count();
        let old_gen_first = self
            .slots
            .values()
            .find(|s| s.generation < self.generation)
            .map(|s| s.id);

        if old_gen_first.is_none() {
            self.reload_ceiling = desired;
        }

        let serving = self.serving_count();
        let floor = if desired == 0 { 0 } else { 1 };

        // Launch at most one worker per tick to stagger starts. When every
        // old-generation worker sits at the availability floor it can never
        // drain first, so the replacement may overshoot the ceiling by one
        // slot; the old worker drains once its successor is Ready.
        let ceiling = self.reload_ceiling.max(desired);
        let limit = if old_gen_first.is_some() && serving <= floor {
            ceiling + 1
        } else {
            ceiling
        };
        if new_gen_live < desired && live < limit && self.backoff.ready(now) {
            self.launch_one(now)?;
        }

        // Drain at most one worker at a time, never dropping the pool below
        // one serving worker unless the operator asked for zero.
        let draining = self
            .slots
            .values()
            .any(|s| s.state == SlotState::Draining);

        if !draining && serving > floor {
            if let Some(id) = old_gen_first {
                self.drain_slot(id, now);
            } else if self.slots.len() > desired {
                // Scale down: retire the newest worker first
                if let Some(id) = self
                    .slots
                    .values()
                    .rev()
                    .find(|s| s.state.is_serving() || s.state == SlotState::Starting)
                    .map(|s| s.id)
                {
                    self.drain_slot(id, now);
                }
            }
        }

        Ok(())
    }

    /// Launch one worker, applying failure backoff.
    fn launch_one(&mut self, now: Instant) -> Result<()> {
        let id = self.next_slot_id;
        match self.launcher.launch(id, &self.config) {
            Ok(handle) => {
                self.next_slot_id += 1;
                self.slots
                    .insert(id, WorkerSlot::new(id, self.generation, handle, now));
                Ok(())
            }
            Err(e) => {
                self.backoff.record_failure(now);
                if self.backoff.gave_up {
                    tracing::error!(
                        error = %e,
                        attempts = self.backoff.attempts,
                        "Giving up on worker launches after repeated failures"
                    );
                    if !self.ever_served {
                        return Err(PreforkdError::Launch(format!(
                            "pool never became servable after {} launch attempts: {}",
                            self.backoff.attempts, e
                        )));
                    }
                } else {
                    tracing::warn!(
                        error = %e,
                        attempt = self.backoff.attempts,
                        "Worker launch failed, backing off"
                    );
                }
                Ok(())
            }
        }
    }

    /// Ask one slot to drain with the configured grace period.
    fn drain_slot(&mut self, id: u32, now: Instant) {
        let grace = self.config.request_timeout;
        if let Some(slot) = self.slots.get_mut(&id) {
            tracing::info!(worker_id = id, grace_secs = grace.as_secs(), "Draining worker");
            self.launcher.signal_quit(&mut slot.handle);
            slot.begin_drain(grace, now);
        }
    }

    /// Shutdown path: drain or kill every remaining slot.
    fn wind_down(&mut self, graceful: bool, now: Instant) {
        if !graceful {
            for slot in self.slots.values_mut() {
                if slot.state.is_live() {
                    self.launcher.kill(&mut slot.handle);
                    slot.mark_dead();
                }
            }
            self.reap();
        } else {
            let grace = self.config.request_timeout;
            for slot in self.slots.values_mut() {
                if slot.state.is_live() && slot.state != SlotState::Draining {
                    self.launcher.signal_quit(&mut slot.handle);
                    slot.begin_drain(grace, now);
                }
            }
        }

        if self.slots.is_empty() {
            self.phase = Phase::Stopped;
        }
    }
}
