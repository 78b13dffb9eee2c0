//! The peer registry: per-host liveness, boot-generation tracking, and
//! crash/reboot callback dispatch.

use crate::trace::{TraceCause, TraceRecord, TraceRing};
use crate::{
    Availability, Liveness, PingOutcome, Probe, RecovError, RecoveryCallback, Result, SyncMode,
    WaitOutcome, When,
};
use drift_proto::{BootGen, HostId, BROADCAST_HOST};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tunables read once at registry construction.
#[derive(Debug, Clone)]
pub struct RegistryTuning {
    /// This host's own ID; registry operations against it are rejected.
    pub local_host: HostId,
    pub ping_interval: Duration,
    pub reboot_settle: Duration,
    pub recent_traffic: Duration,
    pub trace_capacity: usize,
    /// When set, dead reports are ignored (the offending host is probably
    /// sitting in a debugger).
    pub no_timeouts: bool,
}

impl RegistryTuning {
    pub fn from_config(cfg: &drift_config::Config) -> Self {
        Self {
            local_host: cfg.node.host_id,
            ping_interval: cfg.recovery.ping_interval(),
            reboot_settle: cfg.recovery.reboot_settle(),
            recent_traffic: cfg.recovery.recent_traffic(),
            trace_capacity: cfg.recovery.trace_capacity,
            no_timeouts: cfg.node.no_timeouts,
        }
    }
}

/// Counters mirrored out by [`PeerRegistry::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecovStats {
    pub crashes: u64,
    pub reboots: u64,
    pub pings: u64,
    pub pings_suppressed: u64,
    pub hosts_pinged: u64,
}

struct PeerState {
    liveness: Liveness,
    boot_gen: BootGen,
    last_heard: Option<Instant>,
    client_state: u32,
    /// Crash callbacks scheduled but not yet complete. Blocks synchronous
    /// `note_alive` callers. At most one crash task per peer.
    crash_in_progress: bool,
    /// Reboot callbacks scheduled but not yet complete. At most one reboot
    /// task per peer.
    reboot_in_progress: bool,
    /// On the background pinger's active list.
    pinging: bool,
    /// A boot-generation change was seen and the settle pause still owes
    /// the reboot task its delay.
    pending_reboot_seen: bool,
}

impl PeerState {
    fn new() -> Self {
        Self {
            liveness: Liveness::Unknown,
            boot_gen: 0,
            last_heard: None,
            client_state: 0,
            crash_in_progress: false,
            reboot_in_progress: false,
            pinging: false,
            pending_reboot_seen: false,
        }
    }
}

struct CallbackEntry {
    callback: Arc<dyn RecoveryCallback>,
    when: When,
}

struct Inner {
    peers: HashMap<HostId, PeerState>,
    callbacks: Vec<CallbackEntry>,
    trace: TraceRing,
    stats: RecovStats,
}

/// Tracks the up/down state of every other host and dispatches recovery
/// callbacks on state transitions. One per process, shared behind `Arc`.
pub struct PeerRegistry {
    tuning: RegistryTuning,
    probe: Arc<dyn Probe>,
    inner: Mutex<Inner>,
    /// Notified whenever some peer transitions to alive.
    alive_notify: Notify,
    /// Notified whenever some peer's crash callback phase completes.
    recovery_notify: Notify,
    shutdown_notify: Notify,
    shutting_down: AtomicBool,
}

impl PeerRegistry {
    pub fn new(tuning: RegistryTuning, probe: Arc<dyn Probe>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                callbacks: Vec::new(),
                trace: TraceRing::new(tuning.trace_capacity),
                stats: RecovStats::default(),
            }),
            tuning,
            probe,
            alive_notify: Notify::new(),
            recovery_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn tuning(&self) -> &RegistryTuning {
        &self.tuning
    }

    pub(crate) fn probe(&self) -> &Arc<dyn Probe> {
        &self.probe
    }

    /// Begin shutdown: wakes every parked waiter and stops the background
    /// pinger and reboot retry loops.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Register a recovery action. Registrations are permanent and invoked
    /// in insertion order.
    pub fn register_callback(&self, callback: Arc<dyn RecoveryCallback>, when: When) {
        let mut inner = self.inner.lock().unwrap();
        inner.callbacks.push(CallbackEntry { callback, when });
    }

    // ========================================================================
    // Inbound transitions
    // ========================================================================

    /// Mark the host as alive; called on every message received from it.
    ///
    /// Compares boot generations to detect reboots. A reboot seen while
    /// the host was still thought alive means a crash went undetected: the
    /// crash callbacks run first, and a `Synchronous` caller blocks until
    /// they complete. Any transition out of dead schedules the reboot
    /// callbacks, delayed by the settle pause when a real reboot was
    /// observed so the peer can finish booting.
    pub async fn note_alive(
        self: &Arc<Self>,
        peer: HostId,
        boot_gen: BootGen,
        mode: SyncMode,
    ) {
        if peer == BROADCAST_HOST || boot_gen == 0 {
            // Zero generations come from hosts at early boot time or in
            // certain error conditions; the broadcast address is not a host.
            return;
        }

        let spawn_crash = {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            let state = inner.peers.entry(peer).or_insert_with(PeerState::new);
            let mut spawn_crash = false;

            if state.liveness == Liveness::Unknown && state.boot_gen == 0 {
                // First time we've talked to this host since we came up.
                state.liveness = Liveness::Alive;
                state.boot_gen = boot_gen;
                state.last_heard = Some(Instant::now());
                info!(component = "RECOV", peer, boot_gen, "peer is up");
                inner.trace.record(peer, Liveness::Alive, TraceCause::Init);
                self.alive_notify.notify_waiters();
                return;
            }

            state.last_heard = Some(Instant::now());
            if state.boot_gen == 0 {
                // The record was created by a timeout or a client-state
                // write; this is the first generation we have seen.
                state.boot_gen = boot_gen;
            } else if state.boot_gen != boot_gen {
                info!(component = "RECOV", peer, boot_gen, "peer rebooted");
                state.boot_gen = boot_gen;
                state.pending_reboot_seen = true;
                inner.trace.record(peer, state.liveness, TraceCause::Reboot);
                if state.liveness == Liveness::Alive {
                    // The crash occurred undetected. Run the crash
                    // callbacks first and block synchronous callers in the
                    // meantime; the host is marked dead here so the
                    // dead-to-alive handling below schedules the reboot
                    // callbacks.
                    state.liveness = Liveness::Dead;
                    if !state.crash_in_progress {
                        state.crash_in_progress = true;
                        spawn_crash = true;
                    }
                    inner.stats.crashes += 1;
                    inner.trace.record(peer, Liveness::Dead, TraceCause::Crash);
                }
            }
            spawn_crash
        };

        if spawn_crash {
            self.spawn_crash_callbacks(peer);
        }

        if mode == SyncMode::Synchronous {
            self.wait_crash_phase(peer).await;
        }

        let spawn_reboot = {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            let Some(state) = inner.peers.get_mut(&peer) else {
                return;
            };
            match state.liveness {
                Liveness::Alive => None,
                Liveness::Dead | Liveness::Unknown => {
                    // The settle pause only applies after a full reboot; a
                    // host that merely went quiet gets callbacks at once.
                    let settle = if state.pending_reboot_seen {
                        self.tuning.reboot_settle
                    } else {
                        info!(component = "RECOV", peer, "peer is back again");
                        Duration::ZERO
                    };
                    state.pending_reboot_seen = false;
                    state.liveness = Liveness::Alive;
                    self.alive_notify.notify_waiters();
                    if !state.reboot_in_progress {
                        state.reboot_in_progress = true;
                        inner.stats.reboots += 1;
                        Some(settle)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(settle) = spawn_reboot {
            self.spawn_reboot_callbacks(peer, settle);
        }
    }

    /// Mark the host as dead; called when an RPC to it timed out.
    /// Idempotent against repeated dead reports. Pings are not initiated
    /// here because nothing may be interested in the host.
    pub fn note_dead(self: &Arc<Self>, peer: HostId) {
        if peer == BROADCAST_HOST || self.tuning.no_timeouts {
            return;
        }

        let spawn_crash = {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            let state = inner.peers.entry(peer).or_insert_with(PeerState::new);
            match state.liveness {
                Liveness::Dead => false,
                Liveness::Unknown | Liveness::Alive => {
                    state.liveness = Liveness::Dead;
                    info!(component = "RECOV", peer, "peer is down");
                    inner.trace.record(peer, Liveness::Dead, TraceCause::Crash);
                    inner.stats.crashes += 1;
                    if !state.crash_in_progress {
                        state.crash_in_progress = true;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if spawn_crash {
            self.spawn_crash_callbacks(peer);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Decide whether the host is down, probing it if there has been no
    /// recent message traffic. With `arm_pinger` set, a down answer also
    /// ensures the background pinger watches the host until it responds.
    pub async fn is_dead(self: &Arc<Self>, peer: HostId, arm_pinger: bool) -> Result<Availability> {
        if peer == BROADCAST_HOST || peer == self.tuning.local_host {
            warn!(component = "RECOV", peer, "is_dead on broadcast or self");
            return Err(RecovError::BadHostId(peer));
        }

        let availability = match self.host_state(peer) {
            Liveness::Alive => Availability::Up,
            Liveness::Dead => Availability::Down,
            Liveness::Unknown => {
                self.trace(peer, Liveness::Unknown, TraceCause::PingAsk);
                match self.probe.ping(peer).await {
                    PingOutcome::Alive(gen) => {
                        self.note_alive(peer, gen, SyncMode::Asynchronous).await;
                        Availability::Up
                    }
                    PingOutcome::Timeout => Availability::Down,
                    PingOutcome::ServiceDisabled => Availability::ServiceDisabled,
                }
            }
        };

        if availability != Availability::Up && arm_pinger {
            self.arm_pinger(peer);
        }
        Ok(availability)
    }

    /// True when reboot callbacks for the peer are scheduled but have not
    /// happened yet, or the peer is down now (arming the pinger in that
    /// case). Lets retry layers wait for regularly scheduled recovery
    /// instead of racing it.
    pub fn pending(&self, peer: HostId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let Some(state) = inner.peers.get_mut(&peer) else {
            return false;
        };
        let mut pending = state.reboot_in_progress;
        if state.liveness == Liveness::Dead {
            pending = true;
            if !state.pinging {
                state.pinging = true;
                inner.stats.hosts_pinged += 1;
            }
        }
        pending
    }

    /// Park until the peer transitions to alive. Arms the pinger so the
    /// transition will eventually be observed.
    pub async fn wait_for(self: &Arc<Self>, peer: HostId) -> Result<WaitOutcome> {
        match self.is_dead(peer, true).await? {
            Availability::Up => return Ok(WaitOutcome::Alive),
            Availability::Down | Availability::ServiceDisabled => {}
        }
        self.trace(peer, Liveness::Dead, TraceCause::Wait);

        loop {
            let notified = self.alive_notify.notified();
            let interrupted = self.shutdown_notify.notified();
            tokio::pin!(notified);
            tokio::pin!(interrupted);
            notified.as_mut().enable();
            interrupted.as_mut().enable();

            if self.is_shutting_down() {
                return Ok(WaitOutcome::Interrupted);
            }
            if self.host_state_raw(peer) == Liveness::Alive {
                self.trace(peer, Liveness::Alive, TraceCause::Wakeup);
                return Ok(WaitOutcome::Alive);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = &mut interrupted => {}
            }
        }
    }

    /// Registry stats snapshot.
    pub fn stats(&self) -> RecovStats {
        self.inner.lock().unwrap().stats
    }

    /// Transition trace snapshot, oldest first.
    pub fn trace_snapshot(&self) -> Vec<TraceRecord> {
        self.inner.lock().unwrap().trace.snapshot()
    }

    // ========================================================================
    // Client state bits
    // ========================================================================

    /// Opaque per-peer state bits owned by other subsystems. Returns 0
    /// when the peer has no record.
    pub fn client_state(&self, peer: HostId) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.peers.get(&peer).map_or(0, |s| s.client_state)
    }

    /// Or bits into the peer's client-state word, creating the record in
    /// the unknown liveness state if needed.
    pub fn set_client_state(&self, peer: HostId, bits: u32) {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.peers.entry(peer).or_insert_with(PeerState::new);
        state.client_state |= bits;
    }

    /// Clear bits in the peer's client-state word. Does nothing if the
    /// peer has no record.
    pub fn clear_client_state(&self, peer: HostId, bits: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.peers.get_mut(&peer) {
            state.client_state &= !bits;
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Best guess at the host's state for probing decisions: alive only
    /// counts with recent message traffic, otherwise the caller should
    /// ping to make sure.
    fn host_state(&self, peer: HostId) -> Liveness {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.peers.get(&peer) else {
            return Liveness::Unknown;
        };
        match state.liveness {
            Liveness::Alive => match state.last_heard {
                Some(at) if at.elapsed() <= self.tuning.recent_traffic => Liveness::Alive,
                _ => Liveness::Unknown,
            },
            other => other,
        }
    }

    /// The stored liveness without the recent-traffic heuristic.
    fn host_state_raw(&self, peer: HostId) -> Liveness {
        let inner = self.inner.lock().unwrap();
        inner.peers.get(&peer).map_or(Liveness::Unknown, |s| s.liveness)
    }

    fn trace(&self, peer: HostId, liveness: Liveness, cause: TraceCause) {
        self.inner.lock().unwrap().trace.record(peer, liveness, cause);
    }

    /// Block until no crash callback phase is in progress for the peer.
    async fn wait_crash_phase(&self, peer: HostId) {
        loop {
            let notified = self.recovery_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().unwrap();
                let in_progress = inner
                    .peers
                    .get(&peer)
                    .map_or(false, |s| s.crash_in_progress);
                if !in_progress {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Copy out the callbacks matching `event` under the lock; the
    /// dispatcher iterates outside it.
    fn callbacks_for(&self, event: When) -> Vec<Arc<dyn RecoveryCallback>> {
        let inner = self.inner.lock().unwrap();
        inner
            .callbacks
            .iter()
            .filter(|e| e.when.matches(event))
            .map(|e| Arc::clone(&e.callback))
            .collect()
    }

    fn run_callbacks(&self, peer: HostId, event: When) {
        for cb in self.callbacks_for(event) {
            if let Err(e) = cb.on_event(peer, event) {
                warn!(component = "RECOV", peer, ?event, error = %e, "recovery callback failed");
            }
        }
    }

    fn spawn_crash_callbacks(self: &Arc<Self>, peer: HostId) {
        let reg = Arc::clone(self);
        tokio::spawn(async move {
            reg.run_callbacks(peer, When::Down);
            {
                let mut inner = reg.inner.lock().unwrap();
                if let Some(state) = inner.peers.get_mut(&peer) {
                    state.crash_in_progress = false;
                }
                inner.trace.record(peer, Liveness::Dead, TraceCause::Done);
            }
            reg.recovery_notify.notify_waiters();
            debug!(component = "RECOV", peer, "crash callbacks complete");
        });
    }

    /// The reboot task pings before invoking anyone: a host that answers
    /// the ping is ready for re-open traffic. Failures reschedule the ping
    /// until the host answers or the registry shuts down.
    fn spawn_reboot_callbacks(self: &Arc<Self>, peer: HostId, settle: Duration) {
        let reg = Arc::clone(self);
        tokio::spawn(async move {
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            loop {
                if reg.is_shutting_down() {
                    return;
                }
                match reg.probe.ping(peer).await {
                    PingOutcome::Alive(gen) => {
                        reg.note_alive(peer, gen, SyncMode::Asynchronous).await;
                        break;
                    }
                    PingOutcome::ServiceDisabled => {
                        info!(component = "RECOV", peer, "still booting");
                        tokio::time::sleep(reg.tuning.reboot_settle).await;
                    }
                    PingOutcome::Timeout => {
                        info!(component = "RECOV", peer, "not responding");
                        tokio::time::sleep(reg.tuning.reboot_settle).await;
                    }
                }
            }
            reg.run_callbacks(peer, When::Reboot);
            {
                let mut inner = reg.inner.lock().unwrap();
                if let Some(state) = inner.peers.get_mut(&peer) {
                    state.reboot_in_progress = false;
                }
                inner.trace.record(peer, Liveness::Alive, TraceCause::Done);
            }
            debug!(component = "RECOV", peer, "reboot callbacks complete");
        });
    }

    // ========================================================================
    // Pinger bookkeeping (driven by crate::pinger)
    // ========================================================================

    pub(crate) fn arm_pinger(&self, peer: HostId) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let state = inner.peers.entry(peer).or_insert_with(PeerState::new);
        if !state.pinging {
            state.pinging = true;
            inner.stats.hosts_pinged += 1;
        }
    }

    pub(crate) fn disarm_pinger(&self, peer: HostId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.peers.get_mut(&peer) {
            state.pinging = false;
        }
    }

    /// Peers currently on the pinger's active list.
    pub(crate) fn armed_peers(&self) -> Vec<HostId> {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .iter()
            .filter(|(_, s)| s.pinging)
            .map(|(id, _)| *id)
            .collect()
    }

    /// What the pinger should do for one armed peer this round.
    pub(crate) fn ping_decision(&self, peer: HostId) -> PingDecision {
        match self.host_state(peer) {
            Liveness::Alive => {
                // Recent traffic proves the host is back; the arming
                // transition already ran recovery, nothing left to watch.
                PingDecision::Disarm
            }
            Liveness::Unknown | Liveness::Dead => PingDecision::Ping,
        }
    }

    pub(crate) fn count_ping(&self, sent: bool) {
        let mut inner = self.inner.lock().unwrap();
        if sent {
            inner.stats.pings += 1;
        } else {
            inner.stats.pings_suppressed += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingDecision {
    Ping,
    Disarm,
}
