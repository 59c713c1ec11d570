//! Session manager: the single event loop owning the session↔instance
//! mapping, the warm pool and the waiting-request queue.
//!
//! All mutable session state lives inside the loop; nothing else reads or
//! writes it. The loop consumes a fan-in of the RPC command channel, the
//! lifecycle controller's bus topics and a sweep ticker, and processes one
//! event at a time.

pub mod hash;
pub mod request;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Bus;
use crate::shared::addr::ContainerAddr;
use crate::shared::config::Config;
use crate::supervisor::Service;
use self::request::{SessionCommand, SessionError, SessionInfo};

/// Sweep cadence for expiry and the recently-removed set.
const TICK_PERIOD: Duration = Duration::from_secs(5);
/// How long a stopped addr is remembered to suppress duplicate stop orders
/// while reconciliation snapshots still contain it.
const RECENTLY_REMOVED_TTL: Duration = Duration::from_secs(60);

struct SessionState {
    session_id: String,
    addr: ContainerAddr,
    expires_on: Instant,
}

struct WaitingRequest {
    session_id: String,
    session_hash: String,
    reply: oneshot::Sender<Result<ContainerAddr, SessionError>>,
}

pub struct SessionManager {
    pool_size: usize,
    session_timeout: Duration,
    bus: Arc<Bus>,

    commands: mpsc::Receiver<SessionCommand>,
    docker_ready: mpsc::Receiver<ContainerAddr>,
    docker_stop: mpsc::Receiver<ContainerAddr>,
    docker_state: mpsc::Receiver<HashSet<ContainerAddr>>,

    /// sessionHash -> session. Inverse of `containers`.
    sessions: HashMap<String, SessionState>,
    /// assigned addr -> sessionHash. Inverse of `sessions`.
    containers: HashMap<ContainerAddr, String>,
    /// Warm, unassigned instances.
    pool: VecDeque<ContainerAddr>,
    /// Callers parked until an instance becomes ready.
    waiting: VecDeque<WaitingRequest>,
    /// Addrs ordered stopped recently; suppresses duplicate stop orders.
    recently_removed: HashMap<ContainerAddr, Instant>,
    /// Set once the bootstrap state snapshot has been consumed. Only then
    /// does the reconciler correct steady-state divergence.
    started: bool,
}

impl SessionManager {
    pub fn new(config: &Config, bus: Arc<Bus>, commands: mpsc::Receiver<SessionCommand>) -> Self {
        let docker_ready = bus.docker_ready.subscribe();
        let docker_stop = bus.docker_stop.subscribe();
        let docker_state = bus.docker_state.subscribe();
        Self {
            pool_size: config.reverseproxy.pool,
            session_timeout: Duration::from_secs(config.reverseproxy.session.timeout),
            bus,
            commands,
            docker_ready,
            docker_stop,
            docker_state,
            sessions: HashMap::new(),
            containers: HashMap::new(),
            pool: VecDeque::new(),
            waiting: VecDeque::new(),
            recently_removed: HashMap::new(),
            started: false,
        }
    }

    async fn run_loop(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        loop {
            // Biased: instance events settle before new RPCs are admitted,
            // so a command never observes a stale pool.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.drain();
                    info!("session manager closed");
                    return Ok(());
                }
                Some(state) = self.docker_state.recv() => self.on_state(state),
                Some(addr) = self.docker_ready.recv() => self.on_ready(addr),
                Some(addr) = self.docker_stop.recv() => self.on_stop(addr),
                Some(command) = self.commands.recv() => self.on_command(command),
                _ = ticker.tick() => self.on_tick(),
            }
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Match {
                session_id,
                session_hash,
                reply,
            } => self.on_match(session_id, session_hash, reply),
            SessionCommand::Delete {
                session_hash,
                reply,
            } => {
                let _ = reply.send(self.delete_session(&session_hash));
            }
            SessionCommand::GetSessions { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn on_match(
        &mut self,
        session_id: String,
        session_hash: String,
        reply: oneshot::Sender<Result<ContainerAddr, SessionError>>,
    ) {
        if let Some(state) = self.sessions.get_mut(&session_hash) {
            state.expires_on = Instant::now() + self.session_timeout;
            let _ = reply.send(Ok(state.addr.clone()));
            return;
        }

        // New session: ask for one refill up front so the pool recovers the
        // instance this session is about to take.
        self.bus.session_request.broadcast(());
        self.bus.session_metric_start.broadcast(());

        match self.pool.pop_front() {
            Some(addr) => {
                debug!(session = %session_hash, %addr, "leasing pooled instance");
                self.bind(session_id, session_hash, addr.clone());
                let _ = reply.send(Ok(addr));
            }
            None => {
                debug!(session = %session_hash, "pool empty, parking request");
                self.waiting.push_back(WaitingRequest {
                    session_id,
                    session_hash,
                    reply,
                });
            }
        }
    }

    fn on_ready(&mut self, addr: ContainerAddr) {
        match self.waiting.pop_front() {
            Some(waiter) => {
                debug!(session = %waiter.session_hash, %addr, "handing fresh instance to waiter");
                self.bind(waiter.session_id, waiter.session_hash, addr.clone());
                let _ = waiter.reply.send(Ok(addr));
            }
            None => self.pool.push_back(addr),
        }
    }

    fn on_stop(&mut self, addr: ContainerAddr) {
        self.pool.retain(|pooled| *pooled != addr);
        if let Some(session_hash) = self.containers.remove(&addr) {
            self.sessions.remove(&session_hash);
            info!(session = %session_hash, %addr, "instance lost, session dropped");
        }

        // Refill up to the pool target. Parked requests already asked for
        // their own instance, so they count against the deficit.
        let covered = self.pool.len() + self.waiting.len();
        for _ in covered..self.pool_size {
            self.bus.session_request.broadcast(());
        }
    }

    fn on_state(&mut self, state: HashSet<ContainerAddr>) {
        if self.started {
            self.reconcile(state);
        } else {
            self.bootstrap(state);
        }
    }

    /// First state snapshot: adopt the observed instances as the initial
    /// pool, trimming or topping up to the configured size.
    fn bootstrap(&mut self, state: HashSet<ContainerAddr>) {
        let mut observed: Vec<ContainerAddr> = state.into_iter().collect();
        observed.sort();

        if observed.len() > self.pool_size {
            for addr in observed.split_off(self.pool_size) {
                info!(%addr, "bootstrap: stopping excess instance");
                self.bus.session_stop.broadcast(addr.clone());
                self.recently_removed.insert(addr, Instant::now());
            }
        } else {
            for _ in observed.len()..self.pool_size {
                self.bus.session_request.broadcast(());
            }
        }

        info!(
            adopted = observed.len(),
            pool = self.pool_size,
            "bootstrap complete, session manager started"
        );
        self.pool.extend(observed);
        self.started = true;
    }

    /// Steady-state reconciliation: the snapshot is ground truth.
    fn reconcile(&mut self, state: HashSet<ContainerAddr>) {
        // Instances the engine runs but this loop does not know: order them
        // stopped once, remembering the order for the dedup window.
        for addr in &state {
            if !self.containers.contains_key(addr)
                && !self.pool.contains(addr)
                && !self.recently_removed.contains_key(addr)
            {
                warn!(%addr, "unknown instance observed, ordering stop");
                self.bus.session_stop.broadcast(addr.clone());
                self.recently_removed.insert(addr.clone(), Instant::now());
            }
        }

        // Instances this loop believes in that the engine no longer runs:
        // reconcile the tables as if a stop event had arrived.
        let lost: Vec<ContainerAddr> = self
            .pool
            .iter()
            .chain(self.containers.keys())
            .filter(|addr| !state.contains(*addr))
            .cloned()
            .collect();
        for addr in lost {
            warn!(%addr, "tracked instance missing from engine state");
            self.on_stop(addr);
        }
    }

    /// Expiry sweep plus pruning of the recently-removed set.
    fn on_tick(&mut self) {
        let now = Instant::now();

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, state)| state.expires_on <= now)
            .map(|(session_hash, _)| session_hash.clone())
            .collect();
        for session_hash in expired {
            if let Some(state) = self.sessions.remove(&session_hash) {
                info!(session = %session_hash, addr = %state.addr, "session expired");
                self.containers.remove(&state.addr);
                self.bus.session_stop.broadcast(state.addr.clone());
                self.recently_removed.insert(state.addr, now);
            }
        }

        self.recently_removed
            .retain(|_, stopped| now.duration_since(*stopped) < RECENTLY_REMOVED_TTL);
    }

    fn bind(&mut self, session_id: String, session_hash: String, addr: ContainerAddr) {
        self.containers.insert(addr.clone(), session_hash.clone());
        self.sessions.insert(
            session_hash,
            SessionState {
                session_id,
                addr,
                expires_on: Instant::now() + self.session_timeout,
            },
        );
    }

    fn delete_session(&mut self, session_hash: &str) -> bool {
        match self.sessions.remove(session_hash) {
            Some(state) => {
                info!(session = %session_hash, addr = %state.addr, "session deleted");
                self.containers.remove(&state.addr);
                self.bus.session_stop.broadcast(state.addr.clone());
                self.recently_removed.insert(state.addr, Instant::now());
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> HashMap<String, SessionInfo> {
        let now = Instant::now();
        self.sessions
            .iter()
            .map(|(session_hash, state)| {
                let remaining = state.expires_on.duration_since(now);
                let expires_on = Utc::now()
                    + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero());
                (
                    session_hash.clone(),
                    SessionInfo {
                        session_id: state.session_id.clone(),
                        addr: state.addr.clone(),
                        expires_on,
                    },
                )
            })
            .collect()
    }

    /// Cancel every parked caller and any queued command so shutdown never
    /// leaves a request blocked forever.
    fn drain(&mut self) {
        for waiter in self.waiting.drain(..) {
            let _ = waiter.reply.send(Err(SessionError::ShuttingDown));
        }
        while let Ok(command) = self.commands.try_recv() {
            command.cancel();
        }
    }
}

#[async_trait]
impl Service for SessionManager {
    fn name(&self) -> &'static str {
        "sessionmanager"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("starting session manager");
        self.run_loop(shutdown).await
    }
}

#[cfg(test)]
mod tests;
