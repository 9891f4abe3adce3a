//! The pinner actor
//!
//! A single task owns the tag → digest mapping for one workflow and
//! processes its inbox one message at a time. Clients, resolver replies,
//! store completions, and the pinner's own timers all arrive through the
//! same channel, so every state change happens in one total order and no
//! locking is needed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{Digest, ImageRef};
use crate::resolver::{ResolveReply, ResolveRequest};
use crate::store::{DigestStore, PinnedRow, StoreError};

use super::backoff::Backoff;
use super::config::PinnerConfig;
use super::handle::PinnerHandle;
use super::messages::{LookupError, LookupResult, PinMsg, PinnerMetrics};

/// Lifecycle of one outstanding reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Forwarded to the resolver, no answer yet
    AwaitingResolver,
    /// Resolver answered; the digest write is in progress
    Persisting,
}

/// Book-keeping for a reference that is neither unknown nor pinned
struct InFlight {
    /// Parked clients, in join order
    waiters: Vec<oneshot::Sender<LookupResult>>,
    /// Attempt epoch; timers carry this so a stale timer from an evicted
    /// attempt cannot clip a newer one for the same reference
    epoch: u64,
    phase: Phase,
    backoff: Backoff,
}

/// Coordinator lifecycle state
enum Fsm {
    /// Restart only: waiting for the store to replay prior resolutions
    LoadingCache,
    /// Normal serving
    Running,
    /// Absorbing failure state; every request gets the sticky reason
    Terminal { reason: String },
}

/// Per-workflow digest pinning coordinator
///
/// Construct with the resolver's request channel and a [`DigestStore`],
/// then `tokio::spawn(pinner.run())`. Talk to it through a
/// [`PinnerHandle`]; wire resolver replies back in through
/// [`Pinner::sender`].
pub struct Pinner {
    config: PinnerConfig,
    workflow_id: String,
    tx: mpsc::UnboundedSender<PinMsg>,
    rx: mpsc::UnboundedReceiver<PinMsg>,
    resolver_tx: mpsc::UnboundedSender<ResolveRequest>,
    store: Arc<dyn DigestStore>,
}

impl Pinner {
    /// Create a new pinner for one workflow
    pub fn new(
        config: PinnerConfig,
        workflow_id: impl Into<String>,
        resolver_tx: mpsc::UnboundedSender<ResolveRequest>,
        store: Arc<dyn DigestStore>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            workflow_id: workflow_id.into(),
            tx,
            rx,
            resolver_tx,
            store,
        }
    }

    /// Get a sender into the pinner's inbox
    ///
    /// Resolver replies are delivered through this, wrapped in
    /// [`PinMsg::Resolver`].
    pub fn sender(&self) -> mpsc::UnboundedSender<PinMsg> {
        self.tx.clone()
    }

    /// Create a client handle
    pub fn handle(&self) -> PinnerHandle {
        PinnerHandle::new(self.tx.clone())
    }

    /// Run the pinner task
    ///
    /// Consumes the pinner and runs until [`PinMsg::Shutdown`] or until
    /// every sender is dropped.
    pub async fn run(mut self) {
        let mut core = Core {
            fsm: Fsm::Running,
            resolved: HashMap::new(),
            in_flight: HashMap::new(),
            buffer: VecDeque::new(),
            next_epoch: 0,
            metrics: PinnerMetrics::default(),
            config: self.config,
            workflow_id: self.workflow_id,
            tx: self.tx,
            resolver_tx: self.resolver_tx,
            store: self.store,
        };

        if core.config.is_restart {
            core.fsm = Fsm::LoadingCache;
            core.spawn_load();
            info!(workflow_id = %core.workflow_id, "pinner started; rehydrating cache");
        } else {
            info!(workflow_id = %core.workflow_id, "pinner started");
        }

        while let Some(msg) = self.rx.recv().await {
            core.metrics.messages_received += 1;

            match msg {
                PinMsg::Lookup { reference, reply } => core.handle_lookup(reference, reply),
                PinMsg::Resolver(reply) => core.handle_resolver_reply(reply),
                PinMsg::ResolveTimeout { reference, epoch } => core.on_timeout(reference, epoch),
                PinMsg::Resend { reference, epoch } => core.on_resend(reference, epoch),
                PinMsg::LoadCompleted { result } => core.on_load_completed(result),
                PinMsg::StoreCompleted {
                    reference,
                    digest,
                    result,
                } => core.on_store_completed(reference, digest, result),
                PinMsg::GetMetrics { reply } => {
                    let _ = reply.send(core.metrics_snapshot());
                }
                PinMsg::Shutdown => {
                    info!(workflow_id = %core.workflow_id, "pinner shutting down");
                    break;
                }
            }
        }

        info!(workflow_id = %core.workflow_id, "pinner stopped");
    }
}

/// The state the run loop owns
struct Core {
    fsm: Fsm,
    /// Pinned digests; grows monotonically, disjoint from `in_flight`
    resolved: HashMap<ImageRef, Digest>,
    in_flight: HashMap<ImageRef, InFlight>,
    /// Lookups parked while the cache loads
    buffer: VecDeque<(ImageRef, oneshot::Sender<LookupResult>)>,
    next_epoch: u64,
    metrics: PinnerMetrics,

    config: PinnerConfig,
    workflow_id: String,
    tx: mpsc::UnboundedSender<PinMsg>,
    resolver_tx: mpsc::UnboundedSender<ResolveRequest>,
    store: Arc<dyn DigestStore>,
}

impl Core {
    fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn handle_lookup(&mut self, reference: ImageRef, reply: oneshot::Sender<LookupResult>) {
        match &self.fsm {
            Fsm::Terminal { reason } => {
                let _ = reply.send(Err(LookupError::Terminal(reason.clone())));
            }
            Fsm::LoadingCache => {
                debug!(%reference, "cache loading; lookup buffered");
                self.buffer.push_back((reference, reply));
            }
            Fsm::Running => {
                if let Some(digest) = self.resolved.get(&reference) {
                    self.metrics.cache_hits += 1;
                    let _ = reply.send(Ok(digest.clone()));
                } else if let Some(entry) = self.in_flight.get_mut(&reference) {
                    debug!(%reference, waiters = entry.waiters.len() + 1, "lookup joined in-flight entry");
                    entry.waiters.push(reply);
                } else {
                    let epoch = self.next_epoch();
                    self.in_flight.insert(
                        reference.clone(),
                        InFlight {
                            waiters: vec![reply],
                            epoch,
                            phase: Phase::AwaitingResolver,
                            backoff: self.config.backoff(),
                        },
                    );
                    debug!(%reference, epoch, "forwarding lookup to resolver");
                    self.dispatch_resolver(reference, epoch);
                }
            }
        }
    }

    /// Send the request to the resolver and arm the self-imposed timeout
    fn dispatch_resolver(&mut self, reference: ImageRef, epoch: u64) {
        if self.resolver_tx.send(ResolveRequest::new(reference.clone())).is_err() {
            warn!(%reference, "resolver channel closed; failing lookup");
            if let Some(entry) = self.in_flight.remove(&reference) {
                fail_waiters(entry.waiters, &LookupError::Resolver("resolver unavailable".to_string()));
            }
            return;
        }
        self.metrics.resolver_requests_sent += 1;

        let tx = self.tx.clone();
        let timeout = self.config.resolver_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(PinMsg::ResolveTimeout { reference, epoch });
        });
    }

    fn handle_resolver_reply(&mut self, reply: ResolveReply) {
        if !matches!(self.fsm, Fsm::Running) {
            debug!("resolver reply outside Running; ignored");
            return;
        }

        match reply {
            ResolveReply::Success { request, digest } => self.on_resolver_success(request.reference, digest),
            ResolveReply::Failure { request, reason } => self.on_resolver_failure(request.reference, reason),
            ResolveReply::BackPressure { request } => self.on_backpressure(request.reference),
        }
    }

    fn on_resolver_success(&mut self, reference: ImageRef, digest: Digest) {
        match self.in_flight.get_mut(&reference) {
            Some(entry) if entry.phase == Phase::AwaitingResolver => {
                debug!(%reference, %digest, "resolver success; persisting");
                entry.phase = Phase::Persisting;
                self.spawn_store(reference, digest);
            }
            Some(_) => {
                debug!(%reference, "duplicate resolver success while persisting; discarded");
            }
            None if self.resolved.contains_key(&reference) => {
                debug!(%reference, "late resolver success for pinned reference; discarded");
            }
            None => {
                // Late reply: a timeout or failure already evicted the
                // entry and answered the waiters. The resolution is still
                // good, so persist it for future lookups. The empty entry
                // holds the slot: concurrent lookups join it instead of
                // re-resolving, and a second late reply cannot double-write.
                debug!(%reference, %digest, "late resolver success; persisting without waiters");
                let epoch = self.next_epoch();
                self.in_flight.insert(
                    reference.clone(),
                    InFlight {
                        waiters: vec![],
                        epoch,
                        phase: Phase::Persisting,
                        backoff: self.config.backoff(),
                    },
                );
                self.spawn_store(reference, digest);
            }
        }
    }

    fn on_resolver_failure(&mut self, reference: ImageRef, reason: String) {
        let awaiting = matches!(
            self.in_flight.get(&reference),
            Some(entry) if entry.phase == Phase::AwaitingResolver
        );
        if awaiting {
            if let Some(entry) = self.in_flight.remove(&reference) {
                warn!(%reference, %reason, "resolver failure; evicting");
                fail_waiters(entry.waiters, &LookupError::Resolver(reason));
            }
        } else {
            debug!(%reference, %reason, "resolver failure for settled reference; discarded");
        }
    }

    fn on_backpressure(&mut self, reference: ImageRef) {
        match self.in_flight.get_mut(&reference) {
            Some(entry) if entry.phase == Phase::AwaitingResolver => {
                let delay = entry.backoff.next_delay();
                let epoch = entry.epoch;
                self.metrics.backpressure_retries += 1;
                debug!(%reference, ?delay, "resolver backpressure; re-send scheduled");

                // The original timeout stays armed; only the forward moves.
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(PinMsg::Resend { reference, epoch });
                });
            }
            _ => {
                debug!(%reference, "backpressure for settled reference; ignored");
            }
        }
    }

    fn on_resend(&mut self, reference: ImageRef, epoch: u64) {
        if !matches!(self.fsm, Fsm::Running) {
            return;
        }
        let still_waiting = matches!(
            self.in_flight.get(&reference),
            Some(entry) if entry.phase == Phase::AwaitingResolver && entry.epoch == epoch
        );
        if still_waiting {
            debug!(%reference, epoch, "re-sending after backpressure");
            self.dispatch_resolver(reference, epoch);
        } else {
            debug!(%reference, epoch, "stale re-send; ignored");
        }
    }

    fn on_timeout(&mut self, reference: ImageRef, epoch: u64) {
        let expired = matches!(
            self.in_flight.get(&reference),
            Some(entry) if entry.phase == Phase::AwaitingResolver && entry.epoch == epoch
        );
        if expired {
            if let Some(entry) = self.in_flight.remove(&reference) {
                self.metrics.resolver_timeouts += 1;
                warn!(%reference, epoch, "resolver request timed out; evicting");
                fail_waiters(entry.waiters, &LookupError::Timeout);
            }
        } else {
            debug!(%reference, epoch, "timeout for settled reference; ignored");
        }
    }

    fn on_load_completed(&mut self, result: Result<Vec<PinnedRow>, StoreError>) {
        if !matches!(self.fsm, Fsm::LoadingCache) {
            debug!("load completion outside LoadingCache; ignored");
            return;
        }

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                self.enter_terminal(format!("cache load failed: {}", e));
                return;
            }
        };

        // Duplicate rows for a tag are legitimate (failed-then-retried
        // writes); last write wins. Malformed rows are not: a row that no
        // longer parses means silently serving different digests than the
        // previous run, so the whole workflow must fail instead.
        let mut resolved = HashMap::new();
        for row in &rows {
            let reference: ImageRef = match row.tag.parse() {
                Ok(r) => r,
                Err(e) => {
                    self.enter_terminal(format!("stored tag {:?} unparseable: {}", row.tag, e));
                    return;
                }
            };
            let digest = match Digest::parse_canonical(&row.digest) {
                Ok(d) => d,
                Err(e) => {
                    self.enter_terminal(format!("stored digest {:?} unparseable: {}", row.digest, e));
                    return;
                }
            };
            resolved.insert(reference, digest);
        }

        info!(
            entries = resolved.len(),
            buffered = self.buffer.len(),
            "cache rehydrated"
        );
        self.resolved = resolved;
        self.fsm = Fsm::Running;

        while let Some((reference, reply)) = self.buffer.pop_front() {
            self.handle_lookup(reference, reply);
        }
    }

    fn on_store_completed(&mut self, reference: ImageRef, digest: Digest, result: Result<(), StoreError>) {
        if !matches!(self.fsm, Fsm::Running) {
            debug!(%reference, "store completion outside Running; ignored");
            return;
        }

        match result {
            Ok(()) => {
                self.metrics.store_writes += 1;
                let waiters = self.in_flight.remove(&reference).map(|e| e.waiters).unwrap_or_default();
                info!(%reference, %digest, waiters = waiters.len(), "digest pinned");
                self.resolved.insert(reference, digest.clone());
                for waiter in waiters {
                    let _ = waiter.send(Ok(digest.clone()));
                }
            }
            Err(e) => {
                self.metrics.store_failures += 1;
                warn!(%reference, error = %e, "digest write failed; evicting");
                if let Some(entry) = self.in_flight.remove(&reference) {
                    fail_waiters(entry.waiters, &LookupError::Store(e.to_string()));
                }
            }
        }
    }

    fn enter_terminal(&mut self, reason: String) {
        warn!(%reason, "entering terminal state");
        let err = LookupError::Terminal(reason.clone());

        for (_, entry) in self.in_flight.drain() {
            fail_waiters(entry.waiters, &err);
        }
        while let Some((_, reply)) = self.buffer.pop_front() {
            let _ = reply.send(Err(err.clone()));
        }

        self.fsm = Fsm::Terminal { reason };
    }

    fn spawn_load(&self) {
        let store = Arc::clone(&self.store);
        let workflow_id = self.workflow_id.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = store.load(&workflow_id).await;
            let _ = tx.send(PinMsg::LoadCompleted { result });
        });
    }

    fn spawn_store(&self, reference: ImageRef, digest: Digest) {
        let store = Arc::clone(&self.store);
        let workflow_id = self.workflow_id.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = store.store(&workflow_id, &reference.to_string(), &digest.canonical()).await;
            let _ = tx.send(PinMsg::StoreCompleted {
                reference,
                digest,
                result,
            });
        });
    }

    fn metrics_snapshot(&self) -> PinnerMetrics {
        let mut metrics = self.metrics.clone();
        metrics.resolved_entries = self.resolved.len();
        metrics.in_flight_references = self.in_flight.len();
        metrics.buffered_lookups = self.buffer.len();
        metrics
    }
}

/// Fan one failure out to every parked waiter, in join order
fn fail_waiters(waiters: Vec<oneshot::Sender<LookupResult>>, err: &LookupError) {
    for waiter in waiters {
        let _ = waiter.send(Err(err.clone()));
    }
}
