//! # Worker Pool Scheduler
//!
//! Owns one authenticated session per configured user and drains a shared
//! queue of work items with them.
//!
//! ## Lifecycle
//!
//! `Initializing → Running → Draining → Done`. A pool starts out empty in
//! `Initializing`; [`WorkerPool::login_all`] creates one session per user and
//! moves it to `Running`. Sessions are reused for every pass and
//! [`WorkerPool::close`] releases them.
//!
//! ## Passes
//!
//! [`WorkerPool::run_pass`] moves every session into its own task. A task
//! holds at most one item at a time, so a session never has two queries in
//! flight. Failed items go back to the queue; a pass is finished when the
//! number of completed plus abandoned items reaches the number of items it
//! started with. An empty queue on its own means nothing, since a failing
//! item may still be on its way back.
//!
//! A worker task that dies mid-query gives its held item back to the queue
//! and loses its session. The pass ends when no worker is left.
//!
//! Decoded observations are sent to an `mpsc` sink; the pool itself never
//! touches the deduplicated stores.

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cells::QueryCellSet;
use crate::client::{self, AuthProvider, Credentials, MapQuery, ServiceConnector, ServiceSession};
use crate::config::{MalformedPolicy, PoolSettings, ScanConfiguration};
use crate::error::{ConfigurationError, ScanError, ScanResult};
use crate::geometry::SamplePoint;
use crate::merger::{self, EntityObservation};
use crate::shutdown::ShutdownSignal;

/// Where the pool is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Initializing,
    Running,
    Draining,
    Done,
}

/// Lifecycle of one work item inside a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Pending,
    InFlight,
    Completed,
    /// Gave up after the configured number of attempts.
    Failed,
}

/// A sample point together with the cells to query for it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub index: usize,
    pub point: SamplePoint,
    pub cells: QueryCellSet,
}

impl WorkItem {
    fn query(&self) -> MapQuery {
        MapQuery {
            position: self.point,
            cell_ids: self.cells.clone(),
            since_timestamp_ms: 0,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub pass: u32,
    pub total: usize,
    pub completed: usize,
    pub abandoned: usize,
    /// Failed query attempts, including ones that were later retried.
    pub failed_attempts: usize,
    pub malformed: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl PassReport {
    /// True when every item was either completed or given up on.
    pub fn is_done(&self) -> bool {
        self.completed + self.abandoned == self.total
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pass {}: {}/{} points completed, {} abandoned, {} failed attempts, {} malformed in {:.1}s",
            self.pass + 1,
            self.completed,
            self.total,
            self.abandoned,
            self.failed_attempts,
            self.malformed,
            self.elapsed.as_secs_f64()
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ItemProgress {
    state: WorkState,
    attempts: u32,
}

/// State shared by the tasks of one pass.
struct RunState {
    queue: SegQueue<WorkItem>,
    items: DashMap<usize, ItemProgress>,
    /// Item each worker currently holds, by session id.
    held: DashMap<Uuid, WorkItem>,
    total: usize,
    completed: AtomicUsize,
    abandoned: AtomicUsize,
    failed_attempts: AtomicUsize,
    malformed: AtomicUsize,
}

impl RunState {
    fn new(work: Vec<WorkItem>) -> Self {
        let items = DashMap::with_capacity(work.len());
        let queue = SegQueue::new();
        let total = work.len();
        for item in work {
            items.insert(
                item.index,
                ItemProgress {
                    state: WorkState::Pending,
                    attempts: 0,
                },
            );
            queue.push(item);
        }
        Self {
            queue,
            items,
            held: DashMap::new(),
            total,
            completed: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
            failed_attempts: AtomicUsize::new(0),
            malformed: AtomicUsize::new(0),
        }
    }

    fn is_done(&self) -> bool {
        self.completed.load(Ordering::SeqCst) + self.abandoned.load(Ordering::SeqCst) >= self.total
    }

    /// Marks the item in flight for `worker` and returns its attempt number.
    fn begin(&self, worker: Uuid, item: &WorkItem) -> u32 {
        self.held.insert(worker, item.clone());
        match self.items.get_mut(&item.index) {
            Some(mut progress) => {
                progress.state = WorkState::InFlight;
                progress.attempts += 1;
                progress.attempts
            }
            None => 1,
        }
    }

    fn set_state(&self, index: usize, state: WorkState) {
        if let Some(mut progress) = self.items.get_mut(&index) {
            progress.state = state;
        }
    }

    fn release(&self, worker: Uuid) -> Option<WorkItem> {
        self.held.remove(&worker).map(|(_, item)| item)
    }

    /// Puts back the item a dead worker was holding, counted as a failed attempt.
    fn recover(&self, worker: Uuid, max_attempts: Option<u32>) {
        if let Some(item) = self.release(worker) {
            let attempt = self.items.get(&item.index).map(|progress| progress.attempts).unwrap_or(1);
            warn!("Requeueing point {} held by lost worker {}", item.point, worker);
            self.fail(item, attempt, max_attempts);
        }
    }

    fn complete(&self, index: usize) {
        self.set_state(index, WorkState::Completed);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Requeues the item, or abandons it once `max_attempts` is used up.
    fn fail(&self, item: WorkItem, attempt: u32, max_attempts: Option<u32>) {
        self.failed_attempts.fetch_add(1, Ordering::SeqCst);
        if max_attempts.is_some_and(|max| attempt >= max) {
            warn!("Abandoning point {} after {} attempts", item.point, attempt);
            self.set_state(item.index, WorkState::Failed);
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        } else {
            self.set_state(item.index, WorkState::Pending);
            self.queue.push(item);
        }
    }

    fn state_of(&self, index: usize) -> Option<WorkState> {
        self.items.get(&index).map(|progress| progress.state)
    }

    fn report(&self, pass: u32, cancelled: bool, elapsed: Duration) -> PassReport {
        PassReport {
            pass,
            total: self.total,
            completed: self.completed.load(Ordering::SeqCst),
            abandoned: self.abandoned.load(Ordering::SeqCst),
            failed_attempts: self.failed_attempts.load(Ordering::SeqCst),
            malformed: self.malformed.load(Ordering::SeqCst),
            cancelled,
            elapsed,
        }
    }
}

/// One logged-in worker identity.
struct PooledSession {
    id: Uuid,
    username: String,
    session: Box<dyn ServiceSession>,
}

/// Fixed set of sessions plus the settings they run with.
pub struct WorkerPool {
    sessions: Vec<PooledSession>,
    settings: Arc<PoolSettings>,
    state: PoolState,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("sessions", &self.sessions.len())
            .field("state", &self.state)
            .finish()
    }
}

/// Logs one credential in, retrying at a fixed interval.
///
/// # Errors
/// * `ScanError::Login` once `max_login_attempts` is exhausted
/// * `ScanError::Cancelled` when the shutdown signal fires while waiting
pub async fn login_with_retry(
    connector: &dyn ServiceConnector,
    provider: AuthProvider,
    credentials: &Credentials,
    settings: &PoolSettings,
    shutdown: &ShutdownSignal,
) -> ScanResult<Box<dyn ServiceSession>> {
    let mut shutdown = shutdown.clone();
    let mut attempts = 0u32;
    loop {
        if shutdown.is_triggered() {
            return Err(ScanError::Cancelled);
        }
        attempts += 1;
        match connector.login(provider, credentials).await {
            Ok(session) => {
                info!("🔐 Logged in {} via {} (attempt {})", credentials.username, provider, attempts);
                return Ok(session);
            }
            Err(source) => {
                if settings.max_login_attempts.is_some_and(|max| attempts >= max) {
                    error!("Giving up on {} after {} login attempts: {}", credentials.username, attempts, source);
                    return Err(ScanError::Login {
                        username: credentials.username.clone(),
                        attempts,
                        source,
                    });
                }
                warn!(
                    "Login failed for {} (attempt {}): {}; retrying in {:?}",
                    credentials.username, attempts, source, settings.login_retry
                );
                if !shutdown.sleep(settings.login_retry).await {
                    return Err(ScanError::Cancelled);
                }
            }
        }
    }
}

impl WorkerPool {
    /// Logs every configured user in concurrently.
    ///
    /// The pool only exists once all users have a session. If any login
    /// fails for good, the sessions that did succeed are closed again.
    pub async fn connect(
        connector: &dyn ServiceConnector,
        config: &ScanConfiguration,
        settings: PoolSettings,
        shutdown: &ShutdownSignal,
    ) -> ScanResult<Self> {
        let mut pool = Self::new(settings);
        pool.login_all(connector, config, shutdown).await?;
        Ok(pool)
    }

    /// An empty pool in `Initializing`; it runs no pass until [`Self::login_all`] succeeds.
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            sessions: Vec::new(),
            settings: Arc::new(settings),
            state: PoolState::Initializing,
        }
    }

    /// Creates one session per configured user and moves the pool to `Running`.
    ///
    /// # Errors
    /// * `ScanError::Configuration` when the pool is past `Initializing`
    /// * the first login error; the pool stays in `Initializing`
    pub async fn login_all(
        &mut self,
        connector: &dyn ServiceConnector,
        config: &ScanConfiguration,
        shutdown: &ShutdownSignal,
    ) -> ScanResult<()> {
        if self.state != PoolState::Initializing {
            return Err(ScanError::Configuration(ConfigurationError::InvalidSetting(format!(
                "cannot log a pool in while it is {:?}",
                self.state
            ))));
        }
        info!("🔌 Initializing worker pool with {} user(s)", config.users.len());

        let settings = Arc::clone(&self.settings);
        let logins = config.users.iter().map(|credentials| {
            let settings = settings.as_ref();
            async move {
                let session = login_with_retry(
                    connector,
                    config.provider_for(credentials),
                    credentials,
                    settings,
                    shutdown,
                )
                .await?;
                Ok::<_, ScanError>(PooledSession {
                    id: Uuid::new_v4(),
                    username: credentials.username.clone(),
                    session,
                })
            }
        });

        let mut sessions = Vec::with_capacity(config.users.len());
        let mut first_error = None;
        for result in join_all(logins).await {
            match result {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            for pooled in sessions.iter_mut() {
                pooled.session.close().await;
            }
            return Err(e);
        }

        info!("✅ Worker pool running with {} session(s)", sessions.len());
        self.sessions = sessions;
        self.state = PoolState::Running;
        Ok(())
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drains `items` with every session and returns how the pass went.
    ///
    /// Per-item failures never escape: they are retried, counted and
    /// logged. The pass ends early only when `shutdown` fires.
    pub async fn run_pass(
        &mut self,
        pass: u32,
        items: Vec<WorkItem>,
        sink: mpsc::Sender<Vec<EntityObservation>>,
        shutdown: &ShutdownSignal,
    ) -> PassReport {
        let started = Instant::now();
        let run = Arc::new(RunState::new(items));

        if self.state != PoolState::Running || self.sessions.is_empty() {
            warn!("Pass {} skipped: pool is {:?} with {} session(s)", pass + 1, self.state, self.sessions.len());
            return run.report(pass, shutdown.is_triggered(), started.elapsed());
        }

        info!("🗺️ Pass {} started: {} points across {} session(s)", pass + 1, run.total, self.sessions.len());

        let mut workers: FuturesUnordered<_> = self
            .sessions
            .drain(..)
            .map(|worker| {
                let id = worker.id;
                let handle = tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&run),
                    Arc::clone(&self.settings),
                    sink.clone(),
                    shutdown.clone(),
                ));
                async move { (id, handle.await) }
            })
            .collect();
        drop(sink);

        while let Some((id, outcome)) = workers.next().await {
            match outcome {
                Ok(worker) => self.sessions.push(worker),
                Err(e) => {
                    error!("Worker {} ended abnormally, its session is lost: {}", id, e);
                    run.recover(id, self.settings.max_attempts);
                }
            }
        }
        if self.sessions.is_empty() && !run.is_done() {
            error!("Pass {} stopped: no live sessions remain", pass + 1);
        }

        let report = run.report(pass, shutdown.is_triggered() && !run.is_done(), started.elapsed());
        info!("🏁 {}", report);
        report
    }

    /// Releases every session. The pool accepts no further passes.
    pub async fn close(&mut self) {
        if self.state == PoolState::Done {
            return;
        }
        self.state = PoolState::Draining;
        info!("🧹 Closing {} session(s)", self.sessions.len());
        for pooled in self.sessions.iter_mut() {
            pooled.session.close().await;
            debug!("Session {} ({}) closed", pooled.id, pooled.username);
        }
        self.sessions.clear();
        self.state = PoolState::Done;
    }
}

/// Body of one session's task. Hands the session back when the pass ends.
async fn worker_loop(
    mut worker: PooledSession,
    run: Arc<RunState>,
    settings: Arc<PoolSettings>,
    sink: mpsc::Sender<Vec<EntityObservation>>,
    mut shutdown: ShutdownSignal,
) -> PooledSession {
    debug!("Worker {} ({}) started", worker.id, worker.username);

    loop {
        if shutdown.is_triggered() || run.is_done() {
            break;
        }
        let Some(item) = run.queue.pop() else {
            // Items held by other workers may still come back.
            if !shutdown.sleep(settings.idle_poll).await {
                break;
            }
            continue;
        };

        let attempt = run.begin(worker.id, &item);
        debug!("Worker {} querying {} (attempt {})", worker.id, item.point, attempt);

        match client::execute(worker.session.as_mut(), &item.query()).await {
            Ok(raw) => match merger::extract(&raw, settings.appearance_duration) {
                Ok(extraction) => {
                    if !extraction.observations.is_empty() && sink.send(extraction.observations).await.is_err() {
                        warn!("Observation sink closed; results for {} dropped", item.point);
                    }
                    run.complete(item.index);
                }
                Err(e) => {
                    run.malformed.fetch_add(1, Ordering::SeqCst);
                    match settings.malformed_policy {
                        MalformedPolicy::Skip => {
                            warn!("Worker {}: malformed response at {}, skipping: {}", worker.id, item.point, e);
                            run.complete(item.index);
                        }
                        MalformedPolicy::Requeue => {
                            warn!("Worker {}: malformed response at {}, requeueing: {}", worker.id, item.point, e);
                            run.fail(item, attempt, settings.max_attempts);
                        }
                    }
                }
            },
            Err(failure) => {
                warn!(
                    "Worker {} ({}): query at {} failed (attempt {}): {}",
                    worker.id, worker.username, item.point, attempt, failure
                );
                run.fail(item, attempt, settings.max_attempts);
            }
        }
        run.release(worker.id);

        if run.is_done() {
            break;
        }
        if !shutdown.sleep(settings.throttle).await {
            break;
        }
    }

    debug!("Worker {} ({}) stopped", worker.id, worker.username);
    worker
}
