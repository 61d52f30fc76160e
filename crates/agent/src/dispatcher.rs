//! Serializes turns per user.
//!
//! Each user id gets a worker task fed by its own queue, so two messages from the same user
//! are routed strictly one after the other in arrival order while different users proceed in
//! parallel. Idle workers retire after `idle_timeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use relaydesk_core::domain::request::NormalizedRequest;

use crate::router::{RoutedReply, RouterError, SessionRouter};

const DEFAULT_QUEUE_DEPTH: usize = 32;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_ENQUEUE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("turn worker for user `{0}` is unavailable")]
    WorkerUnavailable(String),
}

struct TurnJob {
    request: NormalizedRequest,
    reply: oneshot::Sender<Result<RoutedReply, RouterError>>,
}

struct WorkerHandle {
    id: u64,
    sender: mpsc::Sender<TurnJob>,
}

type WorkerMap = Arc<Mutex<HashMap<String, WorkerHandle>>>;

/// A queued turn; resolves once the user's worker has routed it.
pub struct PendingTurn {
    user_id: String,
    reply: oneshot::Receiver<Result<RoutedReply, RouterError>>,
}

impl PendingTurn {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn wait(self) -> Result<RoutedReply, DispatchError> {
        match self.reply.await {
            Ok(result) => result.map_err(DispatchError::from),
            Err(_) => Err(DispatchError::WorkerUnavailable(self.user_id)),
        }
    }
}

pub struct TurnDispatcher {
    router: Arc<SessionRouter>,
    workers: WorkerMap,
    next_worker_id: AtomicU64,
    queue_depth: usize,
    idle_timeout: Duration,
}

impl TurnDispatcher {
    pub fn new(router: Arc<SessionRouter>) -> Self {
        Self {
            router,
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_worker_id: AtomicU64::new(0),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    pub fn active_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Queues the request behind any earlier turn from the same user and waits for its reply.
    pub async fn dispatch(&self, request: NormalizedRequest) -> Result<RoutedReply, DispatchError> {
        self.submit(request).await?.wait().await
    }

    /// Queues the request and returns once it holds its place in the user's queue.
    ///
    /// Callers that submit sequentially get their turns run in submission order per user,
    /// without waiting for earlier replies. A full queue holds the caller until there is room.
    pub async fn submit(&self, request: NormalizedRequest) -> Result<PendingTurn, DispatchError> {
        let user_id = request.user_id.clone();
        let mut closed_workers = 0;

        while closed_workers < MAX_ENQUEUE_ATTEMPTS {
            let (reply_tx, reply_rx) = oneshot::channel();
            let job = TurnJob { request: request.clone(), reply: reply_tx };

            // lookup and enqueue share the map lock with worker retirement
            let full = {
                let mut workers = lock(&self.workers);
                let sender = match workers.get(&user_id) {
                    Some(handle) => handle.sender.clone(),
                    None => self.start_worker(&mut workers, &user_id),
                };
                match sender.try_send(job) {
                    Ok(()) => return Ok(PendingTurn { user_id, reply: reply_rx }),
                    Err(TrySendError::Closed(_)) => {
                        workers.remove(&user_id);
                        closed_workers += 1;
                        continue;
                    }
                    Err(TrySendError::Full(_)) => sender,
                }
            };

            debug!(event_name = "dispatcher.queue.full", user_id = %user_id, "turn queue full");
            if full.reserve().await.is_err() {
                closed_workers += 1;
            }
        }

        warn!(
            event_name = "dispatcher.enqueue.failed",
            user_id = %user_id,
            attempts = MAX_ENQUEUE_ATTEMPTS,
            "no turn worker accepted the request"
        );
        Err(DispatchError::WorkerUnavailable(user_id))
    }

    /// Drops every queue handle; workers exit after draining what they already hold.
    pub fn shutdown(&self) {
        lock(&self.workers).clear();
    }

    fn start_worker(
        &self,
        workers: &mut HashMap<String, WorkerHandle>,
        user_id: &str,
    ) -> mpsc::Sender<TurnJob> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        workers.insert(user_id.to_string(), WorkerHandle { id, sender: sender.clone() });
        tokio::spawn(run_worker(
            id,
            user_id.to_string(),
            receiver,
            Arc::clone(&self.router),
            Arc::clone(&self.workers),
            self.idle_timeout,
        ));
        debug!(event_name = "dispatcher.worker.started", user_id = %user_id, "turn worker started");
        sender
    }
}

async fn run_worker(
    id: u64,
    user_id: String,
    mut receiver: mpsc::Receiver<TurnJob>,
    router: Arc<SessionRouter>,
    workers: WorkerMap,
    idle_timeout: Duration,
) {
    loop {
        match tokio::time::timeout(idle_timeout, receiver.recv()).await {
            Ok(Some(job)) => run_job(&router, &user_id, job).await,
            Ok(None) => break,
            Err(_) => match retire(&workers, &user_id, id, &mut receiver) {
                Some(job) => run_job(&router, &user_id, job).await,
                None => break,
            },
        }
    }
    debug!(event_name = "dispatcher.worker.stopped", user_id = %user_id, "turn worker stopped");
}

/// Removes the worker from the map once its queue is empty.
///
/// Runs under the map lock, so a `submit` either lands its job before the check (and the
/// job is returned) or finds no worker and starts a new one.
fn retire(
    workers: &WorkerMap,
    user_id: &str,
    worker_id: u64,
    receiver: &mut mpsc::Receiver<TurnJob>,
) -> Option<TurnJob> {
    let mut workers = lock(workers);
    if let Ok(job) = receiver.try_recv() {
        return Some(job);
    }
    if workers.get(user_id).is_some_and(|handle| handle.id == worker_id) {
        workers.remove(user_id);
    }
    receiver.close();
    None
}

async fn run_job(router: &SessionRouter, user_id: &str, job: TurnJob) {
    let result = router.handle_request(&job.request).await;
    if job.reply.send(result).is_err() {
        debug!(
            event_name = "dispatcher.reply.abandoned",
            user_id = %user_id,
            "caller stopped waiting for the turn result"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
