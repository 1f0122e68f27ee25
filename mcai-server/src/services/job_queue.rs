//! Background job queue
//!
//! A bounded mpsc channel feeds a single worker loop. The loop owns
//! dispatch; each job runs as a tracked task so shutdown can wait for
//! in-flight work after cancellation stops intake.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Upload an analysis to the fingerprinting service
    SubmitAnalysis(Uuid),
    /// Fetch and persist the result of a ready analysis
    FetchAnalysisResult(Uuid),
    /// Execute a cascade run
    RunCascade(Uuid),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::SubmitAnalysis(_) => "submit_analysis",
            Job::FetchAnalysisResult(_) => "fetch_analysis_result",
            Job::RunCascade(_) => "run_cascade",
        }
    }

    pub fn target(&self) -> Uuid {
        match self {
            Job::SubmitAnalysis(id) | Job::FetchAnalysisResult(id) | Job::RunCascade(id) => *id,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobQueueError {
    #[error("job queue is full")]
    Full,

    #[error("job queue is closed")]
    Closed,
}

/// Producer side of the queue
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
}

impl JobQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue, waiting for room
    pub async fn enqueue(&self, job: Job) -> Result<(), JobQueueError> {
        tracing::debug!(job = job.name(), target = %job.target(), "Enqueue job");
        self.sender.send(job).await.map_err(|_| JobQueueError::Closed)
    }

    /// Enqueue without waiting
    pub fn try_enqueue(&self, job: Job) -> Result<(), JobQueueError> {
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => JobQueueError::Full,
            mpsc::error::TrySendError::Closed(_) => JobQueueError::Closed,
        })
    }

    /// Jobs waiting to be picked up
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

/// Executes dequeued jobs
///
/// Implementations must absorb their own failures. A panicking job is
/// caught and logged by the worker; the target is left as it was.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job, cancel: CancellationToken);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub struct JobWorker {
    receiver: mpsc::Receiver<Job>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobWorker {
    pub fn new(
        receiver: mpsc::Receiver<Job>,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            handler,
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Dispatch until cancelled or every producer is gone, then drain
    /// in-flight jobs for at most `grace`
    pub async fn run(mut self, grace: Duration) {
        tracing::info!("Job worker started");

        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = self.receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let handler = Arc::clone(&self.handler);
            let cancel = self.cancel.child_token();
            self.tracker.spawn(async move {
                let started = std::time::Instant::now();
                let outcome = AssertUnwindSafe(handler.handle(job, cancel))
                    .catch_unwind()
                    .await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match outcome {
                    Ok(()) => tracing::debug!(
                        job = job.name(),
                        target = %job.target(),
                        elapsed_ms,
                        "Job finished"
                    ),
                    Err(payload) => tracing::error!(
                        job = job.name(),
                        target = %job.target(),
                        elapsed_ms,
                        panic = %panic_message(payload.as_ref()),
                        "Job panicked"
                    ),
                }
            });
        }

        self.receiver.close();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                in_flight = self.tracker.len(),
                "Job worker stopped with jobs still running"
            );
        }
        tracing::info!("Job worker stopped");
    }
}
