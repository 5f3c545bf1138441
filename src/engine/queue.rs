use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::assignment::Dispatcher;
use crate::error::AppError;
use crate::observability::metrics::Metrics;

/// Auto-assignment request for one order, raised by a completed payment.
#[derive(Debug, Clone, Copy)]
pub struct DispatchJob {
    pub order_id: Uuid,
    pub submitted_at: Instant,
}

#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchJob>,
    metrics: Metrics,
}

impl DispatchQueue {
    pub fn new(size: usize, metrics: Metrics) -> (Self, mpsc::Receiver<DispatchJob>) {
        let (tx, rx) = mpsc::channel(size);
        (Self { tx, metrics }, rx)
    }

    /// Never waits for capacity. A full or closed queue is reported to the caller, which
    /// decides whether that matters.
    pub fn submit(&self, order_id: Uuid) -> Result<(), AppError> {
        let job = DispatchJob {
            order_id,
            submitted_at: Instant::now(),
        };

        match self.tx.try_send(job) {
            Ok(()) => {
                self.metrics.dispatch_queue_depth.inc();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics
                    .dispatch_jobs_total
                    .with_label_values(&["queue_full"])
                    .inc();
                warn!(order_id = %order_id, "dispatch queue full; auto-assignment dropped");
                Err(AppError::Internal("dispatch queue is full".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(AppError::Internal("dispatch queue is closed".to_string()))
            }
        }
    }
}

/// Pulls jobs off the queue and runs each as its own task under `job_timeout`.
///
/// Returns once the queue is closed and every running job has finished, or as soon as
/// `shutdown` fires, in which case running jobs are aborted.
pub async fn run_dispatch_worker(
    dispatcher: Arc<Dispatcher>,
    metrics: Metrics,
    mut job_rx: mpsc::Receiver<DispatchJob>,
    job_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(timeout_secs = job_timeout.as_secs(), "dispatch worker started");
    let mut jobs = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                warn!(in_flight = jobs.len(), "dispatch worker shutting down; aborting running jobs");
                jobs.abort_all();
                break;
            }
            received = job_rx.recv() => match received {
                Some(job) => {
                    metrics.dispatch_queue_depth.dec();
                    metrics.dispatch_jobs_in_flight.inc();
                    jobs.spawn(run_job(dispatcher.clone(), metrics.clone(), job, job_timeout));
                }
                None => {
                    info!(in_flight = jobs.len(), "dispatch queue closed; draining running jobs");
                    break;
                }
            },
            Some(finished) = jobs.join_next(), if !jobs.is_empty() => {
                reap(&metrics, finished);
            }
        }
    }

    while let Some(finished) = jobs.join_next().await {
        reap(&metrics, finished);
    }
    warn!("dispatch worker stopped");
}

async fn run_job(dispatcher: Arc<Dispatcher>, metrics: Metrics, job: DispatchJob, job_timeout: Duration) {
    let waited_ms = job.submitted_at.elapsed().as_millis() as u64;

    match tokio::time::timeout(job_timeout, dispatcher.auto_assign_after_payment(job.order_id)).await {
        Ok(Ok(outcome)) => {
            metrics
                .dispatch_jobs_total
                .with_label_values(&[outcome.label()])
                .inc();
            info!(
                order_id = %job.order_id,
                outcome = outcome.label(),
                waited_ms,
                "auto-assignment finished"
            );
        }
        Ok(Err(err)) => {
            metrics.dispatch_jobs_total.with_label_values(&["failed"]).inc();
            error!(order_id = %job.order_id, error = %err, "auto-assignment failed");
        }
        Err(_) => {
            metrics
                .dispatch_jobs_total
                .with_label_values(&["timed_out"])
                .inc();
            warn!(
                order_id = %job.order_id,
                timeout_secs = job_timeout.as_secs(),
                "auto-assignment timed out"
            );
        }
    }
}

fn reap(metrics: &Metrics, finished: Result<(), JoinError>) {
    metrics.dispatch_jobs_in_flight.dec();
    match finished {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => {
            metrics.dispatch_jobs_total.with_label_values(&["aborted"]).inc();
        }
        Err(err) => {
            metrics.dispatch_jobs_total.with_label_values(&["panicked"]).inc();
            error!(error = %err, "auto-assignment task panicked");
        }
    }
}
