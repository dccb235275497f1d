//! Queue/Scheduler.
//!
//! FIFO admission over a bounded `jobsMaxConcurrent` semaphore. Jobs wait in
//! a plain `VecDeque` until a permit frees up, at which point the pipeline
//! coordinator is handed the job id, a held permit, and a fresh
//! cancellation token: claim-lock-plus-semaphore admission, simplified to
//! "pop the front of a single FIFO queue".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use coderunner_core::types::Id;

/// A job admitted past the concurrency gate: its id, the permit keeping it
/// counted against `jobsMaxConcurrent` until dropped, and the token the
/// executor runner watches for cooperative cancellation.
pub struct Admission {
    pub job_id: Id,
    pub permit: OwnedSemaphorePermit,
    pub cancel: CancellationToken,
}

pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    queue: Mutex<VecDeque<Id>>,
    notify: Notify,
    /// Cancellation tokens for jobs currently admitted (past the queue, in
    /// an active pipeline stage) - `cancel` signals through here rather
    /// than mutating job state directly, since only the pipeline driving
    /// the job knows how to tear down cleanly.
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Scheduler {
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1) as usize)),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// `enqueue(jobId)`. Appends to the tail; FIFO order is preserved
    /// regardless of arrival concurrency since the queue itself is behind a
    /// single mutex.
    pub async fn enqueue(&self, job_id: Id) {
        let mut queue = self.queue.lock().await;
        queue.push_back(job_id);
        self.notify.notify_one();
    }

    /// 1-based position of each still-queued job, front-to-back, for the
    /// `queue_position` field on `GET /jobs/{id}`.
    pub async fn queue_positions(&self) -> HashMap<String, u32> {
        let queue = self.queue.lock().await;
        queue
            .iter()
            .enumerate()
            .map(|(i, id)| (id.0.clone(), i as u32 + 1))
            .collect()
    }

    /// Block until a concurrency permit is free and a job is waiting, then
    /// return both together. The permit must be held by the caller for the
    /// job's entire run and dropped only at teardown.
    pub async fn admit(&self) -> Admission {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("scheduler semaphore is never closed");
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(job_id) = queue.pop_front() {
                    let cancel = CancellationToken::new();
                    self.active.lock().await.insert(job_id.0.clone(), cancel.clone());
                    info!(job_id = %job_id, "job admitted past concurrency gate");
                    return Admission { job_id, permit, cancel };
                }
            }
            self.notify.notified().await;
        }
    }

    /// Called by the pipeline coordinator once a job reaches a terminal
    /// state, so `cancel` on an already-finished job is a no-op rather than
    /// signaling a stale token.
    pub async fn release(&self, job_id: &Id) {
        self.active.lock().await.remove(&job_id.0);
    }

    /// `cancel(jobId)`. If the job is still queued it is removed outright
    /// and the caller is responsible for marking it `cancelled`; if it is
    /// already admitted, its cancellation token fires and the pipeline
    /// coordinator drives the teardown.
    pub async fn cancel(&self, job_id: &Id) -> CancelOutcome {
        {
            let mut queue = self.queue.lock().await;
            if let Some(pos) = queue.iter().position(|id| id == job_id) {
                queue.remove(pos);
                return CancelOutcome::RemovedFromQueue;
            }
        }
        if let Some(token) = self.active.lock().await.get(&job_id.0) {
            token.cancel();
            return CancelOutcome::SignaledRunning;
        }
        CancelOutcome::NotFound
    }

    /// Restore the FIFO order of still-`queued` jobs after a restart. Must
    /// be called once, before the admission loop starts.
    pub async fn reconcile(&self, queued_job_ids: Vec<Id>) {
        let mut queue = self.queue.lock().await;
        queue.clear();
        queue.extend(queued_job_ids);
        self.notify.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    RemovedFromQueue,
    SignaledRunning,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_admit_preserves_fifo_order() {
        let scheduler = Scheduler::new(2);
        let first = Id::new();
        let second = Id::new();
        scheduler.enqueue(first.clone()).await;
        scheduler.enqueue(second.clone()).await;

        let admitted_first = scheduler.admit().await;
        let admitted_second = scheduler.admit().await;
        assert_eq!(admitted_first.job_id, first);
        assert_eq!(admitted_second.job_id, second);
    }

    #[tokio::test]
    async fn admit_blocks_until_permit_released() {
        let scheduler = Arc::new(Scheduler::new(1));
        let first = Id::new();
        let second = Id::new();
        scheduler.enqueue(first.clone()).await;
        scheduler.enqueue(second.clone()).await;

        let admitted_first = scheduler.admit().await;

        let scheduler_clone = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { scheduler_clone.admit().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(admitted_first.permit);
        let admitted_second = handle.await.unwrap();
        assert_eq!(admitted_second.job_id, second);
    }

    #[tokio::test]
    async fn cancel_removes_queued_job_without_signaling() {
        let scheduler = Scheduler::new(1);
        let job_id = Id::new();
        scheduler.enqueue(job_id.clone()).await;
        let outcome = scheduler.cancel(&job_id).await;
        assert_eq!(outcome, CancelOutcome::RemovedFromQueue);
        assert!(scheduler.queue_positions().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_signals_active_job_token() {
        let scheduler = Scheduler::new(1);
        let job_id = Id::new();
        scheduler.enqueue(job_id.clone()).await;
        let admission = scheduler.admit().await;
        let outcome = scheduler.cancel(&job_id).await;
        assert_eq!(outcome, CancelOutcome::SignaledRunning);
        assert!(admission.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn reconcile_restores_fifo_order() {
        let scheduler = Scheduler::new(1);
        let first = Id::new();
        let second = Id::new();
        scheduler.reconcile(vec![first.clone(), second.clone()]).await;
        let positions = scheduler.queue_positions().await;
        assert_eq!(positions.get(&first.0), Some(&1));
        assert_eq!(positions.get(&second.0), Some(&2));
    }
}
