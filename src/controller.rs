use std::time::Duration;

use tracing::info;

use crate::config::JobConfig;
use crate::error::WorkerError;
use crate::job::Job;
use crate::jobs;
use crate::worker::{Worker, WorkerStatus};

/// Index of a worker inside its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Owns every worker of the process.
#[derive(Debug, Default)]
pub struct Controller {
    workers: Vec<Worker>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `job` and start a reclamation worker for it. Nothing is
    /// started if the configuration is invalid.
    pub fn register_worker(&mut self, job: JobConfig) -> Result<WorkerId, WorkerError> {
        let interval = job.sleep;
        let reclaimer = jobs::build_reclaimer(job)?;
        self.spawn_job(Box::new(reclaimer), interval)
    }

    /// Start any job kind on its own worker.
    pub fn spawn_job(
        &mut self,
        job: Box<dyn Job>,
        interval: Duration,
    ) -> Result<WorkerId, WorkerError> {
        let worker = Worker::spawn(job, interval)?;
        info!(worker = %worker.name(), "registered worker");
        self.workers.push(worker);
        Ok(WorkerId(self.workers.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn worker(&self, id: WorkerId) -> Result<&Worker, WorkerError> {
        self.workers
            .get(id.0)
            .ok_or(WorkerError::UnknownWorker(id.0))
    }

    pub fn name(&self, id: WorkerId) -> Result<&str, WorkerError> {
        Ok(self.worker(id)?.name())
    }

    pub fn status(&self, id: WorkerId) -> Result<WorkerStatus, WorkerError> {
        Ok(self.worker(id)?.status())
    }

    pub fn pause(&self, id: WorkerId) -> Result<(), WorkerError> {
        self.worker(id)?.pause();
        Ok(())
    }

    pub fn resume(&self, id: WorkerId) -> Result<(), WorkerError> {
        self.worker(id)?.resume();
        Ok(())
    }

    pub fn wake(&self, id: WorkerId) -> Result<(), WorkerError> {
        self.worker(id)?.wake();
        Ok(())
    }

    pub fn kill(&mut self, id: WorkerId) -> Result<(), WorkerError> {
        self.workers
            .get_mut(id.0)
            .ok_or(WorkerError::UnknownWorker(id.0))?
            .kill();
        Ok(())
    }

    pub fn wake_all(&self) {
        for worker in &self.workers {
            worker.wake();
        }
    }

    /// Ask every worker to stop and wait until each reports closed.
    pub fn kill_all(&self) {
        for worker in &self.workers {
            worker.request_kill();
        }
        for worker in &self.workers {
            worker.wait_closed();
        }
    }

    pub fn join_all(&mut self) {
        for worker in &mut self.workers {
            worker.join();
        }
        info!(workers = self.workers.len(), "all workers joined");
    }

    /// Status of every worker in registration order.
    pub fn statuses(&self) -> Vec<(String, WorkerStatus)> {
        self.workers
            .iter()
            .map(|w| (w.name().to_string(), w.status()))
            .collect()
    }
}
