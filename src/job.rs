use crate::error::JobError;

/// The behavior a worker drives. The worker calls `init` once, `step`
/// once per iteration until it fails or the worker is killed, and
/// `shutdown` once on the way out.
pub trait Job: Send {
    /// Short name used for the worker thread and in log events.
    fn name(&self) -> &str;

    fn init(&mut self) -> Result<(), JobError> {
        Ok(())
    }

    /// One iteration. Runs to completion; an error ends the worker's loop.
    fn step(&mut self) -> Result<(), JobError>;

    fn shutdown(&mut self) {}
}
