//! Durable jobs: the queue, the checkpointing phase runner, failure
//! classification and the worker loop that ties them together.

pub mod classify;
pub mod model;
pub mod poller;
pub mod queue;
pub mod runner;
pub mod scheduler;

pub use classify::{classify, failure_message};
pub use model::{Checkpoint, Checkpoints, ErrorKind, Job, JobStatus, JobType};
pub use poller::{JobOutcome, Poller, Processed};
pub use queue::JobQueue;
pub use runner::{Phase, PhaseContext, PhaseOutput, PhaseRunner, Pipeline, RunOutcome};
