//! cadence-core: the adaptive scheduling engine.
//!
//! The cycle runner discovers due jobs and fans them out to per-job
//! pipelines; each pipeline leases its job, asks the planner which
//! endpoints to call, drives them through the strategy runner and retry
//! policy, summarizes the outcome, and asks the scheduler when the job
//! should next run.

pub mod agent;
pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod optimizer;
pub mod pipeline;
pub mod retry;
pub mod state;
pub mod strategy;

pub use config::EngineConfig;
pub use engine::{Engine, ProcessingError, ProcessingResult};
pub use events::{EngineEvent, EventSink, NullSink, TracingSink};
pub use pipeline::{FailureCode, JobFailure, JobOutcome, JobPipeline};
pub use state::{EngineSnapshot, EngineStatus};
