//! Scheduler façade contract for the cadence engine.
//!
//! Domain entities, the [`SchedulerApi`] persistence trait the engine is
//! written against, the transient/fatal error taxonomy, and the production
//! HTTP adapter over the external REST service.

pub mod client;
pub mod error;
pub mod models;

pub use client::{HttpSchedulerApi, SchedulerApi};
pub use error::{ApiError, ApiResult};
pub use models::*;
