//! Job handler abstractions
//!
//! Handlers are the per-job-type code that workers run. They:
//! - Are looked up by `job_type` in a [`HandlerRegistry`]
//! - May fail, in which case the job is rescheduled with backoff
//! - Can observe a stop request through their [`JobContext`]

mod context;
mod definition;
mod registry;

pub use context::JobContext;
pub use definition::{handler_fn, FnHandler, JobError, JobHandler};
pub use registry::{HandlerRegistry, RegistryError};
