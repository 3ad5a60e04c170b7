// Public modules
pub mod cancel;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod defaults;
pub mod error;
pub mod executor;
pub mod health;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod rollback;
pub mod ssh;
pub mod step;
pub mod target;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types for convenience
pub use cancel::CancelToken;
pub use error::{Error, ErrorCode, Result};
pub use orchestrator::Orchestrator;
pub use pipeline::Pipeline;
pub use report::{RunPlan, RunReport, RunStatus};
pub use target::Target;
