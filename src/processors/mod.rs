//! Session processing: tool invocation, the stage pipeline and batch runs.

pub mod batch;
pub mod invoker;
pub mod pipeline;

// Re-export key types for convenience
pub use batch::{BatchMode, BatchRunner};
pub use invoker::{ProcessInvoker, ToolError, ToolInvocation, ToolInvoker, ToolKind, ToolStatus};
pub use pipeline::{PlannedStage, SessionPipeline};
