//! Orchestration: routing, specialist fan-out, the judge loop and the
//! request workflow tying them together.

pub mod judge;
pub mod router;
pub mod specialists;
pub mod workflow;

pub use workflow::{Workflow, WorkflowTools};
