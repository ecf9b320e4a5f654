//! Context pack assembly for SerialAgent.
//!
//! Builds the system-prompt context block from workspace files, the skills
//! index, and user facts, honoring per-file and total character budgets.

pub mod builder;
pub mod injection;
pub mod report;
pub mod truncation;

pub use builder::{ContextPackBuilder, SessionMode, WorkspaceFile};
pub use report::{ContextReport, FileReport};
