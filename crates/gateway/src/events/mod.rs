//! Event Bus (E) and Projections (P) — §4.7.
//!
//! Every domain event the orchestration core produces flows through
//! [`bus::EventBus`] on its way to the five projections in
//! [`projections`]. Nothing outside this module should write to
//! `ConversationState`, the markdown log, or the audit log directly.

pub mod bus;
pub mod envelope;
pub mod projections;

pub use bus::{EventBus, Projection};
pub use envelope::{EventVisibility, WorkflowEventEnvelope};
