//! Re-exports the domain-level event envelope. Kept as its own module (mirroring
//! the event-type-specific modules around it) so projections can `use
//! crate::events::envelope::*` without reaching into `sa_domain` directly.

pub use sa_domain::orchestration::{EventVisibility, WorkflowEventEnvelope};
pub use sa_domain::orchestration::event_types;
