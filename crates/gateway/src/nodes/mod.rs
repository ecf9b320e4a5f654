//! Node protocol plumbing — the WebSocket-connected "node" processes that
//! execute OS-native tools (e.g. `sa-node-macos`) on the gateway's behalf.

pub mod registry;
pub mod router;
pub mod ws;

pub use registry::NodeRegistry;
pub use router::ToolRouter;
