//! The in-memory mirror: arena-backed nodes, per-root reconciliation, and
//! the facade that routes path-addressed operations across roots and fans
//! change events out to subscribers.

mod mirror;
mod node;
mod reporter;
mod root;

pub use mirror::Mirror;
pub use reporter::{MirrorError, Reporter, Update, UpdateKind};
pub use root::RootNode;
