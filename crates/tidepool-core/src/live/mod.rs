// ── Live queries ──
//
// Reconciler state machine, per-model registry, and the reactive result
// stream handed to consumers.

mod query;
mod registry;
mod result;
mod stream;

pub use query::{LiveEvent, LiveEventKind, LiveQuery, Phase};
pub use registry::{Handle, LiveQueryRegistry};
pub use result::{LiveResult, Mutation, MutationKind};
pub use stream::{ResultStream, ResultWatchStream};
