// tidepool-core: Live-query reconciliation between the RPC channel and consumers.

pub mod config;
pub mod document;
pub mod emitter;
pub mod error;
pub mod live;
pub mod model;
pub mod query;
pub mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{AuthCredentials, DEFAULT_NAMESPACE, SessionConfig};
pub use document::Document;
pub use emitter::{ListenerId, Registration, Subscription};
pub use error::CoreError;
pub use live::{
    Handle, LiveEvent, LiveEventKind, LiveQuery, LiveQueryRegistry, LiveResult, Mutation,
    MutationKind, Phase, ResultStream, ResultWatchStream,
};
pub use model::Model;
pub use query::{
    MethodClassification, QueryBuilder, QueryCall, QueryDescriptor, QueryError, QueryMethod,
    QueryShape,
};
pub use session::{ConnectionState, Lifecycle, Session, User};
