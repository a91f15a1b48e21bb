pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod query;
pub mod runtime;
pub mod session;
pub mod telemetry;
pub mod transport;


pub use auth::{AuthChange, AuthChanges, CredentialProvider, InMemoryCredentialProvider};
pub use config::ClientSettings;
pub use credentials::{Clock, CredentialBundle, ManualClock, SystemClock};
pub use error::{AuthError, ConfigError, QueryError};
pub use frame::{EventKind, FrameParser, StreamEvent};
pub use heartbeat::{BackoffPolicy, HeartbeatConfig, HeartbeatController, HeartbeatStatus};
pub use query::{
    AbortHandle, QueryHandle, QueryHandlers, QueryOutcome, QuerySummary, StreamingQueryClient,
};
pub use runtime::SessionRuntime;
pub use session::{SessionContext, SessionState, SessionStateMachine, TransitionSubscription};
pub use transport::{HttpTransport, QueryRequest, QueryTransport, ReplayTransport};
