//! Client side of the token lifecycle: holds a session's credentials and
//! keeps them fresh for any number of concurrent callers.

pub mod coordinator;
pub mod gateway;
pub mod manager;
pub mod upstream;

pub use coordinator::{RefreshConfig, RefreshCoordinator, SessionEvent, SessionPhase};
pub use gateway::{ApiRequest, ApiResponse, AuthGateway, HttpTransport, Transport};
pub use manager::{ClientState, SessionManager};
pub use upstream::{AuthUpstream, Credentials, HttpUpstream, LocalUpstream};
