pub mod errors;
pub mod identity;
pub mod ids;
pub mod security;

pub use errors::RelayError;
pub use identity::{AuthError, Identity, TokenVerifier};
pub use ids::{ConnectionId, SessionId};
pub use security::UpstreamCredentials;
