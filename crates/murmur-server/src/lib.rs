//! WebSocket gateway for the speech relay.
//!
//! Clients authenticate with `front-auth`, then send `front-tts` requests and
//! receive framed PCM followed by `backend-end`. Each connection owns at most
//! one provider socket, opened on its first request and reused afterwards.

pub mod admission;
pub mod auth;
pub mod codec;
pub mod connection;
pub mod gateway;
pub mod health;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use admission::AdmissionController;
pub use auth::{Claims, JwtVerifier, StaticVerifier};
pub use codec::{ClientMessage, ServerMessage};
pub use connection::{ClientConnection, Correlation};
pub use gateway::Gateway;
pub use health::HealthResponse;
pub use registry::ConnectionRegistry;
pub use server::{build_router, driver_config, start, AppState, ServerConfig, ServerHandle};
pub use supervisor::{spawn_supervisor, sweep, Expiry, TimeoutPolicy};
