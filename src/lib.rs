pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod snapshot;
pub mod time;

// Re-export the types most callers need
pub use client::{ConnectionManager, ConnectionState, StatsCache, UnixTransport};
pub use error::{AuthError, ClientError, TransportError};
pub use server::{TelemetryService, TrustValidator};
pub use snapshot::CounterSnapshot;
