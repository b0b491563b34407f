//! Client side: session management, state stream, rate-limited stats and
//! the dashboard model built on top of them.

pub mod cache;
pub mod connection;
pub mod dashboard;
pub mod manager;
pub mod transport;

pub use cache::{StatsCache, StatsSource};
pub use connection::{ConnectionEvent, ConnectionGraph, ConnectionState};
pub use dashboard::{Dashboard, DashboardState, TransactionStart};
pub use manager::ConnectionManager;
pub use transport::{Session, SessionEnd, SessionEndCallback, SessionEndSlot, Transport, UnixSession, UnixTransport};
