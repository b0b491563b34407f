//! Daemon side: trust boundary, counter state, request handling.
//!
//! Shared mutable state is limited to the counters (atomics) and the trust
//! cache (short-held mutex). Everything else is constructed once and passed
//! around behind `Arc`.

pub mod activity;
pub mod counters;
pub mod ipc;
pub mod policy;
pub mod service;
pub mod trust;

pub use activity::TransactionActivityGenerator;
pub use counters::{CounterStore, CounterValues};
pub use ipc::IpcServer;
pub use policy::PeerCredentialPolicy;
pub use service::TelemetryService;
pub use trust::{CallerIdentity, CapabilityProvider, TrustDomain, TrustRecord, TrustValidator};
