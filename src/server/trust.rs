//! Caller authorization with a time-bounded trust cache.
//!
//! A caller must hold the named capability AND belong to the same trust
//! domain as the daemon. A successful full check is remembered for the TTL
//! so repeated calls skip the expensive provider round trip.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::time::{Clock, Millis};

pub const DEFAULT_TRUST_TTL_MS: u64 = 30_000;

/// The process on the other end of a call, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Numeric principal id; the trust-cache key.
    pub uid: u32,
    pub pid: Option<i32>,
}

impl CallerIdentity {
    pub fn new(uid: u32) -> Self {
        Self { uid, pid: None }
    }
}

/// The identity the daemon itself runs under. Callers must match it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustDomain {
    pub uid: u32,
}

impl TrustDomain {
    pub fn new(uid: u32) -> Self {
        Self { uid }
    }

    /// Domain of whoever owns `path`. The daemon calls this on its own
    /// freshly bound socket file.
    #[cfg(unix)]
    pub fn from_path_owner(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path)?;
        Ok(Self { uid: meta.uid() })
    }
}

/// The two independent predicates behind a full validation.
pub trait CapabilityProvider: Send + Sync {
    fn has_capability(&self, caller: &CallerIdentity, capability: &str) -> bool;
    fn identities_match(&self, caller: &CallerIdentity, domain: &TrustDomain) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustRecord {
    pub caller: u32,
    pub approved_at_ms: Millis,
}

pub struct TrustValidator {
    provider: Arc<dyn CapabilityProvider>,
    clock: Arc<dyn Clock>,
    capability: String,
    domain: TrustDomain,
    ttl_ms: u64,
    records: Mutex<HashMap<u32, TrustRecord>>,
}

impl TrustValidator {
    pub fn new(
        provider: Arc<dyn CapabilityProvider>,
        clock: Arc<dyn Clock>,
        capability: impl Into<String>,
        domain: TrustDomain,
        ttl_ms: u64,
    ) -> Self {
        Self {
            provider,
            clock,
            capability: capability.into(),
            domain,
            ttl_ms,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<u32, TrustRecord>> {
        // A panic while holding the map cannot leave a half-written record.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn authorize(&self, caller: &CallerIdentity) -> Result<(), AuthError> {
        // 1. Cache (lock covers the lookup only)
        let now = self.clock.now_ms();
        {
            let records = self.records();
            if let Some(record) = records.get(&caller.uid) {
                if now.saturating_sub(record.approved_at_ms) < self.ttl_ms {
                    return Ok(());
                }
            }
        }

        // 2. Full validation, outside the lock
        debug!(uid = caller.uid, pid = ?caller.pid, "performing full trust validation");
        if !self.provider.has_capability(caller, &self.capability) {
            warn!(
                uid = caller.uid,
                pid = ?caller.pid,
                capability = %self.capability,
                "access denied: missing capability"
            );
            return Err(AuthError::PermissionDenied);
        }
        if !self.provider.identities_match(caller, &self.domain) {
            warn!(
                uid = caller.uid,
                pid = ?caller.pid,
                domain = self.domain.uid,
                "access denied: identity mismatch"
            );
            return Err(AuthError::IdentityMismatch);
        }

        // 3. Record approval and sweep expired entries in one critical section
        let approved_at_ms = self.clock.now_ms();
        let ttl = self.ttl_ms;
        let mut records = self.records();
        records.insert(
            caller.uid,
            TrustRecord {
                caller: caller.uid,
                approved_at_ms,
            },
        );
        records.retain(|_, r| approved_at_ms.saturating_sub(r.approved_at_ms) <= ttl);
        debug!(uid = caller.uid, cached = records.len(), "trust validation passed and cached");
        Ok(())
    }

    pub fn record_for(&self, uid: u32) -> Option<TrustRecord> {
        self.records().get(&uid).copied()
    }

    pub fn cached_callers(&self) -> usize {
        self.records().len()
    }

    pub fn clear(&self) {
        self.records().clear();
    }
}
