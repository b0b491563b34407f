use std::collections::HashSet;

use crate::config::ServiceConfig;

use super::trust::{CallerIdentity, CapabilityProvider, TrustDomain};

/// Capability/identity policy over Unix peer credentials.
///
/// Capability: the caller uid is on the grant list (or every local uid is
/// granted). Identity: the caller runs under the daemon's own uid.
#[derive(Debug, Clone, Default)]
pub struct PeerCredentialPolicy {
    granted: HashSet<u32>,
    grant_all_local: bool,
}

impl PeerCredentialPolicy {
    pub fn new(granted: impl IntoIterator<Item = u32>, grant_all_local: bool) -> Self {
        Self {
            granted: granted.into_iter().collect(),
            grant_all_local,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.granted_uids.iter().copied(), config.grant_all_local)
    }

    pub fn grant(&mut self, uid: u32) {
        self.granted.insert(uid);
    }
}

impl CapabilityProvider for PeerCredentialPolicy {
    fn has_capability(&self, caller: &CallerIdentity, _capability: &str) -> bool {
        self.grant_all_local || self.granted.contains(&caller.uid)
    }

    fn identities_match(&self, caller: &CallerIdentity, domain: &TrustDomain) -> bool {
        caller.uid == domain.uid
    }
}
