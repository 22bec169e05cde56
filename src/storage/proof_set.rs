//! Proof-set resolution
//!
//! Picks the provider the client already stores the most data with. Among the
//! proof sets matching the CDN preference the one with the highest root count wins;
//! ties keep the first one encountered. Results are cached per (address, network)
//! for a bounded freshness window.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{truncate_address, Network, StorageSession};
use crate::error::{Error, Result};

/// A storage commitment between the client and one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofSet {
    pub pdp_verifier_proof_set_id: u64,
    /// Address of the provider receiving payments for this proof set
    pub payee: String,
    pub current_root_count: u64,
    #[serde(rename = "withCDN")]
    pub with_cdn: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedProofSet {
    pub provider_id: u64,
    pub proof_set: ProofSet,
}

/// Select the proof set with the most roots among those matching `with_cdn`
pub fn select_best_proof_set(proof_sets: &[ProofSet], with_cdn: bool) -> Option<&ProofSet> {
    proof_sets
        .iter()
        .filter(|p| p.with_cdn == with_cdn)
        .fold(None, |best: Option<&ProofSet>, candidate| match best {
            Some(b) if candidate.current_root_count <= b.current_root_count => Some(b),
            _ => Some(candidate),
        })
}

type CacheKey = (String, Network);

/// Resolves and caches the provider bound to an account's best proof set
pub struct ProofSetResolver {
    with_cdn: bool,
    ttl: Duration,
    cache: Mutex<LruCache<CacheKey, (Instant, ResolvedProofSet)>>,
}

impl ProofSetResolver {
    pub fn new(with_cdn: bool, ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            with_cdn,
            ttl,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn with_cdn(&self) -> bool {
        self.with_cdn
    }

    /// Resolve the best proof set for `address`, using the cache while it is fresh
    #[instrument(skip(self, session), fields(address = %truncate_address(address), network = %network))]
    pub async fn resolve(
        &self,
        session: &dyn StorageSession,
        network: Network,
        address: &str,
    ) -> Result<ResolvedProofSet> {
        let key = (address.to_ascii_lowercase(), network);

        if let Some(hit) = self.cached(&key) {
            debug!("Using cached proof set {}", hit.proof_set.pdp_verifier_proof_set_id);
            return Ok(hit);
        }

        let proof_sets = session.client_proof_sets(address).await?;
        let best = select_best_proof_set(&proof_sets, self.with_cdn)
            .cloned()
            .ok_or_else(|| Error::NoProofSetFoundError {
                address: address.to_string(),
                network: network.to_string(),
                with_cdn: self.with_cdn,
            })?;

        let provider_id = session.provider_id_by_address(&best.payee).await?;
        info!(
            "Resolved proof set {} with {} roots on provider {}",
            best.pdp_verifier_proof_set_id, best.current_root_count, provider_id
        );

        let resolved = ResolvedProofSet {
            provider_id,
            proof_set: best,
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, (Instant::now(), resolved.clone()));
        }
        Ok(resolved)
    }

    /// Drop every cached resolution, e.g. after the wallet disconnects
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn cached(&self, key: &CacheKey) -> Option<ResolvedProofSet> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(key) {
            Some((at, resolved)) if at.elapsed() < self.ttl => Some(resolved.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }
}
