//! ComparisonCache — advisory, signature-keyed, short-TTL result store.
//!
//! The signature is a SHA-256 hash over the normalized request (sorted
//! entity list, metric set, time scope, sections), so equivalent
//! requests hit the same entry regardless of entity order. Entries are
//! immutable once written; a miss or expiry only costs latency, never
//! correctness.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use shared_types::{ComparisonRequest, SynthesisResult};

/// Deterministic signature of a normalized request.
pub fn request_signature(request: &ComparisonRequest) -> String {
    let mut entities: Vec<&str> = request.entities().iter().map(|e| e.as_str()).collect();
    entities.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(entities.join(","));
    hasher.update("|");
    for metric in request.metrics() {
        hasher.update(metric.to_string());
        hasher.update(",");
    }
    hasher.update("|");
    hasher.update(request.time_scope().to_string());
    hasher.update("|");
    for section in request.required_sections() {
        hasher.update(section.to_string());
        hasher.update(",");
    }
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    result: SynthesisResult,
    expires_at: Instant,
}

/// Concurrent-safe TTL store shared across pipeline runs.
#[derive(Default)]
pub struct ComparisonCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ComparisonCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry; expired entries are removed on the way out.
    pub fn get(&self, signature: &str) -> Option<SynthesisResult> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(signature) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.result.clone()),
            Some(_) => {
                entries.remove(signature);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, signature: String, result: SynthesisResult, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            signature,
            CacheEntry {
                result,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every expired entry. Callers may run this periodically;
    /// `get` already evicts lazily.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{
        ComparisonStatus, ComparisonTable, Confidence, EntityId, MetricKind, SectionKind,
        TimeScope,
    };

    fn request(entities: &[&str]) -> ComparisonRequest {
        ComparisonRequest::new(
            entities.iter().map(EntityId::new),
            vec![MetricKind::Revenue],
            TimeScope::Latest,
            vec![SectionKind::ManagementDiscussion],
        )
        .unwrap()
    }

    fn result() -> SynthesisResult {
        SynthesisResult {
            narrative: "narrative".to_string(),
            table: ComparisonTable::default(),
            citations: vec![],
            status: ComparisonStatus::Complete,
            missing_entities: vec![],
            verdict: None,
            confidence: Confidence::High,
            processing_time_ms: 12,
        }
    }

    #[test]
    fn signature_ignores_entity_order() {
        assert_eq!(
            request_signature(&request(&["AAPL", "MSFT"])),
            request_signature(&request(&["MSFT", "AAPL"])),
        );
    }

    #[test]
    fn signature_distinguishes_entities_and_scope() {
        assert_ne!(
            request_signature(&request(&["AAPL", "MSFT"])),
            request_signature(&request(&["AAPL", "TSLA"])),
        );
        let fy = ComparisonRequest::new(
            vec![EntityId::new("AAPL"), EntityId::new("MSFT")],
            vec![MetricKind::Revenue],
            TimeScope::FiscalYear(2023),
            vec![],
        )
        .unwrap();
        assert_ne!(
            request_signature(&request(&["AAPL", "MSFT"])),
            request_signature(&fy),
        );
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = ComparisonCache::new();
        let sig = request_signature(&request(&["AAPL", "MSFT"]));
        cache.put(sig.clone(), result(), Duration::from_secs(60));
        assert_eq!(cache.get(&sig), Some(result()));
    }

    #[test]
    fn expired_entry_is_absent_and_evicted() {
        let cache = ComparisonCache::new();
        let sig = request_signature(&request(&["AAPL", "MSFT"]));
        cache.put(sig.clone(), result(), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get(&sig), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let cache = ComparisonCache::new();
        let short = request_signature(&request(&["AAPL", "MSFT"]));
        let long = request_signature(&request(&["AAPL", "TSLA"]));
        cache.put(short, result(), Duration::from_millis(5));
        cache.put(long.clone(), result(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(15));
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&long).is_some());
    }
}
