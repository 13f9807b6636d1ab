//! Replay-safe response cache keyed by a client-supplied idempotency key.
//!
//! The first completed request under a key is recorded at `idempotency:{key}` together with a
//! [`RequestFingerprint`] of the request that produced it. Later requests with the same key and
//! the same fingerprint get the recorded response back as a [`Replay`] without running the
//! operation again; the same key with a different fingerprint is an [`IdempotencyConflict`].
//! Records are written once with compare-and-set and never overwritten.

use crate::clock::{Clock, SystemClock};
use crate::store::{SharedStore, StoreError};
use crate::ResilienceError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime of a stored response.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Response headers that are safe to replay.
pub const DEFAULT_SAFE_HEADERS: &[&str] = &[
    "content-type",
    "content-language",
    "content-encoding",
    "cache-control",
    "etag",
    "last-modified",
    "location",
];

/// Header added to replayed responses.
pub const REPLAY_HEADER: &str = "Idempotency-Replayed";

/// The key was reused for a request other than the one that produced the stored response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("idempotency key '{key}' was already used for a different request")]
pub struct IdempotencyConflict {
    pub key: String,
}

impl<E> From<IdempotencyConflict> for ResilienceError<E> {
    fn from(conflict: IdempotencyConflict) -> Self {
        ResilienceError::IdempotencyConflict { key: conflict.key }
    }
}

/// SHA-256 over the normalized method, path, sorted query and body, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// The method is upper-cased, a trailing `/` is dropped from the path and query pairs are
    /// sorted, so equivalent requests hash the same.
    pub fn compute(method: &str, path: &str, query: &[(&str, &str)], body: &[u8]) -> Self {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        let mut pairs = query.to_vec();
        pairs.sort_unstable();

        // Every field is length-prefixed so no two distinct requests share an encoding.
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };
        field(method.to_ascii_uppercase().as_bytes());
        field(path.as_bytes());
        field(&(pairs.len() as u64).to_be_bytes());
        for (name, value) in &pairs {
            field(name.as_bytes());
            field(value.as_bytes());
        }
        field(body);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A response as it will be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: Vec::new(), body: body.into() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn retain_headers(mut self, allowed: &[String]) -> Self {
        self.headers.retain(|(name, _)| allowed.iter().any(|a| a.eq_ignore_ascii_case(name)));
        self
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// What is stored at `idempotency:{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: RequestFingerprint,
    pub response: CachedResponse,
    pub created_at_millis: u64,
    pub ttl_secs: u64,
}

/// A stored response handed back instead of re-executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    pub response: CachedResponse,
    /// When the original response was recorded.
    pub created_at_millis: u64,
}

impl Replay {
    /// Stored headers plus [`REPLAY_HEADER`].
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = self.response.headers.clone();
        headers.push((REPLAY_HEADER.to_string(), "true".to_string()));
        headers
    }
}

/// Result of [`IdempotencyStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// An identical request already recorded a response; nothing was written.
    AlreadyStored,
    /// The store was unreachable; the response was not recorded.
    Skipped,
}

/// Response cache keyed by idempotency key.
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    safe_headers: Arc<[String]>,
}

impl IdempotencyStore {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            default_ttl: DEFAULT_IDEMPOTENCY_TTL,
            safe_headers: DEFAULT_SAFE_HEADERS.iter().map(|h| h.to_string()).collect(),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Replace the header allow-list (matched case-insensitively).
    pub fn with_safe_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.safe_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn key(key: &str) -> String {
        format!("idempotency:{key}")
    }

    /// The raw record under `key`, if any. Unreadable records and store outages read as absent.
    pub async fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        match self.read(key).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(idempotency_key = key, error = %err, "idempotency store unavailable; executing without replay");
                None
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let store_key = Self::key(key);
        let Some(raw) = self.store.get(&store_key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt { key: store_key, reason: e.to_string() })
    }

    /// Replay for `key` if the stored request matches `fingerprint`.
    pub async fn check(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<Replay>, IdempotencyConflict> {
        let Some(record) = self.get(key).await else {
            return Ok(None);
        };
        if &record.fingerprint != fingerprint {
            tracing::warn!(idempotency_key = key, "idempotency key reused for a different request");
            return Err(IdempotencyConflict { key: key.to_string() });
        }
        tracing::debug!(idempotency_key = key, status = record.response.status, "replaying stored response");
        Ok(Some(Replay { response: record.response, created_at_millis: record.created_at_millis }))
    }

    /// Record `response` for `key` with the default TTL.
    pub async fn store(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
        response: CachedResponse,
    ) -> Result<StoreOutcome, IdempotencyConflict> {
        self.store_with_ttl(key, fingerprint, response, self.default_ttl).await
    }

    /// Record `response` for `key`. Only replay-safe headers are kept.
    pub async fn store_with_ttl(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<StoreOutcome, IdempotencyConflict> {
        let record = IdempotencyRecord {
            key: key.to_string(),
            fingerprint: fingerprint.clone(),
            response: response.retain_headers(&self.safe_headers),
            created_at_millis: self.clock.now_millis(),
            ttl_secs: ttl.as_secs(),
        };
        match self.write_once(key, &record, ttl).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(idempotency_key = key, error = %err, "could not record idempotent response");
                Ok(StoreOutcome::Skipped)
            }
        }
    }

    async fn write_once(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> Result<Result<StoreOutcome, IdempotencyConflict>, StoreError> {
        let store_key = Self::key(key);
        let raw = serde_json::to_string(record)
            .map_err(|e| StoreError::Corrupt { key: store_key.clone(), reason: e.to_string() })?;

        // A record that expires between the failed write and the read is written on the retry.
        for _ in 0..2 {
            if self.store.compare_and_set(&store_key, None, raw.clone(), Some(ttl)).await? {
                return Ok(Ok(StoreOutcome::Stored));
            }
            if let Some(existing) = self.read(key).await? {
                return Ok(if existing.fingerprint == record.fingerprint {
                    Ok(StoreOutcome::AlreadyStored)
                } else {
                    Err(IdempotencyConflict { key: key.to_string() })
                });
            }
        }
        Err(StoreError::Unavailable(format!("could not settle write to '{store_key}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryCounterStore;

    fn idempotency() -> (IdempotencyStore, InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::at_secs(1_000);
        let store = InMemoryCounterStore::with_clock(clock.clone());
        let idem = IdempotencyStore::new(Arc::new(store.clone())).with_clock(clock.clone());
        (idem, store, clock)
    }

    fn order() -> RequestFingerprint {
        RequestFingerprint::compute("POST", "/orders", &[], br#"{"sku":"A1","qty":2}"#)
    }

    #[test]
    fn fingerprint_normalizes_equivalent_requests() {
        let a = RequestFingerprint::compute("post", "/orders/", &[("b", "2"), ("a", "1")], b"x");
        let b = RequestFingerprint::compute("POST", "/orders", &[("a", "1"), ("b", "2")], b"x");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let other_body = RequestFingerprint::compute("POST", "/orders", &[("a", "1"), ("b", "2")], b"y");
        assert_ne!(a, other_body);
        assert_ne!(
            RequestFingerprint::compute("GET", "/", &[], b""),
            RequestFingerprint::compute("GET", "/x", &[], b"")
        );
    }

    #[test]
    fn fingerprint_fields_cannot_bleed_into_each_other() {
        let pay = |query: &[(&str, &str)], body: &[u8]| {
            RequestFingerprint::compute("POST", "/pay", query, body)
        };
        assert_ne!(pay(&[("a", "1&b=2")], b""), pay(&[("a", "1"), ("b", "2")], b""));
        assert_ne!(pay(&[("a=1", "")], b""), pay(&[("a", "=1")], b""));
        assert_ne!(pay(&[("a", "1\n")], b""), pay(&[("a", "1")], b"\n"));
        assert_ne!(
            RequestFingerprint::compute("POST", "/pay\nx", &[], b""),
            RequestFingerprint::compute("POST", "/pay", &[], b"x")
        );
    }

    #[tokio::test]
    async fn replays_stored_response_verbatim() {
        let (idem, _, _) = idempotency();
        let response = CachedResponse::new(201, br#"{"id":42}"#.to_vec())
            .with_header("Content-Type", "application/json");

        assert_eq!(idem.check("k1", &order()).await.unwrap(), None);
        assert_eq!(idem.store("k1", &order(), response.clone()).await.unwrap(), StoreOutcome::Stored);

        for _ in 0..2 {
            let replay = idem.check("k1", &order()).await.unwrap().expect("replay");
            assert_eq!(replay.response, response);
            assert_eq!(replay.created_at_millis, 1_000_000);
        }
    }

    #[tokio::test]
    async fn same_key_different_request_conflicts() {
        let (idem, _, _) = idempotency();
        idem.store("k1", &order(), CachedResponse::new(200, "ok")).await.unwrap();

        let other = RequestFingerprint::compute("POST", "/orders", &[], br#"{"sku":"B7","qty":1}"#);
        let err = idem.check("k1", &other).await.unwrap_err();
        assert_eq!(err.key, "k1");
        let err = idem.store("k1", &other, CachedResponse::new(200, "other")).await.unwrap_err();
        let err: ResilienceError<std::io::Error> = err.into();
        assert!(err.is_idempotency_conflict());
    }

    #[tokio::test]
    async fn second_identical_write_is_a_no_op() {
        let (idem, _, _) = idempotency();
        idem.store("k1", &order(), CachedResponse::new(200, "first")).await.unwrap();
        let outcome = idem.store("k1", &order(), CachedResponse::new(500, "second")).await.unwrap();
        assert_eq!(outcome, StoreOutcome::AlreadyStored);

        let replay = idem.check("k1", &order()).await.unwrap().unwrap();
        assert_eq!(replay.response.body, b"first".to_vec());
    }

    #[tokio::test]
    async fn only_safe_headers_are_kept() {
        let (idem, _, _) = idempotency();
        let response = CachedResponse::new(200, "ok")
            .with_header("content-type", "text/plain")
            .with_header("Set-Cookie", "session=abc")
            .with_header("ETag", "\"v1\"");
        idem.store("k1", &order(), response).await.unwrap();

        let replay = idem.check("k1", &order()).await.unwrap().unwrap();
        assert_eq!(
            replay.response.headers,
            vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("ETag".to_string(), "\"v1\"".to_string()),
            ]
        );
        assert!(replay.headers().contains(&(REPLAY_HEADER.to_string(), "true".to_string())));
    }

    #[tokio::test]
    async fn records_expire_after_ttl() {
        let (idem, _, clock) = idempotency();
        idem.store_with_ttl("k1", &order(), CachedResponse::new(200, "ok"), Duration::from_secs(60))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(idem.check("k1", &order()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn binary_bodies_survive_storage() {
        let (idem, store, _) = idempotency();
        let body = vec![0u8, 159, 146, 150, 255];
        idem.store("bin", &order(), CachedResponse::new(200, body.clone())).await.unwrap();

        use crate::store::CounterStore;
        let raw = store.get("idempotency:bin").await.unwrap().unwrap();
        assert!(raw.contains("\"body\":\"AJ+Slv8=\""));
        assert_eq!(idem.get("bin").await.unwrap().response.body, body);
    }

    #[tokio::test]
    async fn store_outage_executes_without_replay() {
        let (idem, store, _) = idempotency();
        store.set_available(false);
        assert_eq!(idem.check("k1", &order()).await.unwrap(), None);
        assert_eq!(
            idem.store("k1", &order(), CachedResponse::new(200, "ok")).await.unwrap(),
            StoreOutcome::Skipped
        );
    }
}
