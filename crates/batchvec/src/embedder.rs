use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancel_token::CancelToken;
use crate::endpoint::RemoteBackend;
use crate::error::EmbedError;

/// Which service actually computes vectors.
#[derive(Debug)]
pub enum EmbeddingSource {
    Remote(RemoteBackend),
    Fixture(FixtureBackend),
}

/// Dispatch wrapper so batch code never matches on the source.
#[derive(Debug)]
pub struct EmbeddingProcessor {
    source: EmbeddingSource,
}

impl EmbeddingProcessor {
    pub fn new(source: EmbeddingSource) -> Self {
        Self { source }
    }

    /// Deterministic in-process embedder for tests and dry runs.
    pub fn new_fixture(dimensions: usize) -> Self {
        Self {
            source: EmbeddingSource::Fixture(FixtureBackend::new(dimensions)),
        }
    }

    pub fn dimensions(&self) -> usize {
        match &self.source {
            EmbeddingSource::Remote(backend) => backend.dimensions,
            EmbeddingSource::Fixture(backend) => backend.dimensions,
        }
    }

    pub async fn embed_one(
        &self,
        text: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<f32>, EmbedError> {
        match &self.source {
            EmbeddingSource::Remote(backend) => backend.embed_one(text, cancel).await,
            EmbeddingSource::Fixture(backend) => backend.embed_one(text).await,
        }
    }

    pub fn fixture(&self) -> Option<&FixtureBackend> {
        match &self.source {
            EmbeddingSource::Fixture(backend) => Some(backend),
            _ => None,
        }
    }
}

/// In-process stand-in for the remote service. Vectors are a pure function
/// of the input text, so reruns attach byte-identical embeddings. The
/// in-flight gauge records the highest simultaneous call count observed,
/// which is how the admission-gate ceiling is verified.
#[derive(Debug, Default)]
pub struct FixtureBackend {
    pub dimensions: usize,
    delay: Option<Duration>,
    fail_every: Option<usize>,
    panic_on_call: Option<usize>,
    max_content_len: Option<usize>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FixtureBackend {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Default::default()
        }
    }

    /// Simulated service latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every `n`th call (1-based) fails with an HTTP 500 marker.
    pub fn with_fail_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// The `n`th call (1-based) panics instead of returning.
    pub fn with_panic_on_call(mut self, n: usize) -> Self {
        self.panic_on_call = Some(n.max(1));
        self
    }

    /// Reject inputs longer than `max` chars, as a server-declared limit.
    pub fn with_max_content_len(mut self, max: usize) -> Self {
        self.max_content_len = Some(max);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_seen(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if self.panic_on_call == Some(call) {
            panic!("scripted panic on call {call}");
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(max) = self.max_content_len {
            let len = text.chars().count();
            if len > max {
                return Err(EmbedError::OversizedInput(format!(
                    "input length {len} exceeds server limit {max}"
                )));
            }
        }
        if let Some(n) = self.fail_every {
            if call % n == 0 {
                return Err(EmbedError::Http {
                    status: 500,
                    body: "scripted failure".into(),
                    url: "fixture://embed".into(),
                });
            }
        }
        Ok(self.vector_for(text))
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        // FNV-1a over the text seeds a small LCG; stable across runs.
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in text.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let mut state = hash | 1;
        (0..self.dimensions)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (1u64 << 31) as f32) - 1.0
            })
            .collect()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_vectors_are_deterministic_and_text_keyed() {
        let backend = FixtureBackend::new(16);
        let a1 = backend.embed_one("doc a").await.unwrap();
        let a2 = backend.embed_one("doc a").await.unwrap();
        let b = backend.embed_one("doc b").await.unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 16);
        assert!(a1.iter().all(|f| f.is_finite()));
    }

    #[tokio::test]
    async fn fixture_scripted_failures_hit_every_nth_call() {
        let backend = FixtureBackend::new(4).with_fail_every(3);
        let mut failures = 0;
        for i in 0..9 {
            if backend.embed_one(&format!("doc {i}")).await.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
        assert_eq!(backend.calls(), 9);
    }

    #[tokio::test]
    async fn fixture_rejects_oversized_input() {
        let backend = FixtureBackend::new(4).with_max_content_len(5);
        let err = backend.embed_one("far too long").await.unwrap_err();
        assert!(matches!(err, EmbedError::OversizedInput(_)));
        assert!(backend.embed_one("ok").await.is_ok());
    }

    #[tokio::test]
    async fn processor_dispatches_to_fixture() {
        let processor = EmbeddingProcessor::new_fixture(8);
        assert_eq!(processor.dimensions(), 8);
        let vector = processor.embed_one("doc", None).await.unwrap();
        assert_eq!(vector.len(), 8);
        assert!(processor.fixture().is_some());
    }
}
