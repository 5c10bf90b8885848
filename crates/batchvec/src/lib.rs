pub mod batch;
pub mod cancel_token;
pub mod config;
pub mod dataset;
pub mod embedder;
pub mod endpoint;
pub mod error;
pub mod record;

pub use batch::{BatchEmbedder, BatchPhase, BatchStatus};
pub use embedder::{EmbeddingProcessor, EmbeddingSource, FixtureBackend};
pub use error::EmbedError;
pub use record::{JobOutcome, Record, RecordFailure};
