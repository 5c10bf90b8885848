use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EmbedError;

/// One document to embed: required text plus whatever metadata the source
/// dataset carried. Unknown fields survive a load/store round trip
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Text sent to the embedding service.
    pub content: String,
    /// Vector attached after a successful embedding call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Pass-through fields from the source dataset.
    #[serde(flatten)]
    pub meta: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            embedding: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Failure marker for a single record, positioned by its index in the
/// submitted job set.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub index: usize,
    pub error: EmbedError,
}

/// Outcome of one batch run. Records come back in submission order;
/// `failures` indexes into `records`.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub records: Vec<Record>,
    pub failures: Vec<RecordFailure>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.is_embedded()).count()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Clone the failed subset for resubmission, in failure order.
    pub fn failed_records(&self) -> Vec<Record> {
        self.failures
            .iter()
            .map(|f| self.records[f.index].clone())
            .collect()
    }

    /// Fold a rerun of the failed subset back into this outcome. The rerun
    /// must have been produced from `failed_records()` so positions pair up
    /// with the original failure slots.
    pub fn absorb_retry(&mut self, retry: JobOutcome) {
        let slots: Vec<usize> = self.failures.iter().map(|f| f.index).collect();
        self.failures.clear();
        for (slot, record) in slots.iter().copied().zip(retry.records) {
            self.records[slot] = record;
        }
        for f in retry.failures {
            self.failures.push(RecordFailure {
                index: slots[f.index],
                error: f.error,
            });
        }
        self.failures.sort_by_key(|f| f.index);
    }
}
