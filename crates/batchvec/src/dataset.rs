use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::EmbedError;
use crate::record::Record;

/// Read a job set from a JSONL file: one JSON object per line, `content`
/// required, every other field carried as metadata. `row_limit` caps how
/// many records are taken.
pub fn load_jsonl(path: &Path, row_limit: Option<usize>) -> Result<Vec<Record>, EmbedError> {
    let file = File::open(path)
        .map_err(|e| EmbedError::Dataset(format!("cannot open {}: {e}", path.display())))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        if row_limit.is_some_and(|limit| records.len() >= limit) {
            break;
        }
        let line = line
            .map_err(|e| EmbedError::Dataset(format!("read error at line {}: {e}", line_no + 1)))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line).map_err(|e| {
            EmbedError::Dataset(format!("malformed record at line {}: {e}", line_no + 1))
        })?;
        records.push(record);
    }
    tracing::debug!(count = records.len(), path = %path.display(), "loaded job set");
    Ok(records)
}

/// Write records as JSONL, one object per line.
pub fn write_jsonl(path: &Path, records: &[Record]) -> Result<(), EmbedError> {
    let file = File::create(path)
        .map_err(|e| EmbedError::Dataset(format!("cannot create {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| EmbedError::Dataset(format!("serialize error: {e}")))?;
        writer
            .write_all(b"\n")
            .map_err(|e| EmbedError::Dataset(format!("write error: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| EmbedError::Dataset(format!("flush error: {e}")))?;
    Ok(())
}
