//! NDJSON export of a session's event log, and re-folding an exported log.

use crate::reducer::{self, CacheStatus, LoggedEvent, StreamState};
use crate::types::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Writes one logged event per line. Secret-looking keys in extra envelope
/// fields are masked.
pub fn export(path: &Path, events: &[LoggedEvent]) -> Result<usize> {
    let mut writer = BufWriter::new(File::create(path)?);
    for event in events {
        let mut value = serde_json::to_value(event)?;
        crate::redaction::redact_value(&mut value);
        serde_json::to_writer(&mut writer, &value)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    tracing::info!("[event_log] exported {} events to {}", events.len(), path.display());
    Ok(events.len())
}

/// Reads an exported log. Blank lines are skipped; a malformed line fails the
/// whole import with its line number.
pub fn import(path: &Path) -> Result<Vec<LoggedEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: LoggedEvent = serde_json::from_str(&line).map_err(|e| {
            VantageError::Protocol(format!("{}:{}: {}", path.display(), idx + 1, e))
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Folds logged events back into a state, honoring their original receipt
/// times. Entries flagged as duplicates are folded too; the reducer's dedup
/// window flags them again.
///
/// A jump in an entry's sub-stream replays the switch to live that happened
/// when it was recorded.
pub fn replay(analysis_id: AnalysisId, events: &[LoggedEvent]) -> StreamState {
    events.iter().fold(
        StreamState::new_attempt(analysis_id, CacheStatus::Unknown),
        |mut state, logged| {
            while state.substream < logged.substream {
                state = state.switch_to_live();
            }
            reducer::reduce_at(state, &logged.envelope, logged.received_at)
        },
    )
}
