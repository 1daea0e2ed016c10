use crate::state::{AppState, Field, LogSequence};
use crate::LogEntry;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Update key for an appended log suffix; a full replacement travels under
/// the plain `logEntries` key.
pub const LOG_APPEND_KEY: &str = "logEntriesAppend";

/// What a client needs to catch one field up to the canonical state.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Value(Field, Value),
    LogAppend(Vec<Arc<LogEntry>>),
    LogReplace(Vec<Arc<LogEntry>>),
}

impl Change {
    pub fn field(&self) -> Field {
        match self {
            Change::Value(field, _) => *field,
            Change::LogAppend(_) | Change::LogReplace(_) => Field::LogEntries,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Change::Value(field, _) => field.as_str(),
            Change::LogAppend(_) => LOG_APPEND_KEY,
            Change::LogReplace(_) => Field::LogEntries.as_str(),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Change::Value(_, value) => value,
            Change::LogAppend(entries) | Change::LogReplace(entries) => {
                serde_json::to_value(entries).unwrap_or(Value::Null)
            }
        }
    }
}

/// Compare one field of the canonical state against what a client was last
/// sent. Pure; the caller advances the shadow after a successful send.
pub fn compare(field: Field, current: &AppState, last_sent: &AppState) -> Option<Change> {
    if field == Field::LogEntries {
        return compare_logs(current.logs(), last_sent.logs());
    }
    if current.field_eq(last_sent, field) {
        return None;
    }
    Some(Change::Value(field, current.field_value(field)))
}

// Entries are immutable and append-only inside an epoch, so a length
// difference is exactly the new tail.
fn compare_logs(current: &LogSequence, last_sent: &LogSequence) -> Option<Change> {
    if current.epoch() != last_sent.epoch() {
        return Some(Change::LogReplace(current.entries().to_vec()));
    }
    match current.len().cmp(&last_sent.len()) {
        Ordering::Equal => None,
        Ordering::Greater => Some(Change::LogAppend(
            current.suffix_from(last_sent.len()).to_vec(),
        )),
        Ordering::Less => Some(Change::LogReplace(current.entries().to_vec())),
    }
}
