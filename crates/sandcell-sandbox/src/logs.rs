//! Console capture for one execution

use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Ordered record of the values logged during one execution
///
/// Append-only and bounded: once either the entry or the byte ceiling is
/// reached, further entries are counted and dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBuffer {
    entries: Vec<Value>,
    bytes: usize,
    dropped: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl LogBuffer {
    pub fn with_limits(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            bytes: 0,
            dropped: 0,
            max_entries,
            max_bytes,
        }
    }

    /// Append a value. Returns false if it was dropped.
    pub fn push(&mut self, value: Value) -> bool {
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        if self.entries.len() >= self.max_entries || self.bytes + size > self.max_bytes {
            self.dropped += 1;
            return false;
        }
        self.bytes += size;
        self.entries.push(value);
        true
    }

    /// Count an entry that never made it to `push`
    pub(crate) fn mark_dropped(&mut self) {
        self.dropped += 1;
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Value> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries dropped after a ceiling was reached
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }
}

/// The buffer as shared between the worker thread and the waiting caller
pub(crate) type SharedLogs = Arc<Mutex<LogBuffer>>;

/// Copy out the current contents, even if a writer panicked mid-append
pub(crate) fn snapshot(logs: &SharedLogs) -> LogBuffer {
    logs.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keeps_call_order() {
        let mut logs = LogBuffer::with_limits(10, 1024);
        logs.push(json!("a"));
        logs.push(json!(2));
        logs.push(json!({"k": "v"}));
        assert_eq!(logs.entries(), &[json!("a"), json!(2), json!({"k": "v"})]);
        assert!(!logs.is_truncated());
    }

    #[test]
    fn test_entry_ceiling() {
        let mut logs = LogBuffer::with_limits(2, 1024);
        assert!(logs.push(json!(1)));
        assert!(logs.push(json!(2)));
        assert!(!logs.push(json!(3)));
        assert_eq!(logs.len(), 2);
        assert_eq!(logs.dropped(), 1);
    }

    #[test]
    fn test_byte_ceiling() {
        let mut logs = LogBuffer::with_limits(100, 8);
        // "\"abc\"" is 5 bytes
        assert!(logs.push(json!("abc")));
        assert!(!logs.push(json!("abcd")));
        // Small entries still fit after a large one was dropped
        assert!(logs.push(json!(1)));
        assert_eq!(logs.entries(), &[json!("abc"), json!(1)]);
        assert!(logs.is_truncated());
    }
}
