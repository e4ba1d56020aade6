#![forbid(unsafe_code)]

//! Bounded log of completed update passes, exported as JSONL.

use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;

/// JSONL schema tag for pass records.
pub const PASS_LOG_SCHEMA: &str = "chatvirt-jsonl-v1";

const PASS_LOG_CAPACITY: usize = 512;

/// What started an update pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassReason {
    Install,
    Scroll,
    Resize,
    Refresh,
    /// New turns arrived and none were assistant replies.
    Ingest,
    /// New assistant replies arrived; they are force-mounted.
    Reply,
    /// The page removed tracked turns.
    Removal,
}

impl PassReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Scroll => "scroll",
            Self::Resize => "resize",
            Self::Refresh => "refresh",
            Self::Ingest => "ingest",
            Self::Reply => "reply",
            Self::Removal => "removal",
        }
    }
}

/// One completed update pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassRecord {
    pub seq: u64,
    /// Host time the pass finished.
    pub at_ms: u64,
    pub reason: PassReason,
    pub unmounted: usize,
    pub mounted: usize,
    pub remeasured: usize,
    /// Overscanned window, container content coordinates.
    pub window_top: f64,
    pub window_bottom: f64,
}

#[derive(Serialize)]
struct PassRecordJsonl<'a> {
    schema_version: &'static str,
    event: &'static str,
    run_id: &'a str,
    ts_ms: u64,
    pass_seq: u64,
    reason: &'static str,
    unmounted: usize,
    mounted: usize,
    remeasured: usize,
    window_top: f64,
    window_bottom: f64,
}

impl PassRecord {
    /// Serialize one JSONL line.
    #[must_use]
    pub fn to_jsonl_line(&self, run_id: &str) -> String {
        let record = PassRecordJsonl {
            schema_version: PASS_LOG_SCHEMA,
            event: "virtualizer_pass",
            run_id,
            ts_ms: self.at_ms,
            pass_seq: self.seq,
            reason: self.reason.as_str(),
            unmounted: self.unmounted,
            mounted: self.mounted,
            remeasured: self.remeasured,
            window_top: self.window_top,
            window_bottom: self.window_bottom,
        };
        match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(error) => serde_json::to_string(&json!({
                "schema_version": PASS_LOG_SCHEMA,
                "event": "virtualizer_pass_encode_error",
                "run_id": run_id,
                "pass_seq": self.seq,
                "error": error.to_string(),
            }))
            .unwrap_or_else(|_| {
                "{\"schema_version\":\"chatvirt-jsonl-v1\",\"event\":\"virtualizer_pass_encode_error\"}"
                    .to_owned()
            }),
        }
    }
}

/// Ring of the most recent pass records.
#[derive(Debug, Clone, Default)]
pub struct PassLog {
    records: VecDeque<PassRecord>,
    next_seq: u64,
}

impl PassLog {
    /// Append a record, assigning its sequence number and evicting the
    /// oldest entry at capacity.
    pub fn push(&mut self, mut record: PassRecord) -> u64 {
        record.seq = self.next_seq;
        self.next_seq += 1;
        if self.records.len() >= PASS_LOG_CAPACITY {
            let _ = self.records.pop_front();
        }
        let seq = record.seq;
        self.records.push_back(record);
        seq
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&PassRecord> {
        self.records.back()
    }

    pub fn drain(&mut self) -> Vec<PassRecord> {
        self.records.drain(..).collect()
    }

    pub fn drain_jsonl(&mut self, run_id: &str) -> Vec<String> {
        self.drain()
            .into_iter()
            .map(|record| record.to_jsonl_line(run_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn record(reason: PassReason) -> PassRecord {
        PassRecord {
            seq: 0,
            at_ms: 42,
            reason,
            unmounted: 3,
            mounted: 1,
            remeasured: 1,
            window_top: -1200.0,
            window_bottom: 2000.0,
        }
    }

    #[test]
    fn log_is_bounded_to_capacity() {
        let mut log = PassLog::default();
        for _ in 0..(PASS_LOG_CAPACITY + 10) {
            log.push(record(PassReason::Scroll));
        }
        assert_eq!(log.len(), PASS_LOG_CAPACITY);
        let drained = log.drain();
        assert_eq!(drained[0].seq, 10);
        assert!(log.is_empty());
    }

    #[test]
    fn jsonl_contains_required_fields() {
        let mut log = PassLog::default();
        log.push(record(PassReason::Reply));
        let lines = log.drain_jsonl("run-7");
        assert_eq!(lines.len(), 1);
        let parsed: Value = serde_json::from_str(&lines[0]).expect("valid json");
        assert_eq!(parsed["schema_version"], PASS_LOG_SCHEMA);
        assert_eq!(parsed["event"], "virtualizer_pass");
        assert_eq!(parsed["run_id"], "run-7");
        assert_eq!(parsed["reason"], "reply");
        assert_eq!(parsed["ts_ms"], 42);
        assert_eq!(parsed["unmounted"], 3);
        assert_eq!(parsed["window_top"], -1200.0);
    }
}
