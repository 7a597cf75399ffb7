//! Output→Task (C5): parses raw output lines into field maps and reconciles
//! them against a hierarchical task tracker.
//!
//! Single-threaded per instance; assumes lines arrive in order from the
//! enclosing phase (§4.5).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::tracker::{TaskTracker, Value};

/// Canonical field names a conversion function maps raw string keys onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Event,
    Operation,
    Task,
    Timestamp,
    Completed,
    Increment,
    Total,
    Unit,
    Result,
}

/// Value attached to a canonical field after conversion.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Text(String),
    Numeric(Value),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn as_numeric(&self) -> Option<Value> {
        match self {
            FieldValue::Numeric(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

/// Raw key-value map produced by a parser.
pub type RawFields = HashMap<String, String>;

/// Map of canonical fields produced by a conversion function.
pub type ConvertedFields = HashMap<Field, FieldValue>;

/// Callable `(line) -> map<string,string>|null`. Returning `None`/empty means
/// "no match"; the line is then offered to subsequent parsers.
pub type Parser = Arc<dyn Fn(&str) -> Option<RawFields> + Send + Sync>;

/// Callable `(map<string,string>) -> map<Field,any>`.
pub type Conversion = Arc<dyn Fn(&RawFields) -> ConvertedFields + Send + Sync>;

const CANONICAL_NAMES: &[(&str, Field)] = &[
    ("event", Field::Event),
    ("operation", Field::Operation),
    ("task", Field::Task),
    ("timestamp", Field::Timestamp),
    ("completed", Field::Completed),
    ("increment", Field::Increment),
    ("total", Field::Total),
    ("unit", Field::Unit),
    ("result", Field::Result),
];

/// Default conversion: rename string keys to the canonical `Field` enum;
/// parse `timestamp` as ISO date-time; coerce `completed`/`increment`/`total`
/// to numeric if they parse, else leave as string; drop all keys whose
/// value is null/missing.
pub fn default_conversion(raw: &RawFields) -> ConvertedFields {
    let mut out = ConvertedFields::new();
    for (name, field) in CANONICAL_NAMES {
        let Some(raw_value) = raw.get(*name) else {
            continue;
        };
        let value = match field {
            Field::Timestamp => match DateTime::parse_from_rfc3339(raw_value) {
                Ok(dt) => FieldValue::Timestamp(dt.with_timezone(&Utc)),
                Err(_) => continue,
            },
            Field::Completed | Field::Increment | Field::Total => {
                FieldValue::Numeric(Value::parse(raw_value))
            }
            _ => FieldValue::Text(raw_value.clone()),
        };
        out.insert(*field, value);
    }
    out
}

/// A stateful consumer of `(line, is_err)` pairs, configured with an ordered
/// list of line parsers and an optional conversion function.
pub struct OutputToTask {
    tracker: Arc<TaskTracker>,
    parsers: Vec<Parser>,
    conversion: Conversion,
}

impl OutputToTask {
    pub fn new(tracker: Arc<TaskTracker>, parsers: Vec<Parser>) -> Self {
        Self {
            tracker,
            parsers,
            conversion: Arc::new(default_conversion),
        }
    }

    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = conversion;
        self
    }

    /// Entry point satisfying the Phaser's output hook signature.
    pub fn new_output(&self, line: &str, _is_err: bool) {
        let mut merged: RawFields = HashMap::new();
        for parser in &self.parsers {
            if let Some(kv) = parser(line) {
                merged.extend(kv);
            }
        }

        if merged.is_empty() {
            return;
        }

        let converted = (self.conversion)(&merged);
        if converted.is_empty() {
            return;
        }

        self.reconcile(&converted);
    }

    fn reconcile(&self, fields: &ConvertedFields) {
        let timestamp = fields
            .get(&Field::Timestamp)
            .and_then(FieldValue::as_timestamp)
            .unwrap_or_else(Utc::now);

        // (a) Subtask resolution.
        let task_name = fields.get(&Field::Task).and_then(FieldValue::as_text);
        let prev_tail = self.tracker.subtasks().last().cloned();

        let (target, is_finished) = if let Some(name) = task_name {
            let current = self.tracker.subtask(name, timestamp);
            let reappeared = prev_tail
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, &current));
            (current, reappeared)
        } else {
            match &prev_tail {
                Some(tail) if !tail.is_finished() => (Arc::clone(tail), false),
                _ => (Arc::clone(&self.tracker), false),
            }
        };

        // (b) Operation update.
        let completed = fields.get(&Field::Completed).and_then(FieldValue::as_numeric);
        let increment = fields.get(&Field::Increment).and_then(FieldValue::as_numeric);
        let total = fields.get(&Field::Total).and_then(FieldValue::as_numeric);
        let unit = fields.get(&Field::Unit).and_then(FieldValue::as_text);

        let mut operation_updated = false;
        if completed.is_some() || increment.is_some() || total.is_some() || unit.is_some() {
            let op_name = fields
                .get(&Field::Operation)
                .and_then(FieldValue::as_text)
                .or_else(|| fields.get(&Field::Event).and_then(FieldValue::as_text));
            if let Some(op_name) = op_name {
                let op = target.operation(op_name, timestamp);
                let amount = completed.or_else(|| increment.clone());
                op.update(
                    amount,
                    total,
                    unit.map(str::to_string),
                    increment.is_some(),
                    timestamp,
                );
                operation_updated = true;
            }
        }

        // (c) Event.
        if !operation_updated {
            if let Some(event) = fields.get(&Field::Event).and_then(FieldValue::as_text) {
                target.event(event, timestamp);
            }
        }

        // (d) Completion.
        let result = fields.get(&Field::Result).and_then(FieldValue::as_text);
        if result.is_some() || is_finished {
            target.finished(result.map(str::to_string), timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv_parser(pairs: &'static [(&'static str, &'static str)]) -> Parser {
        Arc::new(move |line: &str| {
            if line == "match" {
                Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
            } else {
                None
            }
        })
    }

    #[test]
    fn default_conversion_drops_unparseable_timestamp_but_keeps_numbers_as_text() {
        let mut raw = RawFields::new();
        raw.insert("event".to_string(), "start".to_string());
        raw.insert("completed".to_string(), "not-a-number".to_string());
        let converted = default_conversion(&raw);
        assert_eq!(
            converted.get(&Field::Event),
            Some(&FieldValue::Text("start".to_string()))
        );
        assert_eq!(
            converted.get(&Field::Completed),
            Some(&FieldValue::Numeric(Value::Text("not-a-number".to_string())))
        );
        assert!(!converted.contains_key(&Field::Timestamp));
    }

    #[test]
    fn empty_line_is_discarded() {
        let tracker = TaskTracker::new_root();
        let o2t = OutputToTask::new(Arc::clone(&tracker), vec![kv_parser(&[("event", "x")])]);
        o2t.new_output("no-match", false);
        assert!(tracker.subtasks().is_empty());
    }

    #[test]
    fn scenario_build_compile_reconciliation() {
        // Mirrors the literal scenario in the spec: a build subtask with a
        // compile operation progressing 10 -> 100 of 100 files, finished ok.
        let tracker = TaskTracker::new_root();
        let parsers: Vec<Parser> = vec![Arc::new(|line: &str| -> Option<RawFields> {
            let mut kv = RawFields::new();
            for part in line.split(';') {
                let (k, v) = part.split_once('=')?;
                kv.insert(k.to_string(), v.to_string());
            }
            Some(kv)
        })];
        let o2t = OutputToTask::new(Arc::clone(&tracker), parsers);

        o2t.new_output("task=build;event=start", false);
        o2t.new_output("operation=compile;completed=10;total=100;unit=files", false);
        o2t.new_output("operation=compile;completed=100;total=100;unit=files", false);
        o2t.new_output("task=build;result=ok", false);

        let subtasks = tracker.subtasks();
        assert_eq!(subtasks.len(), 1);
        let build = &subtasks[0];
        assert_eq!(build.name(), "build");

        let ops = build.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].name(), "compile");
        assert_eq!(ops[0].completed(), Some(Value::Number(100.0)));
        assert_eq!(ops[0].total(), Some(Value::Number(100.0)));
        assert_eq!(ops[0].unit(), Some("files".to_string()));

        assert!(build.is_finished());
        assert_eq!(build.result(), Some("ok".to_string()));
    }

    #[test]
    fn repeated_task_name_marks_previous_finished() {
        let tracker = TaskTracker::new_root();
        let parsers: Vec<Parser> = vec![Arc::new(|line: &str| -> Option<RawFields> {
            let mut kv = RawFields::new();
            kv.insert("task".to_string(), line.to_string());
            Some(kv)
        })];
        let o2t = OutputToTask::new(Arc::clone(&tracker), parsers);

        o2t.new_output("build", false);
        assert!(!tracker.subtasks()[0].is_finished());
        o2t.new_output("build", false);
        assert_eq!(tracker.subtasks().len(), 1);
        assert!(tracker.subtasks()[0].is_finished());
    }
}
