//! Hierarchical task/operation tracker consumed by the Output→Task component.
//!
//! The tracker is owned by the caller and shared by reference into each
//! `RunContext`; §5 leaves its own thread-safety as the tracker's
//! responsibility, so every mutable field here is behind a `Mutex` even
//! though the Phaser only ever mutates it from the single driver thread —
//! external readers are expected to poll snapshots concurrently.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// A value parsed from output text: coerced to a number when it parses as
/// one, left as the original string otherwise (§4.5 step 3).
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<f64>() {
            Ok(n) => Value::Number(n),
            Err(_) => Value::Text(raw.to_string()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Default)]
struct OperationState {
    completed: Option<Value>,
    total: Option<Value>,
    unit: Option<String>,
    increment: bool,
    updated_at: Option<DateTime<Utc>>,
}

/// A named operation tracked under a task, with progress fields.
#[derive(Debug)]
pub struct Operation {
    name: String,
    state: Mutex<OperationState>,
}

impl Operation {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(OperationState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Update progress. `amount` is `COMPLETED` or `INCREMENT` per §4.5(b);
    /// `increment` distinguishes absolute (`false`) from delta (`true`)
    /// progress.
    pub fn update(
        &self,
        amount: Option<Value>,
        total: Option<Value>,
        unit: Option<String>,
        increment: bool,
        timestamp: DateTime<Utc>,
    ) {
        let mut s = self.state.lock().unwrap();
        if increment {
            let delta = match &amount {
                Some(Value::Number(n)) => *n,
                _ => 0.0,
            };
            let base = match &s.completed {
                Some(Value::Number(n)) => *n,
                _ => 0.0,
            };
            s.completed = Some(Value::Number(base + delta));
        } else if amount.is_some() {
            s.completed = amount;
        }
        if total.is_some() {
            s.total = total;
        }
        if unit.is_some() {
            s.unit = unit;
        }
        s.increment = increment;
        s.updated_at = Some(timestamp);
    }

    pub fn completed(&self) -> Option<Value> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn total(&self) -> Option<Value> {
        self.state.lock().unwrap().total.clone()
    }

    pub fn unit(&self) -> Option<String> {
        self.state.lock().unwrap().unit.clone()
    }
}

#[derive(Debug, Default)]
struct TaskState {
    subtasks: Vec<Arc<Task>>,
    operations: Vec<Arc<Operation>>,
    events: Vec<(String, DateTime<Utc>)>,
    finished: Option<(Option<String>, DateTime<Utc>)>,
}

/// A task node: the root `TaskTracker` itself, or any subtask beneath it.
#[derive(Debug)]
pub struct Task {
    name: String,
    state: Mutex<TaskState>,
}

/// Alias: the root of the tree is just a `Task` with an empty name.
pub type TaskTracker = Task;

impl Task {
    pub fn new_root() -> Arc<Self> {
        Arc::new(Self {
            name: String::new(),
            state: Mutex::new(TaskState::default()),
        })
    }

    fn new_child(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(TaskState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered list of child tasks (snapshot).
    pub fn subtasks(&self) -> Vec<Arc<Task>> {
        self.state.lock().unwrap().subtasks.clone()
    }

    /// Idempotent lookup-or-create: appends a new child if `name` differs
    /// from the last child's name, otherwise returns the existing last
    /// child (same `Arc` identity — callers rely on this to detect
    /// "the same subtask name reappeared", per the reconciliation rule in
    /// §4.5(a)).
    ///
    /// This is a naming convention, not a guarantee from the output stream:
    /// if two distinct logical runs of a subtask happen to share a name
    /// with no dividing subtask in between, they collapse into one task.
    pub fn subtask(&self, name: &str, _timestamp: DateTime<Utc>) -> Arc<Task> {
        let mut s = self.state.lock().unwrap();
        if let Some(last) = s.subtasks.last() {
            if last.name == name {
                return Arc::clone(last);
            }
        }
        let child = Task::new_child(name);
        s.subtasks.push(Arc::clone(&child));
        child
    }

    /// Idempotent lookup-or-create of a named operation on this task.
    pub fn operation(&self, name: &str, _timestamp: DateTime<Utc>) -> Arc<Operation> {
        let mut s = self.state.lock().unwrap();
        if let Some(existing) = s.operations.iter().find(|o| o.name == name) {
            return Arc::clone(existing);
        }
        let op = Arc::new(Operation::new(name));
        s.operations.push(Arc::clone(&op));
        op
    }

    /// Record a point-in-time event.
    pub fn event(&self, name: &str, timestamp: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .events
            .push((name.to_string(), timestamp));
    }

    /// Mark completion.
    pub fn finished(&self, result: Option<String>, timestamp: DateTime<Utc>) {
        self.state.lock().unwrap().finished = Some((result, timestamp));
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished.is_some()
    }

    pub fn result(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .finished
            .as_ref()
            .and_then(|(r, _)| r.clone())
    }

    pub fn events(&self) -> Vec<(String, DateTime<Utc>)> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn operations(&self) -> Vec<Arc<Operation>> {
        self.state.lock().unwrap().operations.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtask_is_idempotent_by_adjacency() {
        let root = Task::new_root();
        let t1 = root.subtask("build", Utc::now());
        let t2 = root.subtask("build", Utc::now());
        assert!(Arc::ptr_eq(&t1, &t2));
        assert_eq!(root.subtasks().len(), 1);

        let t3 = root.subtask("test", Utc::now());
        assert!(!Arc::ptr_eq(&t1, &t3));
        assert_eq!(root.subtasks().len(), 2);
    }

    #[test]
    fn operation_progress_absolute_vs_increment() {
        let root = Task::new_root();
        let op = root.operation("compile", Utc::now());
        op.update(
            Some(Value::Number(10.0)),
            Some(Value::Number(100.0)),
            Some("files".to_string()),
            false,
            Utc::now(),
        );
        assert_eq!(op.completed(), Some(Value::Number(10.0)));

        op.update(Some(Value::Number(5.0)), None, None, true, Utc::now());
        assert_eq!(op.completed(), Some(Value::Number(15.0)));
    }

    #[test]
    fn finished_marks_task() {
        let root = Task::new_root();
        let t = root.subtask("build", Utc::now());
        assert!(!t.is_finished());
        t.finished(Some("ok".to_string()), Utc::now());
        assert!(t.is_finished());
        assert_eq!(t.result(), Some("ok".to_string()));
    }
}
