use crate::scheduler::Session;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use trialflow_core::DataRecorder;

/// In-memory data store of one experiment: one entry (row) per trial.
///
/// Values land in the current entry until `next_entry` pushes it onto the
/// list. Column names are kept in first-seen order.
#[derive(Debug)]
pub struct ExperimentHandler {
    name: String,
    session: Session,
    entries: Vec<Map<String, Value>>,
    current: Map<String, Value>,
    keys: Vec<String>,
    loops: Vec<String>,
}

impl ExperimentHandler {
    pub fn new(name: impl Into<String>, session: &Session) -> Self {
        Self {
            name: name.into(),
            session: session.clone(),
            entries: Vec::new(),
            current: Map::new(),
            keys: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_data(&mut self, key: &str, value: impl Into<Value>) {
        if !self.keys.iter().any(|k| k == key) {
            self.keys.push(key.to_string());
        }
        self.current.insert(key.to_string(), value.into());
    }

    /// Closes the current entry. Empty entries are not stored.
    pub fn next_entry(&mut self) {
        if self.current.is_empty() {
            debug!("{}: skipping empty entry", self.name);
            return;
        }
        let entry = std::mem::take(&mut self.current);
        self.entries.push(entry);
        debug!("{}: entry {} stored", self.name, self.entries.len());
    }

    pub fn is_entry_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn current_entry(&self) -> &Map<String, Value> {
        &self.current
    }

    pub fn entries(&self) -> &[Map<String, Value>] {
        &self.entries
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Registers a loop by name; registering the same name twice is a no-op.
    pub fn add_loop(&mut self, name: impl Into<String>) {
        let name = name.into();
        if self.loops.contains(&name) {
            warn!("{}: loop {name} is already registered", self.name);
            return;
        }
        self.loops.push(name);
    }

    pub fn remove_loop(&mut self, name: &str) -> bool {
        let before = self.loops.len();
        self.loops.retain(|l| l != name);
        before != self.loops.len()
    }

    pub fn loops(&self) -> &[String] {
        &self.loops
    }

    /// Stores any pending entry and ends the session, so that quitting
    /// schedulers unwind all the way to the root.
    pub fn end(&mut self) {
        self.next_entry();
        self.session.end();
        info!("{}: ended with {} entries", self.name, self.entries.len());
    }

    pub fn has_ended(&self) -> bool {
        self.session.has_ended()
    }
}

impl DataRecorder for ExperimentHandler {
    fn add_data(&mut self, key: &str, value: Value) {
        ExperimentHandler::add_data(self, key, value);
    }
}
