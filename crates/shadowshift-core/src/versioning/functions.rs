//! Registry of installed sync functions and triggers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registry entry: one object installed for a source/target table pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncObject {
    /// Table whose row changes fire the trigger.
    pub source_table: String,
    /// Table the function writes into.
    pub target_table: String,
    /// Function or trigger name.
    pub name: String,
}

/// Persisted mapping `(source id, target id) -> {function, trigger}`.
///
/// Used to tear down sync machinery once a version is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFunctions {
    functions: BTreeMap<String, BTreeMap<String, String>>,
    triggers: BTreeMap<String, BTreeMap<String, String>>,
}

impl MigrationFunctions {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the function installed for a table pair.
    pub fn put_function(&mut self, source: &str, target: &str, name: impl Into<String>) {
        self.functions
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string(), name.into());
    }

    /// Record the trigger installed for a table pair.
    pub fn put_trigger(&mut self, source: &str, target: &str, name: impl Into<String>) {
        self.triggers
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string(), name.into());
    }

    /// The function installed for a table pair.
    pub fn function(&self, source: &str, target: &str) -> Option<&str> {
        self.functions.get(source)?.get(target).map(String::as_str)
    }

    /// The trigger installed for a table pair.
    pub fn trigger(&self, source: &str, target: &str) -> Option<&str> {
        self.triggers.get(source)?.get(target).map(String::as_str)
    }

    /// Every function whose source or target is the given table.
    pub fn functions_touching(&self, table_id: &str) -> Vec<SyncObject> {
        touching(&self.functions, table_id)
    }

    /// Every trigger whose source or target is the given table.
    pub fn triggers_touching(&self, table_id: &str) -> Vec<SyncObject> {
        touching(&self.triggers, table_id)
    }

    /// Forget the function for a table pair.
    pub fn remove_function(&mut self, source: &str, target: &str) {
        remove(&mut self.functions, source, target);
    }

    /// Forget the trigger for a table pair.
    pub fn remove_trigger(&mut self, source: &str, target: &str) {
        remove(&mut self.triggers, source, target);
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.triggers.is_empty()
    }
}

fn touching(entries: &BTreeMap<String, BTreeMap<String, String>>, table_id: &str) -> Vec<SyncObject> {
    entries
        .iter()
        .flat_map(|(source, targets)| {
            targets.iter().map(move |(target, name)| SyncObject {
                source_table: source.clone(),
                target_table: target.clone(),
                name: name.clone(),
            })
        })
        .filter(|o| o.source_table == table_id || o.target_table == table_id)
        .collect()
}

fn remove(entries: &mut BTreeMap<String, BTreeMap<String, String>>, source: &str, target: &str) {
    if let Some(targets) = entries.get_mut(source) {
        targets.remove(target);
        if targets.is_empty() {
            entries.remove(source);
        }
    }
}
