use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::store::PersistedReplica;

/// One tick of a table: `[index, state]` on the wire and on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry(pub u64, pub Value);

impl LogEntry {
    pub fn index(&self) -> u64 {
        self.0
    }

    pub fn state(&self) -> &Value {
        &self.1
    }
}

/// Outcome of [`ReplicaLog::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// `current` moved to the new entry; holds the snapshot it replaced.
    Advanced(Option<Value>),
    /// The entry was older than the head and only filled its slot.
    Backfilled,
}

/// Tick-indexed log plus the current snapshot of one table.
///
/// Entries are keyed by tick, so sparse or out-of-order delivery lands in the
/// right slot and range reads come back in ascending order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaLog {
    entries: BTreeMap<u64, Value>,
    current: Option<Value>,
    /// Tick that produced `current`.
    head: Option<u64>,
}

impl ReplicaLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records `state` at `index`.
    ///
    /// The current snapshot only moves forward: a late entry for an older tick
    /// fills its slot without regressing `current`.
    pub fn apply(&mut self, index: u64, state: Value) -> Applied {
        self.entries.insert(index, state.clone());
        match self.head {
            Some(head) if index < head => Applied::Backfilled,
            _ => {
                self.head = Some(index);
                Applied::Advanced(self.current.replace(state))
            }
        }
    }

    /// Replaces the whole log. `current` becomes the state of the last entry
    /// in the given order, or nothing for an empty snapshot.
    pub fn load_snapshot(&mut self, entries: Vec<LogEntry>) {
        let last = entries.last().cloned();
        self.entries = entries
            .into_iter()
            .map(|LogEntry(index, state)| (index, state))
            .collect();
        self.head = last.as_ref().map(LogEntry::index);
        self.current = last.map(|LogEntry(_, state)| state);
    }

    /// Entries with `index >= from`, ascending.
    pub fn resume(&self, from: u64) -> Vec<LogEntry> {
        self.entries
            .range(from..)
            .map(|(index, state)| LogEntry(*index, state.clone()))
            .collect()
    }

    pub fn to_persisted(&self) -> PersistedReplica {
        PersistedReplica {
            log: self.resume(0),
            current: self.current.clone(),
        }
    }
}

impl From<PersistedReplica> for ReplicaLog {
    fn from(persisted: PersistedReplica) -> Self {
        let head = persisted.log.last().map(LogEntry::index);
        Self {
            entries: persisted
                .log
                .into_iter()
                .map(|LogEntry(index, state)| (index, state))
                .collect(),
            current: persisted.current,
            head,
        }
    }
}
