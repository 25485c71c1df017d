//! Event tracking for the pass pipeline.
//!
//! Every rewrite the passes perform is recorded in an [`EventLog`]: an append-only list of
//! [`Event`]s that can be shared by reference while passes run. The log provides per-kind
//! counts and a one-line summary for diagnostics.
//!
//! # Usage
//!
//! ```rust,ignore
//! ctx.events
//!     .record(EventKind::StoreInserted)
//!     .at(scope, block)
//!     .message("x");
//! ```

use std::{collections::BTreeMap, fmt};

use strum::{Display, EnumIter, IntoEnumIterator};

use crate::ir::{BlockId, ScopeId};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum EventKind {
    /// A dead instruction was deleted.
    InstructionRemoved,
    /// A binding store was inserted.
    StoreInserted,
    /// A binding load was inserted.
    LoadInserted,
    /// A missing `v = nil` initialization was inserted.
    InitInserted,
    /// A global ensure block was synthesized.
    GlobalEnsureAdded,
    /// A box conversion was inserted.
    BoxInserted,
    /// An unbox conversion was inserted.
    UnboxInserted,
    /// An operator call or copy now runs on unboxed values.
    OperationUnboxed,
    /// A local may be read before it is assigned.
    UndefinedVariable,
    /// A pass started.
    PassStarted,
    /// A pass finished.
    PassCompleted,
    /// Informational note.
    Info,
    /// Something suspicious that did not stop compilation.
    Warning,
}

impl EventKind {
    /// Returns `true` for kinds that describe a change to the IR.
    #[must_use]
    pub fn is_change(self) -> bool {
        !matches!(
            self,
            Self::UndefinedVariable | Self::PassStarted | Self::PassCompleted | Self::Info | Self::Warning
        )
    }
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Scope it happened in, if any.
    pub scope: Option<ScopeId>,
    /// Block it happened in, if any.
    pub block: Option<BlockId>,
    /// Free-form detail.
    pub message: Option<String>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        match (self.scope, self.block) {
            (Some(scope), Some(block)) => write!(f, " at {scope}/{block}")?,
            (Some(scope), None) => write!(f, " in {scope}")?,
            _ => {}
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Builder returned by [`EventLog::record`]; the event is appended when it is dropped.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    event: Option<Event>,
}

impl EventBuilder<'_> {
    /// Attaches the scope.
    pub fn scope(mut self, scope: ScopeId) -> Self {
        if let Some(event) = &mut self.event {
            event.scope = Some(scope);
        }
        self
    }

    /// Attaches the scope and block.
    pub fn at(mut self, scope: ScopeId, block: BlockId) -> Self {
        if let Some(event) = &mut self.event {
            event.scope = Some(scope);
            event.block = Some(block);
        }
        self
    }

    /// Attaches a message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        if let Some(event) = &mut self.event {
            event.message = Some(message.into());
        }
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.log.events.push(event);
        }
    }
}

/// Append-only, thread-safe list of events.
#[derive(Default)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording an event of `kind`.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder {
            log: self,
            event: Some(Event {
                kind,
                scope: None,
                block: None,
                message: None,
            }),
        }
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterates over the events in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, event)| event)
    }

    /// Number of events of `kind`.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.iter().filter(|e| e.kind == kind).count()
    }

    /// Returns `true` if any change to the IR was recorded.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.iter().any(|e| e.kind.is_change())
    }

    /// Per-kind counts, omitting kinds that never occurred.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<EventKind, usize> {
        let mut counts = BTreeMap::new();
        for event in self.iter() {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Appends every event of `other`.
    pub fn merge(&self, other: EventLog) {
        for event in other.events {
            self.events.push(event);
        }
    }

    /// Moves the events out, leaving the log empty.
    pub fn take(&mut self) -> EventLog {
        std::mem::take(self)
    }

    /// One-line summary of the change counts, e.g. `3 store-inserted, 1 load-inserted`.
    #[must_use]
    pub fn summary(&self) -> String {
        let counts = self.counts();
        let parts: Vec<String> = EventKind::iter()
            .filter(|k| k.is_change())
            .filter_map(|k| counts.get(&k).map(|n| format!("{n} {k}")))
            .collect();
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_records_on_drop() {
        let log = EventLog::new();
        log.record(EventKind::StoreInserted)
            .at(ScopeId(0), BlockId(2))
            .message("x");
        log.record(EventKind::PassStarted).message("dead-code");
        assert_eq!(log.len(), 2);
        let first = log.iter().next().cloned();
        assert_eq!(
            first.map(|e| e.to_string()),
            Some("store-inserted at scope#0/B2: x".to_string())
        );
    }

    #[test]
    fn test_counts_and_summary() {
        let log = EventLog::new();
        for _ in 0..3 {
            let _ = log.record(EventKind::StoreInserted);
        }
        let _ = log.record(EventKind::LoadInserted);
        let _ = log.record(EventKind::Info);
        assert_eq!(log.count(EventKind::StoreInserted), 3);
        assert!(log.has_changes());
        assert_eq!(log.summary(), "3 store-inserted, 1 load-inserted");
        assert_eq!(EventLog::new().summary(), "no changes");
    }

    #[test]
    fn test_merge_and_take() {
        let mut log = EventLog::new();
        let other = EventLog::new();
        let _ = other.record(EventKind::BoxInserted);
        log.merge(other);
        assert_eq!(log.count(EventKind::BoxInserted), 1);
        let taken = log.take();
        assert!(log.is_empty());
        assert_eq!(taken.len(), 1);
    }
}
