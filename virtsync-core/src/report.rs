//! Run report: flat list of added / removed hosts across every object type

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::ObjectType;

/// Result of one completed object-type pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Removal stage skipped by the anomaly guard.
    pub removal_held: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeFailure {
    pub object_type: ObjectType,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<TypeFailure>,
    pub held_back: Vec<ObjectType>,
}

impl SyncOutcome {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "run {}: {} added, {} removed, {} failed type(s), {} held back",
            self.run_id,
            self.added.len(),
            self.removed.len(),
            self.failed.len(),
            self.held_back.len()
        )
    }

    /// Plain-text body for notifications.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run {} ({} -> {})", self.run_id, self.started_at.to_rfc3339(), self.finished_at.to_rfc3339());

        section(&mut out, "Added hosts", &self.added);
        section(&mut out, "Removed hosts", &self.removed);

        if !self.failed.is_empty() {
            let _ = writeln!(out, "\nFailed object types:");
            for failure in &self.failed {
                let _ = writeln!(out, "  - {}: {}", failure.object_type, failure.error);
            }
        }
        if !self.held_back.is_empty() {
            let held: Vec<&str> = self.held_back.iter().map(|t| t.as_str()).collect();
            let _ = writeln!(out, "\nRemoval held back by anomaly guard: {}", held.join(", "));
        }
        out
    }
}

fn section(out: &mut String, title: &str, names: &[String]) {
    let _ = writeln!(out, "\n{title} ({}):", names.len());
    if names.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for name in names {
        let _ = writeln!(out, "  - {name}");
    }
}

/// Folds per-type outcomes into the run report.
#[derive(Debug)]
pub struct ReportAggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    added: Vec<String>,
    removed: Vec<String>,
    failed: Vec<TypeFailure>,
    held_back: Vec<ObjectType>,
}

impl ReportAggregator {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            added: Vec::new(),
            removed: Vec::new(),
            failed: Vec::new(),
            held_back: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn absorb(mut self, object_type: ObjectType, outcome: TypeOutcome) -> Self {
        self.added.extend(outcome.added);
        self.removed.extend(outcome.removed);
        if outcome.removal_held {
            self.held_back.push(object_type);
        }
        self
    }

    pub fn record_failure(mut self, object_type: ObjectType, error: &SyncError) -> Self {
        self.failed.push(TypeFailure {
            object_type,
            error: error.to_string(),
        });
        self
    }

    pub fn finalize(self) -> SyncOutcome {
        SyncOutcome {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            added: self.added,
            removed: self.removed,
            failed: self.failed,
            held_back: self.held_back,
        }
    }
}

impl Default for ReportAggregator {
    fn default() -> Self {
        Self::new()
    }
}
