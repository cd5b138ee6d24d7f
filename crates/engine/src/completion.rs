//! Batch completion accounting.
//!
//! [`CompletionTracker`] counts terminal jobs by index, so a duplicate
//! or late completion for a job can never be counted twice, and reports
//! batch completion exactly once.

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

use booth_core::types::JobIndex;
use serde::Serialize;

/// When the batch may be considered complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Every job reached a terminal state.
    #[default]
    PerJob,
    /// Every job reached a terminal state and every project with a
    /// successful job also sent its project-level completion.
    Aggregate,
}

impl FromStr for CompletionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "per_job" | "per-job" | "perjob" => Ok(CompletionMode::PerJob),
            "aggregate" => Ok(CompletionMode::Aggregate),
            other => Err(format!("unknown completion mode '{other}'")),
        }
    }
}

/// Tracks which jobs of a batch have finished.
#[derive(Debug)]
pub struct CompletionTracker {
    mode: CompletionMode,
    expected: BTreeSet<JobIndex>,
    counted: BTreeSet<JobIndex>,
    /// Projects that owe an aggregate completion signal.
    awaiting_projects: HashSet<String>,
    /// Projects whose aggregate completion arrived, in any order
    /// relative to their jobs.
    completed_projects: HashSet<String>,
    fired: bool,
}

impl CompletionTracker {
    pub fn new(mode: CompletionMode, indices: impl IntoIterator<Item = JobIndex>) -> Self {
        Self {
            mode,
            expected: indices.into_iter().collect(),
            counted: BTreeSet::new(),
            awaiting_projects: HashSet::new(),
            completed_projects: HashSet::new(),
            fired: false,
        }
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn completed_count(&self) -> usize {
        self.counted.len()
    }

    /// Count `index` as terminal. Returns `false` if it was already
    /// counted or is not part of the batch.
    pub fn record_terminal(&mut self, index: JobIndex) -> bool {
        self.expected.contains(&index) && self.counted.insert(index)
    }

    /// Forget that `index` finished, ahead of a resubmit.
    ///
    /// Only possible while the batch has not completed; afterwards the
    /// batch outcome is final and a resubmit is tracked per item only.
    pub fn reopen(&mut self, index: JobIndex) -> bool {
        if self.fired {
            return false;
        }
        self.counted.remove(&index)
    }

    /// A job of `project_id` succeeded; in aggregate mode the batch now
    /// also waits for that project's completion signal.
    pub fn expect_project(&mut self, project_id: &str) {
        if self.mode == CompletionMode::Aggregate {
            self.awaiting_projects.insert(project_id.to_string());
        }
    }

    pub fn record_project_completion(&mut self, project_id: &str) {
        self.completed_projects.insert(project_id.to_string());
    }

    pub fn all_jobs_terminal(&self) -> bool {
        self.counted.len() == self.expected.len()
    }

    fn aggregate_satisfied(&self) -> bool {
        match self.mode {
            CompletionMode::PerJob => true,
            CompletionMode::Aggregate => self
                .awaiting_projects
                .iter()
                .all(|p| self.completed_projects.contains(p)),
        }
    }

    /// Every job finished but an aggregate signal is still missing.
    pub fn awaiting_aggregate(&self) -> bool {
        !self.fired && self.all_jobs_terminal() && !self.aggregate_satisfied()
    }

    /// Returns `true` exactly once, when the batch becomes complete.
    pub fn try_complete(&mut self) -> bool {
        if self.fired || !self.all_jobs_terminal() || !self.aggregate_satisfied() {
            return false;
        }
        self.fired = true;
        true
    }

    /// Complete without the missing aggregate signals once the grace
    /// period ran out. Returns `true` only if this call completed the
    /// batch.
    pub fn force_complete(&mut self) -> bool {
        if self.fired || !self.all_jobs_terminal() {
            return false;
        }
        self.fired = true;
        true
    }
}
