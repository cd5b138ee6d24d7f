//! Attribution of provider events to job slots.
//!
//! The provider may broadcast events for a whole project, and a batch
//! may share one project between several jobs, so every event has to be
//! matched to a slot before it may touch a record. Strategies, in order:
//!
//! 1. An explicit `jobId` this correlator already knows.
//! 2. A job id nested in a structured payload (`job.id`, `data.jobId`).
//! 3. A job id extracted from the result URL.
//! 4. Elimination: the only still-active slot of the event's project.
//!
//! Ids learned through strategies 2-4 are cached on the slot, so later
//! events carrying a different id are refused for that slot. Ids from
//! previous attempts of a slot are remembered and their events dropped,
//! so a retry never sees its predecessor's late completion.

use std::collections::{BTreeMap, HashSet};

use booth_core::types::JobIndex;
use booth_provider::messages::ProviderEvent;
use regex::Regex;

/// How an event was attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ExplicitId,
    StructuredId,
    UrlPattern,
    Elimination,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ExplicitId => "explicit_id",
            Strategy::StructuredId => "structured_id",
            Strategy::UrlPattern => "url_pattern",
            Strategy::Elimination => "elimination",
        }
    }
}

/// Why an event could not be attributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unattributed {
    /// The event names an id that belonged to an earlier attempt.
    StaleJobId(String),
    /// Neither the event nor its source names a project.
    NoProject,
    /// The project has no active slot left.
    NoCandidate { project_id: String },
    /// More than one active slot could own the event.
    Ambiguous { project_id: String, candidates: usize },
    /// The only candidate already has a different id.
    IdMismatch { expected: String, found: String },
}

/// Outcome of [`EventCorrelator::attribute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Matched { index: JobIndex, strategy: Strategy },
    Unattributed(Unattributed),
}

#[derive(Debug, Default)]
struct Slot {
    project_id: Option<String>,
    job_id: Option<String>,
    /// Ids of earlier attempts of this slot.
    retired_ids: HashSet<String>,
    active: bool,
}

/// Maps provider events to the slots of one batch.
#[derive(Debug)]
pub struct EventCorrelator {
    slots: BTreeMap<JobIndex, Slot>,
    url_pattern: Regex,
}

impl EventCorrelator {
    pub fn new(url_pattern: Regex) -> Self {
        Self {
            slots: BTreeMap::new(),
            url_pattern,
        }
    }

    /// Start tracking an attempt of `index` in `project_id`.
    ///
    /// Any id known for the previous attempt is retired.
    pub fn bind(&mut self, index: JobIndex, project_id: &str, job_id: Option<&str>) {
        let slot = self.slots.entry(index).or_default();
        if let Some(old) = slot.job_id.take() {
            slot.retired_ids.insert(old);
        }
        slot.project_id = Some(project_id.to_string());
        slot.job_id = job_id.filter(|id| !id.is_empty()).map(str::to_string);
        slot.active = true;
    }

    /// Stop attributing events to `index`. Its id stays known so late
    /// events for it are recognised rather than mis-attributed.
    pub fn deactivate(&mut self, index: JobIndex) {
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.active = false;
        }
    }

    pub fn job_id(&self, index: JobIndex) -> Option<&str> {
        self.slots.get(&index)?.job_id.as_deref()
    }

    /// Job id carried by a result URL, if the configured pattern finds one.
    pub fn job_id_from_url(&self, url: &str) -> Option<String> {
        self.url_pattern
            .captures(url)
            .and_then(|caps| caps.name("job_id"))
            .map(|m| m.as_str().to_string())
    }

    /// Attribute `event`, received on the subscription of `source`.
    ///
    /// On a match the slot's id is cached if it was not known yet.
    pub fn attribute(&mut self, event: &ProviderEvent, source: JobIndex) -> Attribution {
        let url_id = event
            .result_url
            .as_deref()
            .and_then(|url| self.job_id_from_url(url));

        let candidates = [
            (event.job_id.clone(), Strategy::ExplicitId),
            (event.structured_job_id.clone(), Strategy::StructuredId),
            (url_id, Strategy::UrlPattern),
        ];

        for (id, strategy) in candidates.iter() {
            let Some(id) = id else { continue };
            if let Some(index) = self.index_for_id(id) {
                return Attribution::Matched {
                    index,
                    strategy: *strategy,
                };
            }
            if self.slots.values().any(|s| s.retired_ids.contains(id)) {
                return Attribution::Unattributed(Unattributed::StaleJobId(id.clone()));
            }
        }

        let event_id = candidates
            .into_iter()
            .find_map(|(id, strategy)| id.map(|id| (id, strategy)));

        let project_id = match event
            .project_id
            .clone()
            .or_else(|| self.slots.get(&source)?.project_id.clone())
        {
            Some(p) => p,
            None => return Attribution::Unattributed(Unattributed::NoProject),
        };

        let mut pending = self
            .slots
            .iter_mut()
            .filter(|(_, s)| s.active && s.project_id.as_deref() == Some(project_id.as_str()));

        let (index, slot) = match (pending.next(), pending.next()) {
            (Some(only), None) => only,
            (None, _) => {
                return Attribution::Unattributed(Unattributed::NoCandidate {
                    project_id: project_id.clone(),
                });
            }
            (Some(_), Some(_)) => {
                let candidates = 2 + pending.count();
                return Attribution::Unattributed(Unattributed::Ambiguous {
                    project_id: project_id.clone(),
                    candidates,
                });
            }
        };

        match (slot.job_id.clone(), event_id) {
            (Some(expected), Some((found, _))) => {
                Attribution::Unattributed(Unattributed::IdMismatch { expected, found })
            }
            (None, Some((found, strategy))) => {
                tracing::debug!(
                    index = *index,
                    job_id = %found,
                    strategy = strategy.as_str(),
                    "Learned job id",
                );
                slot.job_id = Some(found);
                Attribution::Matched {
                    index: *index,
                    strategy,
                }
            }
            (_, None) => Attribution::Matched {
                index: *index,
                strategy: Strategy::Elimination,
            },
        }
    }

    fn index_for_id(&self, id: &str) -> Option<JobIndex> {
        self.slots
            .iter()
            .find(|(_, s)| s.job_id.as_deref() == Some(id))
            .map(|(index, _)| *index)
    }
}
