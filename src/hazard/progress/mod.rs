//! Per-realization progress: source completion flags, accumulated curves and
//! the completion state machine.
//!
//! The store is the authority. Every source-completion event goes through
//! [`ProgressStore::record_source_completion`], which flips the source's flag
//! and merges its curves as one atomic step per realization; a second
//! delivery of the same event finds the flag already set and is dropped.

use serde::Serialize;

use super::curve::{CurveCollection, SiteId};
use super::error::Result;
use super::imt::ImtLevels;
use super::logictree::RealizationSpec;
use super::source::SourceId;

mod memory;
mod signal;
mod sqlite;
mod tracker;

pub use memory::MemoryStore;
pub use signal::{
    CompletionSignal, EXCHANGE_NAME, Exchange, Mailbox, SignalMonitor, routing_key,
};
pub use sqlite::{JobRecord, SqliteStore};
pub use tracker::{JobContext, ProgressTracker};

pub type JobId = i64;
pub type RealizationId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RealizationState {
    Pending,
    InProgress,
    Complete,
}

impl RealizationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Realization {
    pub id: RealizationId,
    pub job_id: JobId,
    pub ordinal: u32,
    pub seed: i64,
    pub weight: f64,
    pub sm_lt_path: Vec<String>,
    pub gsim_lt_path: Vec<String>,
    pub total_sources: usize,
    pub completed_sources: usize,
    pub is_complete: bool,
}

impl Realization {
    pub(crate) fn from_spec(
        id: RealizationId,
        job_id: JobId,
        spec: &RealizationSpec,
        total_sources: usize,
    ) -> Self {
        Self {
            id,
            job_id,
            ordinal: spec.ordinal,
            seed: spec.seed,
            weight: spec.weight,
            sm_lt_path: spec.sm_lt_path.clone(),
            gsim_lt_path: spec.gsim_lt_path.clone(),
            total_sources,
            completed_sources: 0,
            is_complete: total_sources == 0,
        }
    }

    pub fn state(&self) -> RealizationState {
        if self.is_complete {
            RealizationState::Complete
        } else if self.completed_sources == 0 {
            RealizationState::Pending
        } else {
            RealizationState::InProgress
        }
    }

    /// Bumps the counter and reports whether this call completed the
    /// realization.
    pub(crate) fn count_completed_source(&mut self) -> bool {
        self.completed_sources += 1;
        if !self.is_complete && self.completed_sources >= self.total_sources {
            self.is_complete = true;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The source had already been merged; nothing changed.
    Duplicate,
    Merged(Realization),
    /// This merge completed the realization. Reported exactly once.
    Completed(Realization),
}

/// Transactional repository for realization progress.
///
/// Implementations must make `merge_curve_progress` and
/// `record_source_completion` atomic per realization; different realizations
/// need no coordination.
pub trait ProgressStore: Send + Sync {
    /// A realization without sources is created complete.
    fn create_realization(
        &self,
        job_id: JobId,
        spec: &RealizationSpec,
        sources: &[SourceId],
        initial: &CurveCollection,
    ) -> Result<Realization>;

    fn get_realization(&self, id: RealizationId) -> Result<Realization>;

    fn list_realizations(&self, job_id: JobId) -> Result<Vec<Realization>>;

    /// Sources of the realization whose progress flag is still false.
    fn pending_sources(&self, id: RealizationId) -> Result<Vec<SourceId>>;

    /// Flips the flag from false to true; `false` means it was already set.
    fn compare_and_set_source_progress(&self, id: RealizationId, source_id: &str) -> Result<bool>;

    /// OR-combines `contribution` into the curve progress and counts one more
    /// completed source.
    fn merge_curve_progress(
        &self,
        id: RealizationId,
        contribution: CurveCollection,
    ) -> Result<MergeOutcome>;

    /// Flag flip and merge as one step: on error neither is applied.
    fn record_source_completion(
        &self,
        id: RealizationId,
        source_id: &str,
        contribution: CurveCollection,
    ) -> Result<MergeOutcome>;

    fn curve_progress(&self, id: RealizationId, imtls: &ImtLevels) -> Result<CurveCollection>;

    /// Writes the final single-branch curves of every site in `site_ids`.
    fn store_hazard_curves(
        &self,
        id: RealizationId,
        curves: &CurveCollection,
        imtls: &ImtLevels,
        site_ids: &[SiteId],
    ) -> Result<()>;

    /// Final curves; empty when the realization was never finalized.
    fn hazard_curves(&self, id: RealizationId, imtls: &ImtLevels) -> Result<CurveCollection>;

    /// Drops an unfinished realization with all of its progress.
    fn discard_realization(&self, id: RealizationId) -> Result<()>;
}
