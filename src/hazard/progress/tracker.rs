use std::sync::Arc;

use tracing::{debug, info};

use super::signal::{CompletionSignal, Exchange};
use super::{JobId, MergeOutcome, ProgressStore, Realization, RealizationId};
use crate::hazard::curve::{CurveCollection, SiteId, build};
use crate::hazard::error::{HazardError, Result};
use crate::hazard::imt::ImtLevels;
use crate::hazard::logictree::RealizationSpec;
use crate::hazard::source::SourceId;

/// What every realization of a job shares.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub imtls: Arc<ImtLevels>,
    pub site_ids: Vec<SiteId>,
}

pub struct ProgressTracker<S: ProgressStore + ?Sized> {
    store: Arc<S>,
    job: JobContext,
    exchange: Option<Exchange>,
}

impl<S: ProgressStore + ?Sized> ProgressTracker<S> {
    pub fn new(store: Arc<S>, job: JobContext) -> Self {
        Self {
            store,
            job,
            exchange: None,
        }
    }

    pub fn with_exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn job(&self) -> &JobContext {
        &self.job
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Creates one record per realization, with a false progress flag for
    /// every source of its source model and zero curves over all sites.
    /// Realizations without sources are finalized right away.
    pub fn initialize_realizations<F>(
        &self,
        specs: &[RealizationSpec],
        mut sources_for: F,
    ) -> Result<Vec<Realization>>
    where
        F: FnMut(&RealizationSpec) -> Vec<SourceId>,
    {
        let initial = build(&self.job.imtls, 1, self.job.site_ids.iter().copied(), 0.0);

        specs
            .iter()
            .map(|spec| {
                let sources = sources_for(spec);
                let realization =
                    self.store
                        .create_realization(self.job.job_id, spec, &sources, &initial)?;
                debug!(
                    job_id = self.job.job_id,
                    realization = realization.ordinal,
                    sources = sources.len(),
                    "initialized realization"
                );
                // nothing will ever be merged into it
                if realization.is_complete {
                    self.finalize(&realization)?;
                }
                Ok(realization)
            })
            .collect()
    }

    /// Handles one source-completion event. Duplicates are dropped; the
    /// event that completes the realization also finalizes it.
    pub fn source_complete(
        &self,
        realization_id: RealizationId,
        source_id: &str,
        contribution: CurveCollection,
    ) -> Result<MergeOutcome> {
        self.check_contribution(&contribution)?;

        let outcome = self
            .store
            .record_source_completion(realization_id, source_id, contribution)?;

        match &outcome {
            MergeOutcome::Duplicate => {
                debug!(
                    job_id = self.job.job_id,
                    realization_id, source_id, "duplicate source completion ignored"
                );
            }
            MergeOutcome::Merged(realization) => {
                debug!(
                    job_id = self.job.job_id,
                    realization = realization.ordinal,
                    completed = realization.completed_sources,
                    total = realization.total_sources,
                    "source merged"
                );
            }
            MergeOutcome::Completed(realization) => {
                self.finalize(realization)?;
            }
        }

        Ok(outcome)
    }

    /// Copies the accumulated curves into the hazard curve table.
    pub fn finalize(&self, realization: &Realization) -> Result<()> {
        if !realization.is_complete {
            return Err(HazardError::InvalidArgument(format!(
                "realization {} has {} of {} sources and cannot be finalized",
                realization.id, realization.completed_sources, realization.total_sources
            )));
        }

        let curves = self.store.curve_progress(realization.id, &self.job.imtls)?;
        self.store.store_hazard_curves(
            realization.id,
            &curves,
            &self.job.imtls,
            &self.job.site_ids,
        )?;

        info!(
            job_id = self.job.job_id,
            realization = realization.ordinal,
            sites = self.job.site_ids.len(),
            "realization complete"
        );
        Ok(())
    }

    /// Advisory; returns how many coordinators were reached.
    pub fn signal_task_complete(&self, num_sources: u64) -> usize {
        match &self.exchange {
            Some(exchange) => exchange.publish(&CompletionSignal {
                job_id: self.job.job_id,
                num_sources,
            }),
            None => 0,
        }
    }

    fn check_contribution(&self, contribution: &CurveCollection) -> Result<()> {
        let slices = self.job.imtls.slices();
        for curve in contribution.values() {
            if !Arc::ptr_eq(curve.slices(), slices) && curve.slices() != slices {
                return Err(HazardError::InvalidArgument(
                    "contribution uses a different IMT layout than the job".to_string(),
                ));
            }
            if curve.num_branches() != 1 {
                return Err(HazardError::shape(
                    "contribution branches",
                    1,
                    curve.num_branches(),
                ));
            }
        }
        Ok(())
    }
}
