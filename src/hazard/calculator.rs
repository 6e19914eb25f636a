//! Classical PSHA driver
//!
//! `pre_execute` creates the realization records, `tasks` splits each
//! realization's still-pending sources into blocks, `execute` runs the blocks
//! on the current rayon pool and `post_execute` turns finished realizations
//! into maps and reshaped curves. Progress lives in the store, so `tasks`
//! followed by `execute` is also how an interrupted job resumes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use super::curve::{CurveCollection, SiteId, weighted_mean};
use super::error::{HazardError, Result};
use super::imt::ImtLevels;
use super::logictree::RealizationSpec;
use super::maps::{HazardMap, hazard_maps_for_collection};
use super::progress::{MergeOutcome, ProgressStore, ProgressTracker, Realization, RealizationId};
use super::reshape::data_by_imt;
use super::source::{HazardModel, SourceId};

pub const MEAN_LABEL: &str = "mean";

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A run of sources of one realization, computed by one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub realization_id: RealizationId,
    pub ordinal: u32,
    pub source_model_index: usize,
    pub gsim: String,
    pub sources: Vec<SourceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecuteSummary {
    pub blocks_total: usize,
    pub blocks_run: usize,
    pub blocks_skipped: usize,
    pub sources_merged: usize,
    pub duplicate_events: usize,
    pub realizations_completed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct BlockStats {
    merged: usize,
    duplicates: usize,
    completed: usize,
}

enum BlockOutcome {
    Done(BlockStats),
    Skipped,
    Failed(HazardError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RealizationMaps {
    pub realization: String,
    pub weight: f64,
    pub maps: Vec<HazardMap>,
}

/// Per site: IMT -> level -> realization label -> PoE.
#[derive(Debug, Clone, Serialize)]
pub struct SiteCurves {
    pub site_id: SiteId,
    pub curves: BTreeMap<String, Vec<BTreeMap<String, f64>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HazardOutputs {
    pub maps: Vec<RealizationMaps>,
    pub curves: Vec<SiteCurves>,
    pub incomplete_realizations: Vec<u32>,
}

pub struct Calculator {
    source_models: Vec<Arc<dyn HazardModel>>,
    gsims: Vec<String>,
    block_size: usize,
}

impl Calculator {
    /// `source_models` and `gsims` are indexed like the logic-tree branches.
    pub fn new(
        source_models: Vec<Arc<dyn HazardModel>>,
        gsims: Vec<String>,
        block_size: usize,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(HazardError::InvalidArgument(
                "block size must be positive".to_string(),
            ));
        }
        Ok(Self {
            source_models,
            gsims,
            block_size,
        })
    }

    fn source_model(&self, index: usize) -> Result<&Arc<dyn HazardModel>> {
        self.source_models.get(index).ok_or_else(|| {
            HazardError::InvalidSpec(format!("no source model for branch index {index}"))
        })
    }

    fn gsim(&self, index: usize) -> Result<&str> {
        self.gsims
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| HazardError::InvalidSpec(format!("no gsim for branch index {index}")))
    }

    pub fn pre_execute<S: ProgressStore + ?Sized>(
        &self,
        tracker: &ProgressTracker<S>,
        specs: &[RealizationSpec],
    ) -> Result<Vec<Realization>> {
        for spec in specs {
            self.source_model(spec.source_model_index)?;
            self.gsim(spec.gsim_index)?;
        }

        let realizations = tracker.initialize_realizations(specs, |spec| {
            self.source_models
                .get(spec.source_model_index)
                .map(|model| model.source_ids())
                .unwrap_or_default()
        })?;

        info!(
            job_id = tracker.job().job_id,
            realizations = realizations.len(),
            sites = tracker.job().site_ids.len(),
            "initialized realizations"
        );
        Ok(realizations)
    }

    /// Blocks for every source still pending. Complete realizations yield
    /// nothing.
    pub fn tasks<S: ProgressStore + ?Sized>(
        &self,
        store: &S,
        specs: &[RealizationSpec],
        realizations: &[Realization],
    ) -> Result<Vec<Block>> {
        let by_ordinal = specs
            .iter()
            .map(|spec| (spec.ordinal, spec))
            .collect::<BTreeMap<u32, &RealizationSpec>>();

        let mut blocks = Vec::new();
        for realization in realizations.iter().filter(|rlz| !rlz.is_complete) {
            let spec = by_ordinal.get(&realization.ordinal).ok_or_else(|| {
                HazardError::InvalidSpec(format!(
                    "realization ordinal {} has no logic-tree path",
                    realization.ordinal
                ))
            })?;
            let gsim = self.gsim(spec.gsim_index)?;
            self.source_model(spec.source_model_index)?;

            let pending = store.pending_sources(realization.id)?;
            for chunk in pending.chunks(self.block_size) {
                blocks.push(Block {
                    realization_id: realization.id,
                    ordinal: realization.ordinal,
                    source_model_index: spec.source_model_index,
                    gsim: gsim.to_string(),
                    sources: chunk.to_vec(),
                });
            }
        }
        Ok(blocks)
    }

    /// Runs `blocks` in parallel. At most `max_blocks` are issued; once the
    /// token is cancelled no further block starts. The first failing block
    /// cancels the rest and its error is returned.
    pub fn execute<S: ProgressStore + ?Sized>(
        &self,
        tracker: &ProgressTracker<S>,
        blocks: Vec<Block>,
        max_blocks: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<ExecuteSummary> {
        let mut summary = ExecuteSummary {
            blocks_total: blocks.len(),
            ..ExecuteSummary::default()
        };
        let issued = match max_blocks {
            Some(limit) if limit < blocks.len() => &blocks[..limit],
            _ => &blocks[..],
        };
        summary.blocks_skipped = blocks.len() - issued.len();

        let outcomes = issued
            .par_iter()
            .map(|block| {
                if cancel.is_cancelled() {
                    return BlockOutcome::Skipped;
                }
                match self.run_block(tracker, block) {
                    Ok(stats) => BlockOutcome::Done(stats),
                    Err(err) => {
                        error!(
                            job_id = tracker.job().job_id,
                            realization = block.ordinal,
                            sources = block.sources.len(),
                            error = %err,
                            "block failed"
                        );
                        cancel.cancel();
                        BlockOutcome::Failed(err)
                    }
                }
            })
            .collect::<Vec<_>>();

        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                BlockOutcome::Done(stats) => {
                    summary.blocks_run += 1;
                    summary.sources_merged += stats.merged;
                    summary.duplicate_events += stats.duplicates;
                    summary.realizations_completed += stats.completed;
                }
                BlockOutcome::Skipped => summary.blocks_skipped += 1,
                BlockOutcome::Failed(err) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }
        summary.cancelled = cancel.is_cancelled() || summary.blocks_skipped > 0;

        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            job_id = tracker.job().job_id,
            blocks_run = summary.blocks_run,
            blocks_skipped = summary.blocks_skipped,
            sources = summary.sources_merged,
            completed = summary.realizations_completed,
            "execution finished"
        );
        Ok(summary)
    }

    fn run_block<S: ProgressStore + ?Sized>(
        &self,
        tracker: &ProgressTracker<S>,
        block: &Block,
    ) -> Result<BlockStats> {
        let model = self.source_model(block.source_model_index)?;
        let job = tracker.job();
        let mut stats = BlockStats::default();

        for source in &block.sources {
            let contribution = model.compute(source, &job.site_ids, &job.imtls, &block.gsim)?;
            match tracker.source_complete(block.realization_id, source, contribution)? {
                MergeOutcome::Duplicate => stats.duplicates += 1,
                MergeOutcome::Merged(_) => stats.merged += 1,
                MergeOutcome::Completed(_) => {
                    stats.merged += 1;
                    stats.completed += 1;
                }
            }
        }

        tracker.signal_task_complete(stats.merged as u64);
        Ok(stats)
    }

    /// Maps and reshaped curves of every complete realization, plus the
    /// weighted mean when requested and every realization is complete.
    pub fn post_execute<S: ProgressStore + ?Sized>(
        &self,
        tracker: &ProgressTracker<S>,
        poes: &[f64],
        mean_curves: bool,
    ) -> Result<HazardOutputs> {
        let job = tracker.job();
        let realizations = tracker.store().list_realizations(job.job_id)?;

        let mut finished = Vec::new();
        let mut incomplete = Vec::new();
        for realization in realizations {
            if !realization.is_complete {
                incomplete.push(realization.ordinal);
                continue;
            }
            let curves = tracker.store().hazard_curves(realization.id, &job.imtls)?;
            finished.push((realization, curves));
        }
        if !incomplete.is_empty() {
            warn!(
                job_id = job.job_id,
                incomplete = incomplete.len(),
                "skipping incomplete realizations"
            );
        }

        let mut labelled = finished
            .iter()
            .map(|(rlz, curves)| (format!("rlz-{}", rlz.ordinal), rlz.weight, curves.clone()))
            .collect::<Vec<_>>();

        if mean_curves && incomplete.is_empty() && !finished.is_empty() {
            let mean = weighted_mean(
                finished
                    .iter()
                    .map(|(rlz, curves)| (rlz.weight, curves.clone())),
            )?;
            labelled.push((MEAN_LABEL.to_string(), 1.0, mean));
        }

        let mut maps = Vec::with_capacity(labelled.len());
        for (label, weight, curves) in &labelled {
            maps.push(RealizationMaps {
                realization: label.clone(),
                weight: *weight,
                maps: hazard_maps_for_collection(curves, &job.imtls, &job.site_ids, poes)?,
            });
        }

        let curves = reshape_by_site(&labelled, &job.imtls, &job.site_ids)?;

        Ok(HazardOutputs {
            maps,
            curves,
            incomplete_realizations: incomplete,
        })
    }
}

fn reshape_by_site(
    labelled: &[(String, f64, CurveCollection)],
    imtls: &ImtLevels,
    site_ids: &[SiteId],
) -> Result<Vec<SiteCurves>> {
    let mut out = Vec::with_capacity(site_ids.len());

    for sid in site_ids {
        let mut by_realization = BTreeMap::new();
        for (label, _, curves) in labelled {
            let mut by_imt = BTreeMap::new();
            for (imt, levels) in imtls.iter() {
                let values = match curves.get(sid) {
                    Some(curve) => curve.get(imt)?.column(0).to_vec(),
                    None => vec![0.0; levels.len()],
                };
                by_imt.insert(imt.to_string(), values);
            }
            by_realization.insert(label.clone(), by_imt);
        }

        // levels differ per IMT, so each one is reshaped on its own
        let mut curves = BTreeMap::new();
        for (imt, levels) in imtls.iter() {
            curves.extend(data_by_imt(&by_realization, &[imt], levels.len())?);
        }

        out.push(SiteCurves {
            site_id: *sid,
            curves,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests;
