use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::{JobId, MergeOutcome, ProgressStore, Realization, RealizationId};
use crate::hazard::curve::{CurveCollection, PoeCurve, SiteId, compose};
use crate::hazard::error::{HazardError, Result};
use crate::hazard::imt::ImtLevels;
use crate::hazard::logictree::RealizationSpec;
use crate::hazard::source::SourceId;

#[derive(Debug)]
struct Entry {
    record: Realization,
    sources: Vec<(SourceId, bool)>,
    progress: CurveCollection,
    hazard_curves: CurveCollection,
}

impl Entry {
    fn source_flag(&mut self, source_id: &str) -> Result<&mut bool> {
        let realization_id = self.record.id;
        self.sources
            .iter_mut()
            .find(|(id, _)| id == source_id)
            .map(|(_, flag)| flag)
            .ok_or_else(|| HazardError::SourceNotFound {
                realization_id,
                source_id: source_id.to_string(),
            })
    }

    /// Leaves the entry untouched when the contribution does not compose.
    fn merge(&mut self, contribution: CurveCollection) -> Result<MergeOutcome> {
        self.progress = compose(self.progress.clone(), contribution)?;

        if self.record.count_completed_source() {
            Ok(MergeOutcome::Completed(self.record.clone()))
        } else {
            Ok(MergeOutcome::Merged(self.record.clone()))
        }
    }
}

/// Process-local store with one lock per realization.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    entries: RwLock<BTreeMap<RealizationId, Arc<Mutex<Entry>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: RealizationId) -> Result<Arc<Mutex<Entry>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| HazardError::Poisoned("realization table"))?;
        entries
            .get(&id)
            .cloned()
            .ok_or(HazardError::RealizationNotFound(id))
    }
}

fn lock(entry: &Mutex<Entry>) -> Result<MutexGuard<'_, Entry>> {
    entry
        .lock()
        .map_err(|_| HazardError::Poisoned("realization entry"))
}

impl ProgressStore for MemoryStore {
    fn create_realization(
        &self,
        job_id: JobId,
        spec: &RealizationSpec,
        sources: &[SourceId],
        initial: &CurveCollection,
    ) -> Result<Realization> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = Realization::from_spec(id, job_id, spec, sources.len());
        let entry = Entry {
            record: record.clone(),
            sources: sources.iter().map(|source| (source.clone(), false)).collect(),
            progress: initial
                .iter()
                .filter(|(_, curve)| !curve.is_zero())
                .map(|(sid, curve)| (*sid, curve.clone()))
                .collect(),
            hazard_curves: CurveCollection::new(),
        };

        self.entries
            .write()
            .map_err(|_| HazardError::Poisoned("realization table"))?
            .insert(id, Arc::new(Mutex::new(entry)));

        Ok(record)
    }

    fn get_realization(&self, id: RealizationId) -> Result<Realization> {
        let entry = self.entry(id)?;
        let guard = lock(&entry)?;
        Ok(guard.record.clone())
    }

    fn list_realizations(&self, job_id: JobId) -> Result<Vec<Realization>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| HazardError::Poisoned("realization table"))?;

        let mut out = Vec::new();
        for entry in entries.values() {
            let guard = lock(entry)?;
            if guard.record.job_id == job_id {
                out.push(guard.record.clone());
            }
        }
        out.sort_by_key(|rlz| rlz.ordinal);
        Ok(out)
    }

    fn pending_sources(&self, id: RealizationId) -> Result<Vec<SourceId>> {
        let entry = self.entry(id)?;
        let guard = lock(&entry)?;
        Ok(guard
            .sources
            .iter()
            .filter(|(_, done)| !done)
            .map(|(source, _)| source.clone())
            .collect())
    }

    fn compare_and_set_source_progress(&self, id: RealizationId, source_id: &str) -> Result<bool> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry)?;
        let flag = guard.source_flag(source_id)?;
        if *flag {
            return Ok(false);
        }
        *flag = true;
        Ok(true)
    }

    fn merge_curve_progress(
        &self,
        id: RealizationId,
        contribution: CurveCollection,
    ) -> Result<MergeOutcome> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry)?;
        guard.merge(contribution)
    }

    fn record_source_completion(
        &self,
        id: RealizationId,
        source_id: &str,
        contribution: CurveCollection,
    ) -> Result<MergeOutcome> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry)?;

        if *guard.source_flag(source_id)? {
            return Ok(MergeOutcome::Duplicate);
        }
        let outcome = guard.merge(contribution)?;
        *guard.source_flag(source_id)? = true;

        Ok(outcome)
    }

    fn curve_progress(&self, id: RealizationId, _imtls: &ImtLevels) -> Result<CurveCollection> {
        let entry = self.entry(id)?;
        let guard = lock(&entry)?;
        Ok(guard.progress.clone())
    }

    fn store_hazard_curves(
        &self,
        id: RealizationId,
        curves: &CurveCollection,
        imtls: &ImtLevels,
        site_ids: &[SiteId],
    ) -> Result<()> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry)?;

        guard.hazard_curves = site_ids
            .iter()
            .map(|sid| {
                let curve = match curves.get(sid) {
                    Some(curve) => curve.branch(0)?,
                    None => PoeCurve::filled(Arc::clone(imtls.slices()), 1, 0.0),
                };
                Ok((*sid, curve))
            })
            .collect::<Result<CurveCollection>>()?;

        Ok(())
    }

    fn hazard_curves(&self, id: RealizationId, _imtls: &ImtLevels) -> Result<CurveCollection> {
        let entry = self.entry(id)?;
        let guard = lock(&entry)?;
        Ok(guard.hazard_curves.clone())
    }

    fn discard_realization(&self, id: RealizationId) -> Result<()> {
        let entry = self.entry(id)?;
        if lock(&entry)?.record.is_complete {
            return Err(HazardError::InvalidArgument(format!(
                "realization {id} is complete and cannot be discarded"
            )));
        }

        self.entries
            .write()
            .map_err(|_| HazardError::Poisoned("realization table"))?
            .remove(&id);
        Ok(())
    }
}
