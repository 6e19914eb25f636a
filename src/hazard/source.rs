//! Hazard model collaborators
//!
//! The calculator never looks inside a source or a ground-motion model; it
//! only asks a [`HazardModel`] for the PoE contribution of one source at a
//! set of sites. [`TabulatedSourceModel`] replays pre-computed per-rupture
//! tables.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use super::curve::{
    CurveCollection, PoeCurve, SiteId, complement, extract, multiply_collections,
};
use super::error::{HazardError, Result};
use super::imt::ImtLevels;

pub type SourceId = String;

pub trait HazardModel: Send + Sync {
    fn source_ids(&self) -> Vec<SourceId>;

    /// Single-branch PoE contribution of `source_id` for the given gsim.
    /// Sites the source does not reach may be absent from the result.
    fn compute(
        &self,
        source_id: &str,
        sites: &[SiteId],
        imtls: &ImtLevels,
        gsim: &str,
    ) -> Result<CurveCollection>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabulatedSourceModel {
    pub gsims: Vec<String>,
    pub sources: Vec<TabulatedSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabulatedSource {
    pub source_id: String,
    pub ruptures: Vec<TabulatedRupture>,
}

/// Site -> IMT -> one level array per gsim.
#[derive(Debug, Clone, Deserialize)]
pub struct TabulatedRupture {
    pub poes: BTreeMap<SiteId, BTreeMap<String, Vec<Vec<f64>>>>,
}

impl TabulatedSourceModel {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        let model: Self = serde_json::from_slice(&raw)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if self.gsims.is_empty() {
            return Err(HazardError::InvalidSpec(
                "source model lists no gsims".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(HazardError::InvalidSpec(format!(
                    "duplicate source id: {}",
                    source.source_id
                )));
            }
        }
        Ok(())
    }

    fn gsim_index(&self, gsim: &str) -> Result<usize> {
        self.gsims
            .iter()
            .position(|name| name == gsim)
            .ok_or_else(|| HazardError::KeyNotFound(gsim.to_string()))
    }
}

impl TabulatedRupture {
    fn curves(
        &self,
        imtls: &ImtLevels,
        num_gsims: usize,
        wanted: &HashSet<SiteId>,
    ) -> Result<CurveCollection> {
        let mut out = CurveCollection::new();

        for (sid, by_imt) in &self.poes {
            if !wanted.contains(sid) {
                continue;
            }
            let mut curve = PoeCurve::filled(Arc::clone(imtls.slices()), num_gsims, 0.0);
            for (imt, per_gsim) in by_imt {
                if per_gsim.len() != num_gsims {
                    return Err(HazardError::shape("rupture gsims", num_gsims, per_gsim.len()));
                }
                for (gsim_idx, levels) in per_gsim.iter().enumerate() {
                    curve.set_branch(imt, gsim_idx, levels)?;
                }
            }
            out.insert(*sid, curve);
        }

        Ok(out)
    }
}

impl HazardModel for TabulatedSourceModel {
    fn source_ids(&self) -> Vec<SourceId> {
        self.sources
            .iter()
            .map(|source| source.source_id.clone())
            .collect()
    }

    fn compute(
        &self,
        source_id: &str,
        sites: &[SiteId],
        imtls: &ImtLevels,
        gsim: &str,
    ) -> Result<CurveCollection> {
        let source = self
            .sources
            .iter()
            .find(|source| source.source_id == source_id)
            .ok_or_else(|| HazardError::KeyNotFound(source_id.to_string()))?;
        let gsim_idx = self.gsim_index(gsim)?;
        let wanted = sites.iter().copied().collect::<HashSet<SiteId>>();

        // ruptures are independent: P(no exceedance) is the product over ruptures
        let mut non_exceedance = CurveCollection::new();
        for rupture in &source.ruptures {
            let complements = rupture
                .curves(imtls, self.gsims.len(), &wanted)?
                .into_iter()
                .map(|(sid, curve)| (sid, complement(&curve)))
                .collect();
            non_exceedance = multiply_collections(non_exceedance, complements)?;
        }

        let poes = non_exceedance
            .into_iter()
            .map(|(sid, curve)| (sid, complement(&curve)))
            .collect::<CurveCollection>();

        extract(&poes, gsim_idx)
    }
}
