use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::hazard::calculator::ExecuteSummary;
use crate::hazard::curve::SiteId;
use crate::hazard::error::{HazardError, Result};
use crate::hazard::imt::{Imt, ImtLevels};
use crate::hazard::logictree::{Branch, LogicTree};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site_id: SiteId,
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceModelBranch {
    pub branch_id: String,
    pub weight: f64,
    pub source_model: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GsimBranch {
    pub branch_id: String,
    pub weight: f64,
    pub gsim: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub description: String,
    pub sites: Vec<SiteConfig>,
    pub intensity_measure_types_and_levels: BTreeMap<String, Vec<f64>>,
    pub source_model_logic_tree: Vec<SourceModelBranch>,
    pub gsim_logic_tree: Vec<GsimBranch>,
    #[serde(default)]
    pub number_of_logic_tree_samples: usize,
    #[serde(default = "default_random_seed")]
    pub random_seed: i64,
    #[serde(default)]
    pub poes_hazard_maps: Vec<f64>,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default)]
    pub mean_hazard_curves: bool,
}

fn default_random_seed() -> i64 {
    42
}

fn default_block_size() -> usize {
    10
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sites.is_empty() {
            return Err(HazardError::InvalidSpec("job has no sites".to_string()));
        }
        let mut seen = HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.site_id) {
                return Err(HazardError::InvalidSpec(format!(
                    "duplicate site id: {}",
                    site.site_id
                )));
            }
        }

        for imt in self.intensity_measure_types_and_levels.keys() {
            imt.parse::<Imt>()?;
        }
        validate_poes(&self.poes_hazard_maps)?;

        if self.block_size == 0 {
            return Err(HazardError::InvalidArgument(
                "block_size must be positive".to_string(),
            ));
        }

        self.logic_tree()?;
        self.imt_levels()?;
        Ok(())
    }

    pub fn imt_levels(&self) -> Result<ImtLevels> {
        ImtLevels::new(
            self.intensity_measure_types_and_levels
                .iter()
                .map(|(imt, levels)| (imt.as_str(), levels.clone())),
        )
    }

    pub fn logic_tree(&self) -> Result<LogicTree> {
        let source_models = self
            .source_model_logic_tree
            .iter()
            .map(|branch| Branch {
                branch_id: branch.branch_id.clone(),
                weight: branch.weight,
            })
            .collect();
        let gsims = self
            .gsim_logic_tree
            .iter()
            .map(|branch| Branch {
                branch_id: branch.branch_id.clone(),
                weight: branch.weight,
            })
            .collect();
        LogicTree::new(source_models, gsims)
    }

    pub fn site_ids(&self) -> Vec<SiteId> {
        self.sites.iter().map(|site| site.site_id).collect()
    }

    /// Makes relative source model paths absolute against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        for branch in &mut self.source_model_logic_tree {
            if branch.source_model.is_relative() {
                branch.source_model = base_dir.join(&branch.source_model);
            }
        }
    }
}

pub fn validate_poes(poes: &[f64]) -> Result<()> {
    for poe in poes {
        if !(0.0..=1.0).contains(poe) {
            return Err(HazardError::InvalidArgument(format!(
                "hazard map poe {poe} is outside [0, 1]"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcPaths {
    pub job_path: Option<String>,
    pub db_path: String,
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub command: String,
    pub job_id: i64,
    pub job_checksum: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u128,
    pub workers: usize,
    pub realizations_total: usize,
    pub realizations_complete: usize,
    pub summary: ExecuteSummary,
    pub paths: CalcPaths,
    pub outputs: Vec<String>,
    pub warnings: Vec<String>,
}
