//! Logic-tree realizations: which source model and which ground-motion
//! branch each realization uses, with its weight and seed.

use std::collections::HashSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::error::{HazardError, Result};

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub branch_id: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealizationSpec {
    pub ordinal: u32,
    pub seed: i64,
    pub weight: f64,
    pub sm_lt_path: Vec<String>,
    pub gsim_lt_path: Vec<String>,
    pub source_model_index: usize,
    pub gsim_index: usize,
}

#[derive(Debug, Clone)]
pub struct LogicTree {
    source_models: Vec<Branch>,
    gsims: Vec<Branch>,
}

impl LogicTree {
    pub fn new(source_models: Vec<Branch>, gsims: Vec<Branch>) -> Result<Self> {
        validate_branch_set("source model", &source_models)?;
        validate_branch_set("gsim", &gsims)?;
        Ok(Self {
            source_models,
            gsims,
        })
    }

    /// Samples `samples` realizations, or enumerates every path when zero.
    pub fn realizations(&self, samples: usize, master_seed: i64) -> Result<Vec<RealizationSpec>> {
        if samples == 0 {
            Ok(self.enumerate(master_seed))
        } else {
            self.sample(samples, master_seed)
        }
    }

    pub fn enumerate(&self, master_seed: i64) -> Vec<RealizationSpec> {
        let count = self.source_models.len() * self.gsims.len();
        let seeds = derive_seeds(master_seed, count);

        let paths = self.source_models.iter().enumerate().flat_map(|(sm_idx, sm)| {
            self.gsims
                .iter()
                .enumerate()
                .map(move |(gsim_idx, gsim)| (sm_idx, sm, gsim_idx, gsim))
        });

        paths
            .zip(seeds)
            .enumerate()
            .map(|(ordinal, ((sm_idx, sm, gsim_idx, gsim), seed))| RealizationSpec {
                ordinal: ordinal as u32,
                seed,
                weight: sm.weight * gsim.weight,
                sm_lt_path: vec![sm.branch_id.clone()],
                gsim_lt_path: vec![gsim.branch_id.clone()],
                source_model_index: sm_idx,
                gsim_index: gsim_idx,
            })
            .collect()
    }

    pub fn sample(&self, samples: usize, master_seed: i64) -> Result<Vec<RealizationSpec>> {
        let sm_dist = weighted_index("source model", &self.source_models)?;
        let gsim_dist = weighted_index("gsim", &self.gsims)?;
        let weight = 1.0 / samples as f64;

        Ok(derive_seeds(master_seed, samples)
            .into_iter()
            .enumerate()
            .map(|(ordinal, seed)| {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                let sm_idx = sm_dist.sample(&mut rng);
                let gsim_idx = gsim_dist.sample(&mut rng);
                RealizationSpec {
                    ordinal: ordinal as u32,
                    seed,
                    weight,
                    sm_lt_path: vec![self.source_models[sm_idx].branch_id.clone()],
                    gsim_lt_path: vec![self.gsims[gsim_idx].branch_id.clone()],
                    source_model_index: sm_idx,
                    gsim_index: gsim_idx,
                }
            })
            .collect())
    }
}

/// The first realization reuses the master seed; the rest are drawn from it.
fn derive_seeds(master_seed: i64, count: usize) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(master_seed as u64);
    let mut seeds = Vec::with_capacity(count);
    if count > 0 {
        seeds.push(master_seed);
    }
    while seeds.len() < count {
        seeds.push(rng.gen_range(0..i64::from(i32::MAX)));
    }
    seeds
}

fn weighted_index(kind: &str, branches: &[Branch]) -> Result<WeightedIndex<f64>> {
    WeightedIndex::new(branches.iter().map(|branch| branch.weight))
        .map_err(|err| HazardError::InvalidSpec(format!("invalid {kind} weights: {err}")))
}

fn validate_branch_set(kind: &str, branches: &[Branch]) -> Result<()> {
    if branches.is_empty() {
        return Err(HazardError::InvalidSpec(format!(
            "{kind} logic tree has no branches"
        )));
    }

    let mut seen = HashSet::new();
    for branch in branches {
        if !seen.insert(branch.branch_id.as_str()) {
            return Err(HazardError::InvalidSpec(format!(
                "duplicate {kind} branch id: {}",
                branch.branch_id
            )));
        }
        if !(branch.weight > 0.0 && branch.weight <= 1.0) {
            return Err(HazardError::InvalidSpec(format!(
                "{kind} branch {} has weight {} outside (0, 1]",
                branch.branch_id, branch.weight
            )));
        }
    }

    let total = branches.iter().map(|branch| branch.weight).sum::<f64>();
    if (total - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(HazardError::InvalidSpec(format!(
            "{kind} branch weights sum to {total}, expected 1"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(id: &str, weight: f64) -> Branch {
        Branch {
            branch_id: id.to_string(),
            weight,
        }
    }

    fn tree() -> LogicTree {
        LogicTree::new(
            vec![branch("b1", 0.6), branch("b2", 0.4)],
            vec![branch("g1", 0.5), branch("g2", 0.5)],
        )
        .unwrap()
    }

    #[test]
    fn enumeration_covers_every_path_with_product_weights() {
        let realizations = tree().realizations(0, 23).unwrap();
        assert_eq!(realizations.len(), 4);

        let total = realizations.iter().map(|rlz| rlz.weight).sum::<f64>();
        assert!((total - 1.0).abs() < 1e-12);

        assert_eq!(realizations[0].sm_lt_path, vec!["b1"]);
        assert_eq!(realizations[0].gsim_lt_path, vec!["g1"]);
        assert_eq!(realizations[3].sm_lt_path, vec!["b2"]);
        assert_eq!(realizations[3].gsim_lt_path, vec!["g2"]);
        assert!((realizations[1].weight - 0.3).abs() < 1e-12);
    }

    #[test]
    fn sampling_is_reproducible_from_the_master_seed() {
        let first = tree().realizations(5, 23).unwrap();
        let second = tree().realizations(5, 23).unwrap();
        assert_eq!(first, second);

        assert_eq!(first[0].seed, 23);
        assert!(first.iter().all(|rlz| (rlz.weight - 0.2).abs() < 1e-12));
        assert_eq!(
            first.iter().map(|rlz| rlz.ordinal).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn weights_must_sum_to_one() {
        let err = LogicTree::new(vec![branch("b1", 0.5)], vec![branch("g1", 1.0)]).unwrap_err();
        assert!(matches!(err, HazardError::InvalidSpec(_)));

        let err = LogicTree::new(
            vec![branch("b1", 0.5), branch("b1", 0.5)],
            vec![branch("g1", 1.0)],
        )
        .unwrap_err();
        assert!(matches!(err, HazardError::InvalidSpec(_)));
    }
}
