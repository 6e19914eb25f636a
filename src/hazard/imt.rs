//! Intensity measure types and the IMT-level index
//!
//! Every curve buffer in the crate is laid out by an [`ImtSlices`] table: each
//! IMT owns a contiguous half-open range of rows, IMTs are laid out in sorted
//! name order, and the ranges cover the buffer exactly.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;

use super::error::{HazardError, Result};

pub const DEFAULT_SA_DAMPING: f64 = 5.0;

/// A parsed intensity measure type.
///
/// `Display` prints the canonical name: `"SA(0.10)"` and `"SA(.1)"` both
/// print as `SA(0.1)`. Index keys use the name as written in the job file.
#[derive(Debug, Clone, PartialEq)]
pub enum Imt {
    Pga,
    Pgv,
    Pgd,
    Sa { period: f64, damping: f64 },
    Ia,
    Rsd,
    Mmi,
}

impl FromStr for Imt {
    type Err = HazardError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "PGA" => Ok(Self::Pga),
            "PGV" => Ok(Self::Pgv),
            "PGD" => Ok(Self::Pgd),
            "IA" => Ok(Self::Ia),
            "RSD" => Ok(Self::Rsd),
            "MMI" => Ok(Self::Mmi),
            other => {
                let pattern = Regex::new(r"^SA\((\d+(?:\.\d*)?|\.\d+)\)$").map_err(|err| {
                    HazardError::InvalidSpec(format!("failed to compile SA pattern: {err}"))
                })?;
                let captures = pattern.captures(other).ok_or_else(|| {
                    HazardError::InvalidSpec(format!("unknown intensity measure type: {other}"))
                })?;
                let period = captures[1].parse::<f64>().map_err(|err| {
                    HazardError::InvalidSpec(format!("invalid SA period in {other}: {err}"))
                })?;
                Ok(Self::Sa {
                    period,
                    damping: DEFAULT_SA_DAMPING,
                })
            }
        }
    }
}

impl fmt::Display for Imt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pga => f.write_str("PGA"),
            Self::Pgv => f.write_str("PGV"),
            Self::Pgd => f.write_str("PGD"),
            Self::Sa { period, .. } => write!(f, "SA({period})"),
            Self::Ia => f.write_str("IA"),
            Self::Rsd => f.write_str("RSD"),
            Self::Mmi => f.write_str("MMI"),
        }
    }
}

/// Offset table: IMT name -> rows of a flat curve buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImtSlices {
    names: Vec<String>,
    ranges: Vec<Range<usize>>,
    num_levels: usize,
}

impl ImtSlices {
    pub fn from_counts<I, S>(counts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut sorted = BTreeMap::<String, usize>::new();
        for (name, count) in counts {
            let name = name.into();
            if count == 0 {
                return Err(HazardError::InvalidSpec(format!(
                    "intensity measure type {name} has no levels"
                )));
            }
            if sorted.insert(name.clone(), count).is_some() {
                return Err(HazardError::InvalidSpec(format!(
                    "duplicate intensity measure type: {name}"
                )));
            }
        }

        if sorted.is_empty() {
            return Err(HazardError::InvalidSpec(
                "no intensity measure types given".to_string(),
            ));
        }

        let mut names = Vec::with_capacity(sorted.len());
        let mut ranges = Vec::with_capacity(sorted.len());
        let mut offset = 0;
        for (name, count) in sorted {
            names.push(name);
            ranges.push(offset..offset + count);
            offset += count;
        }

        Ok(Self {
            names,
            ranges,
            num_levels: offset,
        })
    }

    pub fn range(&self, imt: &str) -> Result<Range<usize>> {
        self.names
            .binary_search_by(|name| name.as_str().cmp(imt))
            .map(|idx| self.ranges[idx].clone())
            .map_err(|_| HazardError::KeyNotFound(imt.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Range<usize>)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.ranges.iter().cloned())
    }

    /// Number of IMTs.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Total buffer length across all IMTs.
    pub fn num_levels(&self) -> usize {
        self.num_levels
    }
}

/// Intensity measure types together with their levels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImtLevels {
    slices: Arc<ImtSlices>,
    array: Vec<f64>,
}

impl ImtLevels {
    pub fn new<I, S>(imtls: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let imtls = imtls
            .into_iter()
            .map(|(name, levels)| (name.into(), levels))
            .collect::<Vec<(String, Vec<f64>)>>();

        let mut index = Self::with_counts(
            imtls
                .iter()
                .map(|(name, levels)| (name.clone(), levels.len())),
        )?;
        for (name, levels) in &imtls {
            index.set(name, levels)?;
        }

        Ok(index)
    }

    /// Index with zeroed levels, for callers that only need the layout.
    pub fn with_counts<I, S>(counts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let slices = ImtSlices::from_counts(counts)?;
        let array = vec![0.0; slices.num_levels()];
        Ok(Self {
            slices: Arc::new(slices),
            array,
        })
    }

    pub fn get(&self, imt: &str) -> Result<&[f64]> {
        let range = self.slices.range(imt)?;
        Ok(&self.array[range])
    }

    pub fn set(&mut self, imt: &str, levels: &[f64]) -> Result<()> {
        let range = self.slices.range(imt)?;
        if range.len() != levels.len() {
            return Err(HazardError::shape("imt levels", range.len(), levels.len()));
        }
        self.array[range].copy_from_slice(levels);
        Ok(())
    }

    pub fn imts(&self) -> impl Iterator<Item = &str> {
        self.slices.names()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.slices
            .iter()
            .map(|(name, range)| (name, &self.array[range]))
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn num_levels(&self) -> usize {
        self.slices.num_levels()
    }

    pub fn slices(&self) -> &Arc<ImtSlices> {
        &self.slices
    }
}
