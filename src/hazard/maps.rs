//! Hazard maps: the intensity level at which a curve crosses a target PoE.

use serde::Serialize;

use super::curve::{CurveCollection, SiteId};
use super::error::{HazardError, Result};
use super::imt::ImtLevels;

/// One threshold or several.
#[derive(Debug, Clone, PartialEq)]
pub enum Thresholds {
    One(f64),
    Many(Vec<f64>),
}

impl Thresholds {
    fn into_vec(self) -> Vec<f64> {
        match self {
            Self::One(poe) => vec![poe],
            Self::Many(poes) => poes,
        }
    }
}

impl From<f64> for Thresholds {
    fn from(poe: f64) -> Self {
        Self::One(poe)
    }
}

impl From<Vec<f64>> for Thresholds {
    fn from(poes: Vec<f64>) -> Self {
        Self::Many(poes)
    }
}

impl From<&[f64]> for Thresholds {
    fn from(poes: &[f64]) -> Self {
        Self::Many(poes.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for Thresholds {
    fn from(poes: [f64; N]) -> Self {
        Self::Many(poes.to_vec())
    }
}

/// Computes one map per threshold; the result is indexed `[threshold][site]`.
///
/// Curves are read once, in order, and are assumed non-increasing. Thresholds
/// are expected in `[0, 1]`; that is not checked here. A threshold above the
/// curve's first value maps to `0`, one below its last value maps to the
/// highest level, and anything in between is interpolated in log-log space.
pub fn compute_hazard_maps<I, C>(
    curves: I,
    imls: &[f64],
    poes: impl Into<Thresholds>,
) -> Result<Vec<Vec<f64>>>
where
    I: IntoIterator<Item = C>,
    C: AsRef<[f64]>,
{
    if imls.is_empty() {
        return Err(HazardError::InvalidArgument(
            "hazard maps need at least one intensity level".to_string(),
        ));
    }

    let poes = poes.into().into_vec();
    let mut maps = vec![Vec::new(); poes.len()];

    for curve in curves {
        let curve = curve.as_ref();
        if curve.len() != imls.len() {
            return Err(HazardError::shape("hazard curve", imls.len(), curve.len()));
        }
        for (row, poe) in maps.iter_mut().zip(&poes) {
            row.push(iml_at(curve, imls, *poe));
        }
    }

    Ok(maps)
}

fn iml_at(curve: &[f64], imls: &[f64], poe: f64) -> f64 {
    let last = curve.len() - 1;

    if poe > curve[0] {
        return 0.0;
    }
    if poe < curve[last] {
        return imls[last];
    }
    if let Some(idx) = curve.iter().position(|value| *value == poe) {
        return imls[idx];
    }

    let idx = curve
        .windows(2)
        .position(|pair| pair[0] > poe && poe > pair[1])
        .unwrap_or(0);

    let (x1, x2) = (imls[idx].ln(), imls[idx + 1].ln());
    let (y1, y2) = (curve[idx].ln(), curve[idx + 1].ln());
    (x1 + (poe.ln() - y1) * (x2 - x1) / (y2 - y1)).exp()
}

#[derive(Debug, Clone, Serialize)]
pub struct HazardMap {
    pub imt: String,
    pub poe: f64,
    pub values: Vec<f64>,
}

/// Maps for every IMT of a single-branch collection, one value per entry of
/// `site_ids`. Sites absent from the collection have an all-zero curve.
pub fn hazard_maps_for_collection(
    collection: &CurveCollection,
    imtls: &ImtLevels,
    site_ids: &[SiteId],
    poes: &[f64],
) -> Result<Vec<HazardMap>> {
    let mut out = Vec::new();

    for (imt, imls) in imtls.iter() {
        let mut curves = Vec::with_capacity(site_ids.len());
        for sid in site_ids {
            let values = match collection.get(sid) {
                Some(curve) => curve.get(imt)?.column(0).to_vec(),
                None => vec![0.0; imls.len()],
            };
            curves.push(values);
        }

        let maps = compute_hazard_maps(curves, imls, poes)?;
        for (poe, values) in poes.iter().zip(maps) {
            out.push(HazardMap {
                imt: imt.to_string(),
                poe: *poe,
                values,
            });
        }
    }

    Ok(out)
}
