//! Probability-of-exceedance curves and their algebra
//!
//! A [`PoeCurve`] is a `levels x branches` buffer laid out by an
//! [`ImtSlices`] table. Curves for independent contributions combine with the
//! inclusive-or rule `p = 1 - (1 - p1)(1 - p2)`. The identities of the two
//! monoids ("nothing has exceeded yet" and "no weighting yet") are carried
//! explicitly by [`Poe::Zero`] and [`Poe::One`] so that an untouched
//! accumulator never needs a buffer of its own.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip, s};

use super::error::{HazardError, Result};
use super::imt::{ImtLevels, ImtSlices};

pub type SiteId = u32;

/// Site id -> curve. Sites whose curve is exactly zero may be absent.
pub type CurveCollection = BTreeMap<SiteId, PoeCurve>;

#[derive(Debug, Clone, PartialEq)]
pub struct PoeCurve {
    slices: Arc<ImtSlices>,
    array: Array2<f64>,
}

impl PoeCurve {
    pub fn new(slices: Arc<ImtSlices>, array: Array2<f64>) -> Result<Self> {
        if array.nrows() != slices.num_levels() {
            return Err(HazardError::shape(
                "curve rows",
                slices.num_levels(),
                array.nrows(),
            ));
        }
        Ok(Self { slices, array })
    }

    pub fn filled(slices: Arc<ImtSlices>, branches: usize, value: f64) -> Self {
        let array = Array2::from_elem((slices.num_levels(), branches), value);
        Self { slices, array }
    }

    /// Rebuilds a curve from its row-major flat values.
    pub fn from_flat(slices: Arc<ImtSlices>, branches: usize, values: Vec<f64>) -> Result<Self> {
        let expected = slices.num_levels() * branches;
        let actual = values.len();
        let array = Array2::from_shape_vec((slices.num_levels(), branches), values)
            .map_err(|_| HazardError::shape("flat curve", expected, actual))?;
        Ok(Self { slices, array })
    }

    pub fn get(&self, imt: &str) -> Result<ArrayView2<'_, f64>> {
        let range = self.slices.range(imt)?;
        Ok(self.array.slice(s![range.start..range.end, ..]))
    }

    /// Assigns `values` to every branch of the IMT's rows.
    pub fn set(&mut self, imt: &str, values: &[f64]) -> Result<()> {
        let range = self.slices.range(imt)?;
        if range.len() != values.len() {
            return Err(HazardError::shape("curve levels", range.len(), values.len()));
        }
        for (row, value) in range.zip(values) {
            self.array.row_mut(row).fill(*value);
        }
        Ok(())
    }

    pub fn set_branch(&mut self, imt: &str, branch: usize, values: &[f64]) -> Result<()> {
        let range = self.slices.range(imt)?;
        if range.len() != values.len() {
            return Err(HazardError::shape("curve levels", range.len(), values.len()));
        }
        self.check_branch(branch)?;
        self.array
            .slice_mut(s![range.start..range.end, branch])
            .assign(&ArrayView1::from(values));
        Ok(())
    }

    /// Single-branch copy of column `branch`.
    pub fn branch(&self, branch: usize) -> Result<Self> {
        self.check_branch(branch)?;
        let column = self.array.column(branch).to_owned().insert_axis(Axis(1));
        Ok(Self {
            slices: Arc::clone(&self.slices),
            array: column,
        })
    }

    pub fn array(&self) -> &Array2<f64> {
        &self.array
    }

    pub fn slices(&self) -> &Arc<ImtSlices> {
        &self.slices
    }

    pub fn num_branches(&self) -> usize {
        self.array.ncols()
    }

    /// Exact test: the buffer sums to zero.
    pub fn is_zero(&self) -> bool {
        self.array.sum() == 0.0
    }

    pub fn to_flat(&self) -> Vec<f64> {
        self.array.iter().copied().collect()
    }

    fn check_branch(&self, branch: usize) -> Result<()> {
        if branch >= self.array.ncols() {
            return Err(HazardError::InvalidArgument(format!(
                "branch index {branch} out of range for {} branches",
                self.array.ncols()
            )));
        }
        Ok(())
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if !Arc::ptr_eq(&self.slices, &other.slices) && self.slices != other.slices {
            return Err(HazardError::InvalidArgument(
                "curves use different IMT layouts".to_string(),
            ));
        }
        if self.array.ncols() != other.array.ncols() {
            return Err(HazardError::shape(
                "curve branches",
                self.array.ncols(),
                other.array.ncols(),
            ));
        }
        Ok(())
    }
}

/// A curve, or one of the two identity elements.
#[derive(Debug, Clone, PartialEq)]
pub enum Poe {
    /// Nothing exceeded yet; identity of [`combine_or`].
    Zero,
    /// No weighting yet; identity of [`multiply`].
    One,
    Curve(PoeCurve),
}

impl Poe {
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Zero => true,
            Self::One => false,
            Self::Curve(curve) => curve.is_zero(),
        }
    }

    pub fn into_curve(self) -> Option<PoeCurve> {
        match self {
            Self::Curve(curve) => Some(curve),
            Self::Zero | Self::One => None,
        }
    }
}

impl From<PoeCurve> for Poe {
    fn from(curve: PoeCurve) -> Self {
        Self::Curve(curve)
    }
}

pub fn complement(curve: &PoeCurve) -> PoeCurve {
    PoeCurve {
        slices: Arc::clone(&curve.slices),
        array: curve.array.mapv(|p| 1.0 - p),
    }
}

/// Inclusive or of two independent exceedance probabilities.
pub fn combine_or(a: Poe, b: Poe) -> Result<Poe> {
    match (a, b) {
        (Poe::Zero, other) | (other, Poe::Zero) => Ok(other),
        (Poe::One, _) | (_, Poe::One) => Ok(Poe::One),
        (Poe::Curve(mut a), Poe::Curve(b)) => {
            a.check_compatible(&b)?;
            Zip::from(&mut a.array)
                .and(&b.array)
                .for_each(|x, &y| *x = 1.0 - (1.0 - *x) * (1.0 - y));
            Ok(Poe::Curve(a))
        }
    }
}

/// Multiplies by a scalar weight; a weight of exactly 1 hands the input back.
pub fn scale(poe: Poe, weight: f64) -> Result<Poe> {
    if weight == 1.0 {
        return Ok(poe);
    }
    match poe {
        Poe::Zero => Ok(Poe::Zero),
        _ if weight == 0.0 => Ok(Poe::Zero),
        Poe::One => Err(HazardError::InvalidArgument(format!(
            "cannot scale the shapeless unit curve by {weight}"
        ))),
        Poe::Curve(mut curve) => {
            curve.array.mapv_inplace(|p| p * weight);
            Ok(Poe::Curve(curve))
        }
    }
}

pub fn multiply(a: Poe, b: Poe) -> Result<Poe> {
    match (a, b) {
        (Poe::One, other) | (other, Poe::One) => Ok(other),
        (Poe::Zero, _) | (_, Poe::Zero) => Ok(Poe::Zero),
        (Poe::Curve(mut a), Poe::Curve(b)) => {
            a.check_compatible(&b)?;
            a.array *= &b.array;
            Ok(Poe::Curve(a))
        }
    }
}

/// One `branches`-wide curve per site, every value set to `initial`.
pub fn build<I>(imtls: &ImtLevels, branches: usize, sites: I, initial: f64) -> CurveCollection
where
    I: IntoIterator<Item = SiteId>,
{
    sites
        .into_iter()
        .map(|sid| {
            (
                sid,
                PoeCurve::filled(Arc::clone(imtls.slices()), branches, initial),
            )
        })
        .collect()
}

/// Site-wise [`combine_or`] over the union of both key sets. Sites whose
/// combined curve is exactly zero are left out of the result.
pub fn compose(left: CurveCollection, mut right: CurveCollection) -> Result<CurveCollection> {
    let mut out = CurveCollection::new();

    for (sid, curve) in left {
        let other = right.remove(&sid).map(Poe::Curve).unwrap_or(Poe::Zero);
        let combined = combine_or(Poe::Curve(curve), other)?;
        if !combined.is_zero() {
            if let Some(curve) = combined.into_curve() {
                out.insert(sid, curve);
            }
        }
    }

    for (sid, curve) in right {
        if !curve.is_zero() {
            out.insert(sid, curve);
        }
    }

    Ok(out)
}

/// Site-wise [`multiply`]; a site missing on one side is taken as one.
pub fn multiply_collections(
    left: CurveCollection,
    mut right: CurveCollection,
) -> Result<CurveCollection> {
    let mut out = CurveCollection::new();

    for (sid, curve) in left {
        let other = right.remove(&sid).map(Poe::Curve).unwrap_or(Poe::One);
        match multiply(Poe::Curve(curve), other)? {
            Poe::Curve(product) => {
                out.insert(sid, product);
            }
            Poe::Zero | Poe::One => {}
        }
    }
    out.extend(right);

    Ok(out)
}

pub fn extract(collection: &CurveCollection, branch: usize) -> Result<CurveCollection> {
    collection
        .iter()
        .map(|(sid, curve)| curve.branch(branch).map(|single| (*sid, single)))
        .collect()
}

/// Weighted sum of collections, site by site.
pub fn weighted_mean<I>(members: I) -> Result<CurveCollection>
where
    I: IntoIterator<Item = (f64, CurveCollection)>,
{
    let mut out = CurveCollection::new();

    for (weight, collection) in members {
        for (sid, curve) in collection {
            let Some(scaled) = scale(Poe::Curve(curve), weight)?.into_curve() else {
                continue;
            };
            match out.get_mut(&sid) {
                Some(total) => {
                    total.check_compatible(&scaled)?;
                    total.array += &scaled.array;
                }
                None => {
                    out.insert(sid, scaled);
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &Array2<f64>, expected: &[f64]) {
        let flat = actual.iter().copied().collect::<Vec<f64>>();
        assert_eq!(flat.len(), expected.len());
        for (a, e) in flat.iter().zip(expected) {
            assert!((a - e).abs() < 1e-12, "{flat:?} != {expected:?}");
        }
    }

    fn imtls() -> ImtLevels {
        ImtLevels::new(vec![("PGA", vec![1.0, 2.0, 3.0]), ("PGV", vec![4.0, 5.0])]).unwrap()
    }

    fn curve(values: &[f64]) -> PoeCurve {
        PoeCurve::from_flat(Arc::clone(imtls().slices()), 1, values.to_vec()).unwrap()
    }

    #[test]
    fn complement_or_and_scale_compose_like_probabilities() {
        let mut poe = PoeCurve::filled(Arc::clone(imtls().slices()), 1, 0.0);
        poe.set("PGA", &[0.1, 0.2, 0.3]).unwrap();

        let union = combine_or(Poe::Curve(poe.clone()), Poe::Curve(poe))
            .unwrap()
            .into_curve()
            .unwrap();
        let result = scale(Poe::Curve(complement(&union)), 0.5)
            .unwrap()
            .into_curve()
            .unwrap();

        assert_close(&result.get("PGA").unwrap().to_owned(), &[0.405, 0.32, 0.245]);
        assert_close(&result.get("PGV").unwrap().to_owned(), &[0.5, 0.5]);
    }

    #[test]
    fn complement_is_an_involution() {
        let original = curve(&[0.0, 0.25, 0.5, 0.75, 1.0]);
        let twice = complement(&complement(&original));
        assert_close(twice.array(), &original.to_flat());
    }

    #[test]
    fn combine_or_is_commutative_with_zero_identity() {
        let a = curve(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let b = curve(&[0.9, 0.5, 0.05, 0.0, 1.0]);

        let ab = combine_or(Poe::Curve(a.clone()), Poe::Curve(b.clone())).unwrap();
        let ba = combine_or(Poe::Curve(b), Poe::Curve(a.clone())).unwrap();
        assert_eq!(ab, ba);

        assert_eq!(
            combine_or(Poe::Curve(a.clone()), Poe::Zero).unwrap(),
            Poe::Curve(a.clone())
        );
        assert_eq!(combine_or(Poe::Zero, Poe::Curve(a.clone())).unwrap(), Poe::Curve(a));
    }

    #[test]
    fn combine_or_is_associative_within_tolerance() {
        let a = curve(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let b = curve(&[0.7, 0.01, 0.33, 0.25, 0.5]);
        let c = curve(&[0.05, 0.9, 0.1, 0.6, 0.123]);

        let left = combine_or(
            combine_or(Poe::Curve(a.clone()), Poe::Curve(b.clone())).unwrap(),
            Poe::Curve(c.clone()),
        )
        .unwrap()
        .into_curve()
        .unwrap();
        let right = combine_or(
            Poe::Curve(a),
            combine_or(Poe::Curve(b), Poe::Curve(c)).unwrap(),
        )
        .unwrap()
        .into_curve()
        .unwrap();

        assert_close(left.array(), &right.to_flat());
    }

    #[test]
    fn scale_by_one_returns_the_same_buffer() {
        let original = curve(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let before = original.array().as_ptr();

        let scaled = scale(Poe::Curve(original), 1.0).unwrap().into_curve().unwrap();
        assert_eq!(scaled.array().as_ptr(), before);
    }

    #[test]
    fn scale_by_zero_is_the_zero_identity() {
        let original = curve(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(scale(Poe::Curve(original), 0.0).unwrap(), Poe::Zero);
        assert_eq!(scale(Poe::Zero, 0.3).unwrap(), Poe::Zero);
        assert!(scale(Poe::One, 0.3).is_err());
    }

    #[test]
    fn multiply_uses_one_as_identity() {
        let a = curve(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let b = curve(&[0.5, 0.5, 0.5, 0.5, 0.0]);

        assert_eq!(
            multiply(Poe::One, Poe::Curve(a.clone())).unwrap(),
            Poe::Curve(a.clone())
        );
        assert_eq!(multiply(Poe::Zero, Poe::Curve(a.clone())).unwrap(), Poe::Zero);

        let product = multiply(Poe::Curve(a), Poe::Curve(b))
            .unwrap()
            .into_curve()
            .unwrap();
        assert_close(product.array(), &[0.05, 0.1, 0.15, 0.2, 0.0]);
    }

    #[test]
    fn combining_mismatched_branches_is_rejected() {
        let imtls = imtls();
        let one = PoeCurve::filled(Arc::clone(imtls.slices()), 1, 0.1);
        let two = PoeCurve::filled(Arc::clone(imtls.slices()), 2, 0.1);
        assert!(matches!(
            combine_or(Poe::Curve(one), Poe::Curve(two)),
            Err(HazardError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn zero_test_is_exact() {
        assert!(curve(&[0.0; 5]).is_zero());
        assert!(!curve(&[0.0, 0.0, 0.0, 0.0, 1e-300]).is_zero());
        assert!(Poe::Zero.is_zero());
        assert!(!Poe::One.is_zero());
    }

    #[test]
    fn compose_combines_shared_sites_and_keeps_the_rest() {
        let imtls = imtls();
        let left = build(&imtls, 1, [0, 1], 0.1);
        let right = build(&imtls, 1, [1, 2], 0.1);

        let composed = compose(left, right).unwrap();
        assert_eq!(composed.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_close(composed[&0].array(), &[0.1; 5]);
        assert_close(composed[&1].array(), &[0.19; 5]);
        assert_close(composed[&2].array(), &[0.1; 5]);
    }

    #[test]
    fn compose_over_disjoint_sites_is_a_plain_union() {
        let imtls = imtls();
        let left = build(&imtls, 1, [0], 0.2);
        let right = build(&imtls, 1, [5], 0.4);

        let composed = compose(left.clone(), right.clone()).unwrap();
        assert_eq!(composed[&0], left[&0]);
        assert_eq!(composed[&5], right[&5]);
    }

    #[test]
    fn compose_drops_sites_that_stay_zero() {
        let imtls = imtls();
        let left = build(&imtls, 1, [0, 1], 0.0);
        let right = build(&imtls, 1, [1], 0.3);

        let composed = compose(left, right).unwrap();
        assert_eq!(composed.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn multiply_collections_treats_missing_sites_as_one() {
        let imtls = imtls();
        let left = build(&imtls, 1, [0, 1], 0.5);
        let right = build(&imtls, 1, [1, 2], 0.4);

        let product = multiply_collections(left, right).unwrap();
        assert_close(product[&0].array(), &[0.5; 5]);
        assert_close(product[&1].array(), &[0.2; 5]);
        assert_close(product[&2].array(), &[0.4; 5]);
    }

    #[test]
    fn extract_keeps_one_branch_and_the_layout() {
        let imtls = imtls();
        let mut curve = PoeCurve::filled(Arc::clone(imtls.slices()), 2, 0.0);
        curve.set_branch("PGA", 1, &[0.3, 0.2, 0.1]).unwrap();
        let collection = CurveCollection::from([(7, curve)]);

        let single = extract(&collection, 1).unwrap();
        assert_eq!(single[&7].num_branches(), 1);
        assert!(Arc::ptr_eq(single[&7].slices(), imtls.slices()));
        assert_close(&single[&7].get("PGA").unwrap().to_owned(), &[0.3, 0.2, 0.1]);
        assert!(extract(&collection, 2).is_err());
    }

    #[test]
    fn weighted_mean_sums_scaled_curves() {
        let imtls = imtls();
        let first = build(&imtls, 1, [0], 0.2);
        let second = build(&imtls, 1, [0, 1], 0.6);

        let mean = weighted_mean(vec![(0.25, first), (0.75, second)]).unwrap();
        assert_close(mean[&0].array(), &[0.5; 5]);
        assert_close(mean[&1].array(), &[0.45; 5]);
    }
}
