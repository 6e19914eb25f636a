use std::collections::BTreeMap;

use super::error::{HazardError, Result};

/// Regroups `realization -> imt -> [value per level]` into
/// `imt -> [realization -> value]`, one map per level.
pub fn data_by_imt<K, V, S>(
    by_realization: &BTreeMap<K, BTreeMap<String, Vec<V>>>,
    imts: &[S],
    levels: usize,
) -> Result<BTreeMap<String, Vec<BTreeMap<K, V>>>>
where
    K: Ord + Clone,
    V: Copy,
    S: AsRef<str>,
{
    let mut out = BTreeMap::new();

    for imt in imts {
        let imt = imt.as_ref();
        let mut per_level = vec![BTreeMap::new(); levels];

        for (realization, data) in by_realization {
            let values = data
                .get(imt)
                .ok_or_else(|| HazardError::KeyNotFound(imt.to_string()))?;
            if values.len() < levels {
                return Err(HazardError::shape("per-level values", levels, values.len()));
            }
            for (slot, value) in per_level.iter_mut().zip(values) {
                slot.insert(realization.clone(), *value);
            }
        }

        out.insert(imt.to_string(), per_level);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realizations() -> BTreeMap<&'static str, BTreeMap<String, Vec<i32>>> {
        let row = |pga: [i32; 2], pgv: [i32; 2]| {
            BTreeMap::from([
                ("PGA".to_string(), pga.to_vec()),
                ("PGV".to_string(), pgv.to_vec()),
            ])
        };
        BTreeMap::from([
            ("r1", row([1, 2], [3, 4])),
            ("r2", row([5, 6], [7, 8])),
            ("r3", row([9, 10], [11, 12])),
        ])
    }

    #[test]
    fn regroups_levels_across_realizations() {
        let actual = data_by_imt(&realizations(), &["PGA", "PGV"], 2).unwrap();

        let expected = BTreeMap::from([
            (
                "PGA".to_string(),
                vec![
                    BTreeMap::from([("r1", 1), ("r2", 5), ("r3", 9)]),
                    BTreeMap::from([("r1", 2), ("r2", 6), ("r3", 10)]),
                ],
            ),
            (
                "PGV".to_string(),
                vec![
                    BTreeMap::from([("r1", 3), ("r2", 7), ("r3", 11)]),
                    BTreeMap::from([("r1", 4), ("r2", 8), ("r3", 12)]),
                ],
            ),
        ]);
        assert_eq!(actual, expected);
    }

    #[test]
    fn projects_only_the_requested_imts() {
        let actual = data_by_imt(&realizations(), &["PGV"], 1).unwrap();
        assert_eq!(actual.len(), 1);
        assert_eq!(
            actual["PGV"],
            vec![BTreeMap::from([("r1", 3), ("r2", 7), ("r3", 11)])]
        );
    }

    #[test]
    fn missing_imt_or_short_rows_are_reported() {
        assert!(matches!(
            data_by_imt(&realizations(), &["SA(0.1)"], 2),
            Err(HazardError::KeyNotFound(_))
        ));
        assert!(matches!(
            data_by_imt(&realizations(), &["PGA"], 3),
            Err(HazardError::ShapeMismatch { .. })
        ));
    }
}
