use std::sync::Arc;

use super::*;
use crate::hazard::logictree::{Branch, LogicTree};
use crate::hazard::progress::{JobContext, MemoryStore, RealizationState, SqliteStore};
use crate::hazard::source::TabulatedSourceModel;

const MODEL: &str = r#"
{
  "gsims": ["GA", "GB"],
  "sources": [
    {"source_id": "src-1", "ruptures": [{"poes": {"0": {"PGA": [[0.1, 0.1], [0.2, 0.2]]}}}]},
    {"source_id": "src-2", "ruptures": [{"poes": {"0": {"PGA": [[0.2, 0.2], [0.3, 0.3]]}}}]},
    {"source_id": "src-3", "ruptures": [{"poes": {"1": {"PGA": [[0.5, 0.4], [0.5, 0.4]]}}}]}
  ]
}
"#;

struct FailingModel;

impl HazardModel for FailingModel {
    fn source_ids(&self) -> Vec<SourceId> {
        vec!["ok".to_string(), "broken".to_string()]
    }

    fn compute(
        &self,
        source_id: &str,
        _sites: &[SiteId],
        _imtls: &ImtLevels,
        _gsim: &str,
    ) -> Result<CurveCollection> {
        if source_id == "broken" {
            return Err(HazardError::InvalidSpec("rupture table is corrupt".to_string()));
        }
        Ok(CurveCollection::new())
    }
}

fn branch(id: &str, weight: f64) -> Branch {
    Branch {
        branch_id: id.to_string(),
        weight,
    }
}

fn specs() -> Vec<RealizationSpec> {
    LogicTree::new(
        vec![branch("b1", 1.0)],
        vec![branch("g1", 0.5), branch("g2", 0.5)],
    )
    .unwrap()
    .realizations(0, 23)
    .unwrap()
}

fn job(job_id: i64) -> JobContext {
    JobContext {
        job_id,
        imtls: Arc::new(ImtLevels::new(vec![("PGA", vec![0.1, 0.2])]).unwrap()),
        site_ids: vec![0, 1],
    }
}

fn calculator(block_size: usize) -> Calculator {
    let model: TabulatedSourceModel = serde_json::from_str(MODEL).unwrap();
    Calculator::new(
        vec![Arc::new(model)],
        vec!["GA".to_string(), "GB".to_string()],
        block_size,
    )
    .unwrap()
}

fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
}

#[test]
fn full_run_on_sqlite_completes_every_realization() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("hazard.sqlite")).unwrap());
    let job_id = store.create_job("two gsims", "checksum", "{}").unwrap();
    let tracker = ProgressTracker::new(Arc::clone(&store), job(job_id));
    let calc = calculator(2);
    let specs = specs();

    let realizations = calc.pre_execute(&tracker, &specs).unwrap();
    let blocks = calc.tasks(store.as_ref(), &specs, &realizations).unwrap();
    assert_eq!(blocks.len(), 4);

    let summary = calc
        .execute(&tracker, blocks, None, &CancellationToken::new())
        .unwrap();
    assert_eq!(summary.blocks_run, 4);
    assert_eq!(summary.sources_merged, 6);
    assert_eq!(summary.realizations_completed, 2);
    assert!(!summary.cancelled);

    let stored = store.list_realizations(job_id).unwrap();
    assert!(stored.iter().all(|rlz| rlz.state() == RealizationState::Complete));

    let first = store.hazard_curves(stored[0].id, &tracker.job().imtls).unwrap();
    let second = store.hazard_curves(stored[1].id, &tracker.job().imtls).unwrap();
    assert_close(first[&0].to_flat()[0], 1.0 - 0.9 * 0.8);
    assert_close(second[&0].to_flat()[0], 1.0 - 0.8 * 0.7);
    let site_1 = second[&1].to_flat();
    assert_close(site_1[0], 0.5);
    assert_close(site_1[1], 0.4);

    let outputs = calc.post_execute(&tracker, &[0.3], true).unwrap();
    assert!(outputs.incomplete_realizations.is_empty());
    let labels = outputs
        .maps
        .iter()
        .map(|set| set.realization.as_str())
        .collect::<Vec<_>>();
    assert_eq!(labels, vec!["rlz-0", "rlz-1", MEAN_LABEL]);

    assert_eq!(outputs.maps[0].maps[0].values, vec![0.0, 0.2]);
    assert_eq!(outputs.maps[2].maps[0].values, vec![0.2, 0.2]);

    let site_0 = &outputs.curves[0];
    assert_eq!(site_0.site_id, 0);
    assert_close(site_0.curves["PGA"][0]["rlz-1"], 0.44);
    assert_close(site_0.curves["PGA"][1][MEAN_LABEL], 0.36);
}

#[test]
fn cancelled_run_is_resumed_from_pending_sources() {
    let store = Arc::new(MemoryStore::new());
    let tracker = ProgressTracker::new(Arc::clone(&store), job(1));
    let calc = calculator(1);
    let specs = specs();

    let realizations = calc.pre_execute(&tracker, &specs).unwrap();
    let blocks = calc.tasks(store.as_ref(), &specs, &realizations).unwrap();
    assert_eq!(blocks.len(), 6);

    let partial = calc
        .execute(&tracker, blocks, Some(2), &CancellationToken::new())
        .unwrap();
    assert_eq!(partial.blocks_run, 2);
    assert_eq!(partial.blocks_skipped, 4);
    assert!(partial.cancelled);

    let midway = store.list_realizations(1).unwrap();
    assert_eq!(midway[0].state(), RealizationState::InProgress);
    assert!(store.hazard_curves(midway[0].id, &tracker.job().imtls).unwrap().is_empty());

    let outputs = calc.post_execute(&tracker, &[0.3], true).unwrap();
    assert_eq!(outputs.incomplete_realizations, vec![0, 1]);
    assert!(outputs.maps.is_empty());

    let remaining = calc.tasks(store.as_ref(), &specs, &midway).unwrap();
    assert_eq!(remaining.len(), 4);
    let resumed = calc
        .execute(&tracker, remaining, None, &CancellationToken::new())
        .unwrap();
    assert_eq!(resumed.realizations_completed, 2);
    assert_eq!(resumed.duplicate_events, 0);

    let done = store.list_realizations(1).unwrap();
    assert!(done.iter().all(|rlz| rlz.is_complete));
    assert!(calc.tasks(store.as_ref(), &specs, &done).unwrap().is_empty());
}

#[test]
fn cancelled_token_issues_no_blocks() {
    let store = Arc::new(MemoryStore::new());
    let tracker = ProgressTracker::new(Arc::clone(&store), job(1));
    let calc = calculator(3);
    let specs = specs();
    let realizations = calc.pre_execute(&tracker, &specs).unwrap();
    let blocks = calc.tasks(store.as_ref(), &specs, &realizations).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = calc.execute(&tracker, blocks, None, &cancel).unwrap();

    assert_eq!(summary.blocks_run, 0);
    assert_eq!(summary.blocks_skipped, 2);
    assert!(
        store
            .list_realizations(1)
            .unwrap()
            .iter()
            .all(|rlz| rlz.state() == RealizationState::Pending)
    );
}

#[test]
fn failing_block_cancels_and_never_finalizes() {
    let store = Arc::new(MemoryStore::new());
    let tracker = ProgressTracker::new(Arc::clone(&store), job(1));
    let calc = Calculator::new(vec![Arc::new(FailingModel)], vec!["GA".to_string()], 2).unwrap();
    let specs = LogicTree::new(vec![branch("b1", 1.0)], vec![branch("g1", 1.0)])
        .unwrap()
        .realizations(0, 23)
        .unwrap();

    let realizations = calc.pre_execute(&tracker, &specs).unwrap();
    let blocks = calc.tasks(store.as_ref(), &specs, &realizations).unwrap();
    let cancel = CancellationToken::new();

    let err = calc.execute(&tracker, blocks, None, &cancel).unwrap_err();
    assert!(matches!(err, HazardError::InvalidSpec(_)));
    assert!(cancel.is_cancelled());

    let stored = store.get_realization(realizations[0].id).unwrap();
    assert!(!stored.is_complete);
    assert_eq!(store.pending_sources(stored.id).unwrap(), vec!["broken"]);
}

#[test]
fn zero_block_size_is_rejected() {
    assert!(matches!(
        Calculator::new(Vec::new(), Vec::new(), 0),
        Err(HazardError::InvalidArgument(_))
    ));
}
