use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::CalcArgs;
use crate::commands::job::{
    ManifestInput, job_checksum, open_store, prepare, resolve_db_path, resolve_output_dir,
    run_pending_blocks, write_outputs, write_run_manifest,
};
use crate::hazard::progress::ProgressTracker;
use crate::model::{CalcPaths, JobConfig};
use crate::util::now_utc_string;

pub fn run(args: CalcArgs) -> Result<()> {
    let started = Instant::now();
    let started_at = now_utc_string();

    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    let output_dir = resolve_output_dir(&args.cache_root, args.output_dir.clone());

    let config = read_job_file(&args.job)?;
    config.validate().context("invalid job configuration")?;
    let config_json =
        serde_json::to_string(&config).context("failed to serialize job configuration")?;
    let checksum = job_checksum(&config, &config_json)?;

    let store = open_store(&db_path)?;
    let job_id = store.create_job(&config.description, &checksum, &config_json)?;
    info!(
        job_id,
        job = %args.job.display(),
        db = %db_path.display(),
        "starting calculation"
    );

    let prepared = prepare(job_id, config)?;
    let tracker = ProgressTracker::new(Arc::clone(&store), prepared.context.clone());
    prepared
        .calculator
        .pre_execute(&tracker, &prepared.specs)
        .with_context(|| format!("failed to initialize realizations of job {job_id}"))?;

    let outcome = run_pending_blocks(&store, &prepared, args.workers, args.max_blocks)?;

    let mut warnings = Vec::new();
    let poes = &prepared.config.poes_hazard_maps;
    let outputs = prepared
        .calculator
        .post_execute(&tracker, poes, prepared.config.mean_hazard_curves)?;
    if !outputs.incomplete_realizations.is_empty() {
        let message = format!(
            "{} realization(s) incomplete; run `psha resume --job-id {job_id}`",
            outputs.incomplete_realizations.len()
        );
        warn!(job_id, "{message}");
        warnings.push(message);
    }
    let written = write_outputs(&output_dir, job_id, poes, &outputs)?;

    let job = store
        .job(job_id)?
        .with_context(|| format!("job {job_id} disappeared from the store"))?;
    write_run_manifest(
        &store,
        &output_dir,
        ManifestInput {
            command: "calc",
            job: &job,
            started,
            started_at,
            outcome: &outcome,
            paths: CalcPaths {
                job_path: Some(args.job.display().to_string()),
                db_path: db_path.display().to_string(),
                output_dir: output_dir.display().to_string(),
            },
            outputs: &written,
            warnings,
        },
    )?;

    info!(
        job_id,
        completed = outcome.summary.realizations_completed,
        "calculation finished"
    );
    Ok(())
}

/// Reads the job file and resolves its source model paths against the
/// file's directory.
fn read_job_file(path: &Path) -> Result<JobConfig> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut config: JobConfig = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let base_dir = fs::canonicalize(&base_dir).unwrap_or(base_dir);
    config.resolve_paths(&base_dir);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::progress::ProgressStore;

    fn write_fixture(dir: &Path) -> std::path::PathBuf {
        fs::write(
            dir.join("model.json"),
            r#"{
              "gsims": ["GA"],
              "sources": [
                {"source_id": "s1", "ruptures": [{"poes": {"0": {"PGA": [[0.2, 0.1]]}}}]},
                {"source_id": "s2", "ruptures": [{"poes": {"1": {"PGA": [[0.5, 0.05]]}}}]}
              ]
            }"#,
        )
        .unwrap();

        let job_path = dir.join("job.json");
        fs::write(
            &job_path,
            r#"{
              "description": "fixture",
              "sites": [{"site_id": 0, "lon": 0.0, "lat": 0.0}, {"site_id": 1, "lon": 1.0, "lat": 0.0}],
              "intensity_measure_types_and_levels": {"PGA": [0.1, 0.2]},
              "source_model_logic_tree": [{"branch_id": "b1", "weight": 1.0, "source_model": "model.json"}],
              "gsim_logic_tree": [{"branch_id": "g1", "weight": 1.0, "gsim": "GA"}],
              "poes_hazard_maps": [0.1],
              "block_size": 1,
              "mean_hazard_curves": true
            }"#,
        )
        .unwrap();
        job_path
    }

    #[test]
    fn job_file_paths_resolve_next_to_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let job_path = write_fixture(dir.path());

        let config = read_job_file(&job_path).unwrap();
        let model_path = &config.source_model_logic_tree[0].source_model;
        assert!(model_path.is_absolute());
        assert!(model_path.ends_with("model.json"));
    }

    #[test]
    fn calc_writes_outputs_and_completes_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let job_path = write_fixture(dir.path());
        let cache_root = dir.path().join("cache");

        run(CalcArgs {
            job: job_path,
            cache_root: cache_root.clone(),
            db_path: None,
            output_dir: None,
            workers: Some(2),
            max_blocks: None,
        })
        .unwrap();

        let outputs = cache_root.join("outputs");
        assert!(outputs.join("hazard_maps_job_1.json").exists());
        assert!(outputs.join("hazard_curves_job_1.json").exists());
        let manifests = fs::read_dir(&outputs)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("calc_run_"))
            .count();
        assert_eq!(manifests, 1);

        let store = open_store(&cache_root.join("psha.sqlite")).unwrap();
        let realizations = store.list_realizations(1).unwrap();
        assert_eq!(realizations.len(), 1);
        assert!(realizations[0].is_complete);
    }

    #[test]
    fn interrupted_calc_is_completed_by_resume() {
        let dir = tempfile::tempdir().unwrap();
        let job_path = write_fixture(dir.path());
        let cache_root = dir.path().join("cache");

        run(CalcArgs {
            job: job_path,
            cache_root: cache_root.clone(),
            db_path: None,
            output_dir: None,
            workers: Some(1),
            max_blocks: Some(1),
        })
        .unwrap();

        let store = open_store(&cache_root.join("psha.sqlite")).unwrap();
        let midway = store.list_realizations(1).unwrap();
        assert!(!midway[0].is_complete);
        assert_eq!(store.pending_sources(midway[0].id).unwrap().len(), 1);

        crate::commands::resume::run(crate::cli::ResumeArgs {
            job_id: 1,
            cache_root: cache_root.clone(),
            db_path: None,
            output_dir: None,
            workers: Some(1),
        })
        .unwrap();

        let done = store.list_realizations(1).unwrap();
        assert!(done[0].is_complete);
        assert!(store.has_hazard_curves(done[0].id).unwrap());
    }

    #[test]
    fn resume_refuses_a_job_whose_source_model_changed() {
        let dir = tempfile::tempdir().unwrap();
        let job_path = write_fixture(dir.path());
        let cache_root = dir.path().join("cache");

        run(CalcArgs {
            job: job_path,
            cache_root: cache_root.clone(),
            db_path: None,
            output_dir: None,
            workers: Some(1),
            max_blocks: Some(1),
        })
        .unwrap();

        fs::write(
            dir.path().join("model.json"),
            r#"{
              "gsims": ["GA"],
              "sources": [
                {"source_id": "s1", "ruptures": [{"poes": {"0": {"PGA": [[0.9, 0.8]]}}}]},
                {"source_id": "s2", "ruptures": [{"poes": {"1": {"PGA": [[0.5, 0.05]]}}}]}
              ]
            }"#,
        )
        .unwrap();

        let err = crate::commands::resume::run(crate::cli::ResumeArgs {
            job_id: 1,
            cache_root: cache_root.clone(),
            db_path: None,
            output_dir: None,
            workers: Some(1),
        })
        .unwrap_err();
        assert!(err.to_string().contains("changed since it was created"));

        let store = open_store(&cache_root.join("psha.sqlite")).unwrap();
        let realizations = store.list_realizations(1).unwrap();
        assert!(!realizations[0].is_complete);
        assert_eq!(store.pending_sources(realizations[0].id).unwrap().len(), 1);
    }
}
