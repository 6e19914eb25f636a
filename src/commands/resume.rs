use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::ResumeArgs;
use crate::commands::job::{
    ManifestInput, load_job, open_existing_store, prepare, resolve_db_path, resolve_output_dir,
    run_pending_blocks, verify_job_inputs, write_outputs, write_run_manifest,
};
use crate::hazard::progress::{ProgressStore, ProgressTracker};
use crate::model::CalcPaths;
use crate::util::now_utc_string;

pub fn run(args: ResumeArgs) -> Result<()> {
    let started = Instant::now();
    let started_at = now_utc_string();

    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    let output_dir = resolve_output_dir(&args.cache_root, args.output_dir.clone());
    let store = open_existing_store(&db_path)?;
    let (job, config) = load_job(&store, args.job_id)?;
    verify_job_inputs(&job, &config)?;
    let prepared = prepare(job.job_id, config)?;
    let tracker = ProgressTracker::new(Arc::clone(&store), prepared.context.clone());

    // discarded realizations come back with fresh progress
    let realizations = store.list_realizations(job.job_id)?;
    let existing = realizations
        .iter()
        .map(|rlz| rlz.ordinal)
        .collect::<HashSet<u32>>();
    let missing = prepared
        .specs
        .iter()
        .filter(|spec| !existing.contains(&spec.ordinal))
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        warn!(
            job_id = job.job_id,
            missing = missing.len(),
            "recreating missing realizations"
        );
        prepared
            .calculator
            .pre_execute(&tracker, &missing)
            .with_context(|| format!("failed to initialize realizations of job {}", job.job_id))?;
    }

    // a crash between completion and the hazard curve flush leaves complete
    // realizations without curves
    let mut refinalized = 0;
    for realization in realizations.iter().filter(|rlz| rlz.is_complete) {
        if !store.has_hazard_curves(realization.id)? {
            tracker.finalize(realization)?;
            refinalized += 1;
        }
    }

    let pending = realizations.iter().filter(|rlz| !rlz.is_complete).count() + missing.len();
    info!(
        job_id = job.job_id,
        pending,
        refinalized,
        "resuming calculation"
    );

    let outcome = run_pending_blocks(&store, &prepared, args.workers, None)?;

    let mut warnings = Vec::new();
    let poes = &prepared.config.poes_hazard_maps;
    let outputs = prepared
        .calculator
        .post_execute(&tracker, poes, prepared.config.mean_hazard_curves)?;
    if !outputs.incomplete_realizations.is_empty() {
        let message = format!(
            "{} realization(s) still incomplete after resume",
            outputs.incomplete_realizations.len()
        );
        warn!(job_id = job.job_id, "{message}");
        warnings.push(message);
    }
    let written = write_outputs(&output_dir, job.job_id, poes, &outputs)?;

    write_run_manifest(
        &store,
        &output_dir,
        ManifestInput {
            command: "resume",
            job: &job,
            started,
            started_at,
            outcome: &outcome,
            paths: CalcPaths {
                job_path: None,
                db_path: db_path.display().to_string(),
                output_dir: output_dir.display().to_string(),
            },
            outputs: &written,
            warnings,
        },
    )?;

    info!(
        job_id = job.job_id,
        completed = outcome.summary.realizations_completed,
        "resume finished"
    );
    Ok(())
}
