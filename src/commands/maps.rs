use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::MapsArgs;
use crate::commands::job::{
    load_job, open_existing_store, prepare, resolve_db_path, resolve_output_dir, write_outputs,
};
use crate::hazard::progress::ProgressTracker;
use crate::model::validate_poes;

/// Recomputes maps and reshaped curves of finished realizations, optionally
/// for thresholds other than the job's.
pub fn run(args: MapsArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    let output_dir = resolve_output_dir(&args.cache_root, args.output_dir.clone());
    let store = open_existing_store(&db_path)?;
    let (job, config) = load_job(&store, args.job_id)?;

    let poes = if args.poes.is_empty() {
        config.poes_hazard_maps.clone()
    } else {
        args.poes.clone()
    };
    validate_poes(&poes).context("invalid --poe")?;
    if poes.is_empty() {
        warn!(job_id = job.job_id, "no hazard map poes configured; maps will be empty");
    }

    let prepared = prepare(job.job_id, config)?;
    let tracker = ProgressTracker::new(Arc::clone(&store), prepared.context.clone());
    let outputs = prepared
        .calculator
        .post_execute(&tracker, &poes, prepared.config.mean_hazard_curves)?;
    if !outputs.incomplete_realizations.is_empty() {
        warn!(
            job_id = job.job_id,
            incomplete = outputs.incomplete_realizations.len(),
            "maps cover finished realizations only"
        );
    }

    write_outputs(&output_dir, job.job_id, &poes, &outputs)?;
    info!(job_id = job.job_id, poes = poes.len(), "hazard maps written");
    Ok(())
}
