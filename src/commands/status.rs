use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::job::{open_existing_store, resolve_db_path};
use crate::hazard::progress::{JobRecord, ProgressStore, RealizationState, SqliteStore};

/// Reports progress straight from the store, which stays authoritative when
/// completion signals were lost.
pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    info!(db = %db_path.display(), "status requested");

    let store = open_existing_store(&db_path)?;
    let jobs = match args.job_id {
        Some(job_id) => match store.job(job_id)? {
            Some(job) => vec![job],
            None => {
                warn!(job_id, "job not found");
                Vec::new()
            }
        },
        None => store.jobs()?,
    };

    if jobs.is_empty() {
        warn!(db = %db_path.display(), "no jobs recorded");
    }
    for job in &jobs {
        report_job(&store, job)?;
    }

    Ok(())
}

fn report_job(store: &SqliteStore, job: &JobRecord) -> Result<()> {
    let realizations = store.list_realizations(job.job_id)?;
    let complete = realizations
        .iter()
        .filter(|rlz| rlz.state() == RealizationState::Complete)
        .count();

    info!(
        job_id = job.job_id,
        description = %job.description,
        created_at = %job.created_at,
        realizations = realizations.len(),
        complete,
        "job status"
    );

    for realization in &realizations {
        let pending = store.pending_sources(realization.id)?;
        let finalized = store.has_hazard_curves(realization.id)?;
        info!(
            job_id = job.job_id,
            realization = realization.ordinal,
            state = realization.state().as_str(),
            completed = realization.completed_sources,
            total = realization.total_sources,
            pending = pending.len(),
            finalized,
            sm_lt_path = %realization.sm_lt_path.join("~"),
            gsim_lt_path = %realization.gsim_lt_path.join("~"),
            "realization status"
        );
        if realization.is_complete && !finalized {
            warn!(
                job_id = job.job_id,
                realization = realization.ordinal,
                "complete realization has no hazard curves; run resume to finalize it"
            );
        }
    }

    Ok(())
}
