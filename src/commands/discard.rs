use anyhow::Result;
use tracing::info;

use crate::cli::DiscardArgs;
use crate::commands::job::{load_job, open_existing_store, resolve_db_path};
use crate::hazard::progress::ProgressStore;

/// Drops every unfinished realization of the job with its progress.
/// Finished realizations are kept.
pub fn run(args: DiscardArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    let store = open_existing_store(&db_path)?;
    let (job, _) = load_job(&store, args.job_id)?;

    let mut discarded = 0;
    let mut kept = 0;
    for realization in store.list_realizations(job.job_id)? {
        if realization.is_complete {
            kept += 1;
            continue;
        }
        store.discard_realization(realization.id)?;
        info!(
            job_id = job.job_id,
            realization = realization.ordinal,
            completed = realization.completed_sources,
            "discarded realization"
        );
        discarded += 1;
    }

    info!(job_id = job.job_id, discarded, kept, "discard finished");
    Ok(())
}
