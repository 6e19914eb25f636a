//! Pieces shared by the job commands: store location, job preparation, the
//! worker pool and output files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use tracing::{info, warn};

use crate::hazard::calculator::{
    Calculator, CancellationToken, ExecuteSummary, HazardOutputs, RealizationMaps, SiteCurves,
};
use crate::hazard::logictree::RealizationSpec;
use crate::hazard::progress::{
    Exchange, JobContext, JobId, JobRecord, ProgressStore, ProgressTracker, SignalMonitor,
    SqliteStore, routing_key,
};
use crate::hazard::source::{HazardModel, TabulatedSourceModel};
use crate::model::{CalcPaths, CalcRunManifest, JobConfig};
use crate::util::{
    ensure_directory, now_utc_string, sha256_inputs, utc_compact_string, write_json_pretty,
};

const DB_FILENAME: &str = "psha.sqlite";

pub fn resolve_db_path(cache_root: &Path, db_path: Option<PathBuf>) -> PathBuf {
    db_path.unwrap_or_else(|| cache_root.join(DB_FILENAME))
}

pub fn resolve_output_dir(cache_root: &Path, output_dir: Option<PathBuf>) -> PathBuf {
    output_dir.unwrap_or_else(|| cache_root.join("outputs"))
}

pub fn open_store(db_path: &Path) -> Result<Arc<SqliteStore>> {
    if let Some(parent) = db_path.parent() {
        ensure_directory(parent)?;
    }
    let store = SqliteStore::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    Ok(Arc::new(store))
}

pub fn open_existing_store(db_path: &Path) -> Result<Arc<SqliteStore>> {
    if !db_path.exists() {
        bail!("database not found: {}", db_path.display());
    }
    open_store(db_path)
}

pub fn load_job(store: &SqliteStore, job_id: JobId) -> Result<(JobRecord, JobConfig)> {
    let Some(record) = store.job(job_id)? else {
        bail!("job {job_id} not found");
    };
    let config: JobConfig = serde_json::from_str(&record.config_json)
        .with_context(|| format!("failed to parse stored configuration of job {job_id}"))?;
    Ok((record, config))
}

/// Digest of the stored configuration and every source model it names, so
/// an edited model file changes the checksum too.
pub fn job_checksum(config: &JobConfig, config_json: &str) -> Result<String> {
    let models = config
        .source_model_logic_tree
        .iter()
        .map(|branch| branch.source_model.as_path());
    sha256_inputs(config_json.as_bytes(), models)
}

/// Refuses to continue a job whose inputs changed since it was created.
pub fn verify_job_inputs(job: &JobRecord, config: &JobConfig) -> Result<()> {
    let current = job_checksum(config, &job.config_json)?;
    if current != job.checksum {
        bail!(
            "inputs of job {} changed since it was created (checksum {} != {}); start a new calculation",
            job.job_id,
            current,
            job.checksum
        );
    }
    Ok(())
}

pub struct PreparedJob {
    pub config: JobConfig,
    pub specs: Vec<RealizationSpec>,
    pub calculator: Calculator,
    pub context: JobContext,
}

/// Validates the configuration, draws the realizations and loads every
/// source model. Source model paths must already be resolved.
pub fn prepare(job_id: JobId, config: JobConfig) -> Result<PreparedJob> {
    config.validate().context("invalid job configuration")?;

    let imtls = Arc::new(config.imt_levels()?);
    let specs = config
        .logic_tree()?
        .realizations(config.number_of_logic_tree_samples, config.random_seed)?;

    let mut source_models: Vec<Arc<dyn HazardModel>> =
        Vec::with_capacity(config.source_model_logic_tree.len());
    for branch in &config.source_model_logic_tree {
        let model = TabulatedSourceModel::load(&branch.source_model).with_context(|| {
            format!(
                "failed to load source model {} for branch {}",
                branch.source_model.display(),
                branch.branch_id
            )
        })?;
        source_models.push(Arc::new(model));
    }
    let gsims = config
        .gsim_logic_tree
        .iter()
        .map(|branch| branch.gsim.clone())
        .collect();

    let calculator = Calculator::new(source_models, gsims, config.block_size)?;
    let context = JobContext {
        job_id,
        imtls,
        site_ids: config.site_ids(),
    };

    Ok(PreparedJob {
        config,
        specs,
        calculator,
        context,
    })
}

pub struct RunOutcome {
    pub summary: ExecuteSummary,
    pub workers: usize,
}

/// Issues every pending block of the job on a dedicated pool.
pub fn run_pending_blocks(
    store: &Arc<SqliteStore>,
    prepared: &PreparedJob,
    workers: Option<usize>,
    max_blocks: Option<usize>,
) -> Result<RunOutcome> {
    let job_id = prepared.context.job_id;
    let exchange = Exchange::new();
    let mut mailbox = exchange.bind(&routing_key(job_id));
    let mut monitor = SignalMonitor::new();
    let tracker = ProgressTracker::new(Arc::clone(store), prepared.context.clone())
        .with_exchange(exchange.clone());

    let realizations = store.list_realizations(job_id)?;
    let blocks = prepared
        .calculator
        .tasks(store.as_ref(), &prepared.specs, &realizations)?;

    let pool = ThreadPoolBuilder::new()
        .num_threads(workers.unwrap_or(0))
        .thread_name(|index| format!("psha-worker-{index}"))
        .build()
        .context("failed to build worker pool")?;
    let worker_count = pool.current_num_threads();

    info!(
        job_id,
        blocks = blocks.len(),
        workers = worker_count,
        "dispatching blocks"
    );

    let cancel = CancellationToken::new();
    let summary = pool
        .install(|| {
            prepared
                .calculator
                .execute(&tracker, blocks, max_blocks, &cancel)
        })
        .with_context(|| format!("calculation of job {job_id} failed"))?;

    monitor.consume(&mut mailbox);
    monitor.log_throughput(job_id);
    exchange.unbind(mailbox.key());
    if monitor.total(job_id) != summary.sources_merged as u64 {
        warn!(
            job_id,
            signalled = monitor.total(job_id),
            merged = summary.sources_merged,
            "completion signals disagree with the store; the store is authoritative"
        );
    }

    Ok(RunOutcome {
        summary,
        workers: worker_count,
    })
}

#[derive(Serialize)]
struct HazardMapsFile<'a> {
    job_id: JobId,
    generated_at: &'a str,
    poes: &'a [f64],
    incomplete_realizations: &'a [u32],
    realizations: &'a [RealizationMaps],
}

#[derive(Serialize)]
struct HazardCurvesFile<'a> {
    job_id: JobId,
    generated_at: &'a str,
    incomplete_realizations: &'a [u32],
    sites: &'a [SiteCurves],
}

/// Writes maps and reshaped curves; returns the written paths.
pub fn write_outputs(
    output_dir: &Path,
    job_id: JobId,
    poes: &[f64],
    outputs: &HazardOutputs,
) -> Result<Vec<PathBuf>> {
    ensure_directory(output_dir)?;
    let generated_at = now_utc_string();

    let maps_path = output_dir.join(format!("hazard_maps_job_{job_id}.json"));
    write_json_pretty(
        &maps_path,
        &HazardMapsFile {
            job_id,
            generated_at: &generated_at,
            poes,
            incomplete_realizations: &outputs.incomplete_realizations,
            realizations: &outputs.maps,
        },
    )?;

    let curves_path = output_dir.join(format!("hazard_curves_job_{job_id}.json"));
    write_json_pretty(
        &curves_path,
        &HazardCurvesFile {
            job_id,
            generated_at: &generated_at,
            incomplete_realizations: &outputs.incomplete_realizations,
            sites: &outputs.curves,
        },
    )?;

    info!(
        maps = %maps_path.display(),
        curves = %curves_path.display(),
        "wrote hazard outputs"
    );
    Ok(vec![maps_path, curves_path])
}

pub struct ManifestInput<'a> {
    pub command: &'a str,
    pub job: &'a JobRecord,
    pub started: Instant,
    pub started_at: String,
    pub outcome: &'a RunOutcome,
    pub paths: CalcPaths,
    pub outputs: &'a [PathBuf],
    pub warnings: Vec<String>,
}

pub fn write_run_manifest(
    store: &SqliteStore,
    output_dir: &Path,
    input: ManifestInput<'_>,
) -> Result<PathBuf> {
    let realizations = store.list_realizations(input.job.job_id)?;
    let complete = realizations.iter().filter(|rlz| rlz.is_complete).count();
    let status = if complete == realizations.len() {
        "complete"
    } else {
        "partial"
    };

    let manifest = CalcRunManifest {
        manifest_version: 1,
        run_id: format!("run-{}", utc_compact_string(Utc::now())),
        command: input.command.to_string(),
        job_id: input.job.job_id,
        job_checksum: input.job.checksum.clone(),
        status: status.to_string(),
        started_at: input.started_at,
        finished_at: now_utc_string(),
        duration_ms: input.started.elapsed().as_millis(),
        workers: input.outcome.workers,
        realizations_total: realizations.len(),
        realizations_complete: complete,
        summary: input.outcome.summary.clone(),
        paths: input.paths,
        outputs: input
            .outputs
            .iter()
            .map(|path| path.display().to_string())
            .collect(),
        warnings: input.warnings,
    };

    let manifest_path = output_dir.join(format!(
        "calc_run_{}.json",
        utc_compact_string(Utc::now())
    ));
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), status, "wrote run manifest");
    Ok(manifest_path)
}
