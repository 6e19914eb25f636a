use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;

use super::{JobId, MergeOutcome, ProgressStore, Realization, RealizationId};
use crate::hazard::curve::{CurveCollection, Poe, PoeCurve, SiteId, combine_or};
use crate::hazard::error::{HazardError, Result};
use crate::hazard::imt::ImtLevels;
use crate::hazard::logictree::RealizationSpec;
use crate::hazard::source::SourceId;

const DB_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub description: String,
    pub checksum: String,
    pub config_json: String,
    pub created_at: String,
}

/// Durable store backed by a single SQLite connection.
///
/// Writers are serialized by `BEGIN IMMEDIATE`; the surrounding mutex only
/// exists because a connection cannot be shared between threads.
#[derive(Debug)]
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)?;
        configure_connection(&connection)?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection.pragma_update(None, "foreign_keys", "ON")?;
        ensure_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| HazardError::Poisoned("sqlite connection"))
    }

    pub fn create_job(&self, description: &str, checksum: &str, config_json: &str) -> Result<JobId> {
        let connection = self.connection()?;
        connection.execute(
            "INSERT INTO jobs(description, checksum, config_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                description,
                checksum,
                config_json,
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
            ],
        )?;
        Ok(connection.last_insert_rowid())
    }

    pub fn job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let connection = self.connection()?;
        let record = connection
            .query_row(
                "SELECT job_id, description, checksum, config_json, created_at FROM jobs WHERE job_id = ?1",
                [job_id],
                job_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn jobs(&self) -> Result<Vec<JobRecord>> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT job_id, description, checksum, config_json, created_at FROM jobs ORDER BY job_id",
        )?;
        let rows = statement.query_map([], job_from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    pub fn has_hazard_curves(&self, id: RealizationId) -> Result<bool> {
        let connection = self.connection()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM hazard_curves WHERE realization_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl ProgressStore for SqliteStore {
    fn create_realization(
        &self,
        job_id: JobId,
        spec: &RealizationSpec,
        sources: &[SourceId],
        initial: &CurveCollection,
    ) -> Result<Realization> {
        let mut connection = self.connection()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO realizations(
               job_id, ordinal, seed, weight, sm_lt_path, gsim_lt_path,
               total_sources, completed_sources, is_complete
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            params![
                job_id,
                spec.ordinal,
                spec.seed,
                spec.weight,
                serde_json::to_string(&spec.sm_lt_path)?,
                serde_json::to_string(&spec.gsim_lt_path)?,
                sources.len() as i64,
                sources.is_empty(),
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut insert = tx.prepare(
                "INSERT INTO source_progress(realization_id, source_id, is_complete) VALUES (?1, ?2, 0)",
            )?;
            for source in sources {
                insert.execute(params![id, source])?;
            }
        }
        for (sid, curve) in initial {
            if !curve.is_zero() {
                upsert_progress(&tx, id, *sid, curve)?;
            }
        }

        tx.commit()?;
        Ok(Realization::from_spec(id, job_id, spec, sources.len()))
    }

    fn get_realization(&self, id: RealizationId) -> Result<Realization> {
        let connection = self.connection()?;
        load_realization(&connection, id)
    }

    fn list_realizations(&self, job_id: JobId) -> Result<Vec<Realization>> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT realization_id, job_id, ordinal, seed, weight, sm_lt_path, gsim_lt_path,
                    total_sources, completed_sources, is_complete
             FROM realizations WHERE job_id = ?1 ORDER BY ordinal",
        )?;
        let rows = statement.query_map([job_id], realization_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode_realization(row?)?);
        }
        Ok(out)
    }

    fn pending_sources(&self, id: RealizationId) -> Result<Vec<SourceId>> {
        let connection = self.connection()?;
        load_realization(&connection, id)?;

        let mut statement = connection.prepare(
            "SELECT source_id FROM source_progress
             WHERE realization_id = ?1 AND is_complete = 0 ORDER BY rowid",
        )?;
        let rows = statement.query_map([id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn compare_and_set_source_progress(&self, id: RealizationId, source_id: &str) -> Result<bool> {
        let mut connection = self.connection()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let flipped = flip_source_flag(&tx, id, source_id)?;
        tx.commit()?;
        Ok(flipped)
    }

    fn merge_curve_progress(
        &self,
        id: RealizationId,
        contribution: CurveCollection,
    ) -> Result<MergeOutcome> {
        let mut connection = self.connection()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = merge_in(&tx, id, contribution)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn record_source_completion(
        &self,
        id: RealizationId,
        source_id: &str,
        contribution: CurveCollection,
    ) -> Result<MergeOutcome> {
        let mut connection = self.connection()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !flip_source_flag(&tx, id, source_id)? {
            return Ok(MergeOutcome::Duplicate);
        }
        let outcome = merge_in(&tx, id, contribution)?;

        tx.commit()?;
        Ok(outcome)
    }

    fn curve_progress(&self, id: RealizationId, imtls: &ImtLevels) -> Result<CurveCollection> {
        let connection = self.connection()?;
        load_realization(&connection, id)?;

        let mut statement = connection.prepare(
            "SELECT site_id, branches, poes FROM curve_progress WHERE realization_id = ?1",
        )?;
        let rows = statement.query_map([id], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut out = CurveCollection::new();
        for row in rows {
            let (sid, branches, blob) = row?;
            let curve = PoeCurve::from_flat(
                Arc::clone(imtls.slices()),
                branches as usize,
                decode_poes(&blob)?,
            )?;
            out.insert(sid, curve);
        }
        Ok(out)
    }

    fn store_hazard_curves(
        &self,
        id: RealizationId,
        curves: &CurveCollection,
        imtls: &ImtLevels,
        site_ids: &[SiteId],
    ) -> Result<()> {
        let mut connection = self.connection()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("DELETE FROM hazard_curves WHERE realization_id = ?1", [id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO hazard_curves(realization_id, imt, site_id, poes) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for sid in site_ids {
                let single = curves.get(sid).map(|curve| curve.branch(0)).transpose()?;
                for (imt, levels) in imtls.iter() {
                    let poes = match &single {
                        Some(curve) => curve.get(imt)?.column(0).to_vec(),
                        None => vec![0.0; levels.len()],
                    };
                    insert.execute(params![id, imt, sid, encode_poes(&poes)])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn hazard_curves(&self, id: RealizationId, imtls: &ImtLevels) -> Result<CurveCollection> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT site_id, imt, poes FROM hazard_curves WHERE realization_id = ?1 ORDER BY site_id, imt",
        )?;
        let rows = statement.query_map([id], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut out = CurveCollection::new();
        for row in rows {
            let (sid, imt, blob) = row?;
            let curve = out
                .entry(sid)
                .or_insert_with(|| PoeCurve::filled(Arc::clone(imtls.slices()), 1, 0.0));
            curve.set(&imt, &decode_poes(&blob)?)?;
        }
        Ok(out)
    }

    fn discard_realization(&self, id: RealizationId) -> Result<()> {
        let mut connection = self.connection()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load_realization(&tx, id)?.is_complete {
            return Err(HazardError::InvalidArgument(format!(
                "realization {id} is complete and cannot be discarded"
            )));
        }
        tx.execute("DELETE FROM curve_progress WHERE realization_id = ?1", [id])?;
        tx.execute("DELETE FROM source_progress WHERE realization_id = ?1", [id])?;
        tx.execute("DELETE FROM hazard_curves WHERE realization_id = ?1", [id])?;
        tx.execute("DELETE FROM realizations WHERE realization_id = ?1", [id])?;

        tx.commit()?;
        Ok(())
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection.pragma_update(None, "journal_mode", "WAL")?;
    connection.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
          job_id INTEGER PRIMARY KEY AUTOINCREMENT,
          description TEXT NOT NULL,
          checksum TEXT NOT NULL,
          config_json TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS realizations (
          realization_id INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id INTEGER NOT NULL,
          ordinal INTEGER NOT NULL,
          seed INTEGER NOT NULL,
          weight REAL NOT NULL,
          sm_lt_path TEXT NOT NULL,
          gsim_lt_path TEXT NOT NULL,
          total_sources INTEGER NOT NULL,
          completed_sources INTEGER NOT NULL DEFAULT 0,
          is_complete INTEGER NOT NULL DEFAULT 0,
          FOREIGN KEY(job_id) REFERENCES jobs(job_id)
        );

        CREATE TABLE IF NOT EXISTS source_progress (
          realization_id INTEGER NOT NULL,
          source_id TEXT NOT NULL,
          is_complete INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY(realization_id, source_id),
          FOREIGN KEY(realization_id) REFERENCES realizations(realization_id)
        );

        CREATE TABLE IF NOT EXISTS curve_progress (
          realization_id INTEGER NOT NULL,
          site_id INTEGER NOT NULL,
          branches INTEGER NOT NULL,
          poes BLOB NOT NULL,
          PRIMARY KEY(realization_id, site_id),
          FOREIGN KEY(realization_id) REFERENCES realizations(realization_id)
        );

        CREATE TABLE IF NOT EXISTS hazard_curves (
          realization_id INTEGER NOT NULL,
          imt TEXT NOT NULL,
          site_id INTEGER NOT NULL,
          poes BLOB NOT NULL,
          PRIMARY KEY(realization_id, imt, site_id),
          FOREIGN KEY(realization_id) REFERENCES realizations(realization_id)
        );

        CREATE INDEX IF NOT EXISTS idx_realizations_job ON realizations(job_id, ordinal);
        CREATE INDEX IF NOT EXISTS idx_source_progress_pending
          ON source_progress(realization_id, is_complete);
        ",
    )?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES ('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [DB_SCHEMA_VERSION],
    )?;

    Ok(())
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        job_id: row.get(0)?,
        description: row.get(1)?,
        checksum: row.get(2)?,
        config_json: row.get(3)?,
        created_at: row.get(4)?,
    })
}

type RealizationRow = (
    RealizationId,
    JobId,
    u32,
    i64,
    f64,
    String,
    String,
    i64,
    i64,
    bool,
);

fn realization_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RealizationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode_realization(row: RealizationRow) -> Result<Realization> {
    let (id, job_id, ordinal, seed, weight, sm_path, gsim_path, total, completed, is_complete) =
        row;
    Ok(Realization {
        id,
        job_id,
        ordinal,
        seed,
        weight,
        sm_lt_path: serde_json::from_str(&sm_path)?,
        gsim_lt_path: serde_json::from_str(&gsim_path)?,
        total_sources: total as usize,
        completed_sources: completed as usize,
        is_complete,
    })
}

fn load_realization(connection: &Connection, id: RealizationId) -> Result<Realization> {
    let row = connection
        .query_row(
            "SELECT realization_id, job_id, ordinal, seed, weight, sm_lt_path, gsim_lt_path,
                    total_sources, completed_sources, is_complete
             FROM realizations WHERE realization_id = ?1",
            [id],
            realization_row,
        )
        .optional()?
        .ok_or(HazardError::RealizationNotFound(id))?;
    decode_realization(row)
}

/// `false` when the flag was already set. Unknown sources are an error.
fn flip_source_flag(tx: &Transaction<'_>, id: RealizationId, source_id: &str) -> Result<bool> {
    let changed = tx.execute(
        "UPDATE source_progress SET is_complete = 1
         WHERE realization_id = ?1 AND source_id = ?2 AND is_complete = 0",
        params![id, source_id],
    )?;
    if changed == 1 {
        return Ok(true);
    }

    let exists = tx
        .query_row(
            "SELECT 1 FROM source_progress WHERE realization_id = ?1 AND source_id = ?2",
            params![id, source_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if exists {
        Ok(false)
    } else {
        Err(HazardError::SourceNotFound {
            realization_id: id,
            source_id: source_id.to_string(),
        })
    }
}

fn merge_in(
    tx: &Transaction<'_>,
    id: RealizationId,
    contribution: CurveCollection,
) -> Result<MergeOutcome> {
    let mut record = load_realization(tx, id)?;

    for (sid, curve) in contribution {
        let existing = tx
            .query_row(
                "SELECT branches, poes FROM curve_progress WHERE realization_id = ?1 AND site_id = ?2",
                params![id, sid],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;

        let current = match existing {
            Some((branches, blob)) => Poe::Curve(PoeCurve::from_flat(
                Arc::clone(curve.slices()),
                branches as usize,
                decode_poes(&blob)?,
            )?),
            None => Poe::Zero,
        };

        match combine_or(current, Poe::Curve(curve))? {
            Poe::Curve(combined) if !combined.is_zero() => {
                upsert_progress(tx, id, sid, &combined)?;
            }
            _ => {
                tx.execute(
                    "DELETE FROM curve_progress WHERE realization_id = ?1 AND site_id = ?2",
                    params![id, sid],
                )?;
            }
        }
    }

    let completed = record.count_completed_source();
    tx.execute(
        "UPDATE realizations SET completed_sources = ?1, is_complete = ?2 WHERE realization_id = ?3",
        params![record.completed_sources as i64, record.is_complete, id],
    )?;

    if completed {
        Ok(MergeOutcome::Completed(record))
    } else {
        Ok(MergeOutcome::Merged(record))
    }
}

fn upsert_progress(
    tx: &Transaction<'_>,
    id: RealizationId,
    sid: SiteId,
    curve: &PoeCurve,
) -> Result<()> {
    tx.execute(
        "INSERT INTO curve_progress(realization_id, site_id, branches, poes) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(realization_id, site_id) DO UPDATE SET
           branches = excluded.branches,
           poes = excluded.poes",
        params![
            id,
            sid,
            curve.num_branches() as i64,
            encode_poes(&curve.to_flat())
        ],
    )?;
    Ok(())
}

fn encode_poes(values: &[f64]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 8);
    for value in values {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn decode_poes(blob: &[u8]) -> Result<Vec<f64>> {
    if blob.len() % 8 != 0 {
        return Err(HazardError::InvalidSpec(format!(
            "curve blob length {} is not a multiple of 8",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0_u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poe_blobs_are_little_endian_f64() {
        let blob = encode_poes(&[0.5, 1.0]);
        assert_eq!(blob.len(), 16);
        assert_eq!(&blob[..8], &0.5_f64.to_le_bytes());
        assert_eq!(decode_poes(&blob).unwrap(), vec![0.5, 1.0]);
        assert!(decode_poes(&blob[..7]).is_err());
    }

    #[test]
    fn schema_is_idempotent_and_versioned() {
        let store = SqliteStore::open_in_memory().unwrap();
        let connection = store.connection().unwrap();
        ensure_schema(&connection).unwrap();

        let version: String = connection
            .query_row(
                "SELECT value FROM metadata WHERE key = 'db_schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, DB_SCHEMA_VERSION);
    }

    #[test]
    fn jobs_are_listed_in_creation_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.create_job("first", "abc", "{}").unwrap();
        let second = store.create_job("second", "def", "{}").unwrap();

        let jobs = store.jobs().unwrap();
        assert_eq!(
            jobs.iter().map(|job| job.job_id).collect::<Vec<_>>(),
            vec![first, second]
        );
        assert_eq!(store.job(second).unwrap().unwrap().description, "second");
        assert!(store.job(99).unwrap().is_none());
    }
}
