use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use psyeval_types::{CaseReport, CorpusReport, EvalRun, FailureRecord, MetricSummary, Target};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection lock is poisoned")]
    Poisoned,
    #[error("run {0} does not exist")]
    UnknownRun(i64),
}

/// SQLite persistence for evaluation runs.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEntity {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    pub cases: i64,
    pub coverage: Option<f64>,
}

impl Store {
    /// Open a store at the given path (e.g., "psyeval.db")
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .with_context(|| format!("Failed to open store {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL,
                metadata TEXT,
                corpus TEXT
            );

            CREATE TABLE IF NOT EXISTS cases (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL,
                case_id TEXT NOT NULL,
                school TEXT NOT NULL,
                coverage REAL NOT NULL,
                composite REAL,
                complete BOOLEAN NOT NULL,
                report TEXT NOT NULL,
                FOREIGN KEY(run_id) REFERENCES runs(id)
            );

            CREATE TABLE IF NOT EXISTS scores (
                id INTEGER PRIMARY KEY,
                case_row INTEGER NOT NULL,
                metric TEXT NOT NULL,
                session_index INTEGER,
                value TEXT NOT NULL,
                scalar REAL,
                rationale TEXT,
                FOREIGN KEY(case_row) REFERENCES cases(id)
            );

            CREATE TABLE IF NOT EXISTS failures (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL,
                case_row INTEGER,
                case_id TEXT NOT NULL,
                metric TEXT,
                session_index INTEGER,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                FOREIGN KEY(run_id) REFERENCES runs(id),
                FOREIGN KEY(case_row) REFERENCES cases(id)
            );

            CREATE TABLE IF NOT EXISTS metric_summaries (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL,
                scope TEXT NOT NULL,
                metric TEXT NOT NULL,
                succeeded INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                coverage REAL NOT NULL,
                mean REAL,
                aggregate TEXT,
                FOREIGN KEY(run_id) REFERENCES runs(id)
            );",
        )?;
        Ok(())
    }

    /// Create a new run entry
    pub fn create_run(&self, metadata: Option<serde_json::Value>) -> Result<i64> {
        let conn = self.lock()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO runs (created_at, metadata) VALUES (?1, ?2)",
            params![now.to_rfc3339(), metadata.map(|v| v.to_string())],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Save a full evaluation run into the database
    pub fn save_run(&self, run_id: i64, run: &EvalRun) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE runs SET corpus = ?1 WHERE id = ?2",
            params![serde_json::to_string(&run.corpus)?, run_id],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownRun(run_id).into());
        }

        // 1. Cases with their scores and failures
        for report in &run.cases {
            tx.execute(
                "INSERT INTO cases (run_id, case_id, school, coverage, composite, complete, report)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    report.case_id,
                    report.school.as_str(),
                    report.coverage,
                    report.composite,
                    report.complete,
                    serde_json::to_string(report)?
                ],
            )?;
            let case_row = tx.last_insert_rowid();

            for score in &report.scores {
                tx.execute(
                    "INSERT INTO scores (case_row, metric, session_index, value, scalar, rationale)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        case_row,
                        score.metric,
                        session_index(score.target),
                        serde_json::to_string(&score.value)?,
                        score.value.as_scalar(),
                        score.rationale
                    ],
                )?;
            }

            for failure in &report.failures {
                insert_failure(&tx, run_id, Some(case_row), failure)?;
            }

            insert_summaries(&tx, run_id, &format!("case:{}", report.case_id), &report.metrics)?;
        }

        // 2. Rejected inputs have no case row
        for failure in &run.corpus.rejected {
            insert_failure(&tx, run_id, None, failure)?;
        }

        // 3. Corpus, school and stage summaries
        insert_summaries(&tx, run_id, "corpus", &run.corpus.metrics)?;
        for group in &run.corpus.schools {
            insert_summaries(&tx, run_id, &format!("school:{}", group.key), &group.metrics)?;
        }
        for group in &run.corpus.stages {
            insert_summaries(&tx, run_id, &format!("stage:{}", group.key), &group.metrics)?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn list_runs(&self) -> Result<Vec<RunEntity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT r.id, r.created_at, r.metadata, r.corpus,
                    (SELECT COUNT(*) FROM cases c WHERE c.run_id = r.id)
             FROM runs r ORDER BY r.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (id, created_at, metadata, corpus, cases) = row?;
            let corpus: Option<CorpusReport> =
                corpus.map(|c| serde_json::from_str(&c)).transpose()?;
            runs.push(RunEntity {
                id,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .with_context(|| format!("Invalid timestamp for run {id}"))?
                    .with_timezone(&Utc),
                metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
                cases,
                coverage: corpus.map(|c| c.coverage),
            });
        }
        Ok(runs)
    }

    /// Corpus report of a saved run, `None` if the run was never saved.
    pub fn corpus(&self, run_id: i64) -> Result<Option<CorpusReport>> {
        let conn = self.lock()?;
        let corpus: Option<Option<String>> = conn
            .query_row("SELECT corpus FROM runs WHERE id = ?1", params![run_id], |row| row.get(0))
            .optional()?;
        match corpus {
            None => Err(StoreError::UnknownRun(run_id).into()),
            Some(None) => Ok(None),
            Some(Some(json)) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    /// Case reports of a run, in the order they were saved.
    pub fn case_reports(&self, run_id: i64) -> Result<Vec<CaseReport>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT report FROM cases WHERE run_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        let mut reports = Vec::new();
        for json in rows {
            reports.push(serde_json::from_str(&json?)?);
        }
        Ok(reports)
    }

    /// Number of failure records per failure kind.
    pub fn failure_counts(&self, run_id: i64) -> Result<BTreeMap<String, usize>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT kind, COUNT(*) FROM failures WHERE run_id = ?1 GROUP BY kind")?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (kind, n) = row?;
            counts.insert(kind, n as usize);
        }
        Ok(counts)
    }

    /// Mean of a scalar metric in one scope.
    ///
    /// Scopes are `corpus`, `case:<id>`, `school:<name>` and `stage:<name>`.
    pub fn metric_mean(&self, run_id: i64, scope: &str, metric: &str) -> Result<Option<f64>> {
        let conn = self.lock()?;
        let mean: Option<Option<f64>> = conn
            .query_row(
                "SELECT mean FROM metric_summaries
                 WHERE run_id = ?1 AND scope = ?2 AND metric = ?3",
                params![run_id, scope, metric],
                |row| row.get(0),
            )
            .optional()?;
        Ok(mean.flatten())
    }
}

fn session_index(target: Target) -> Option<u32> {
    match target {
        Target::Case => None,
        Target::Session(index) => Some(index),
    }
}

fn insert_failure(
    tx: &rusqlite::Transaction<'_>,
    run_id: i64,
    case_row: Option<i64>,
    failure: &FailureRecord,
) -> Result<()> {
    tx.execute(
        "INSERT INTO failures (run_id, case_row, case_id, metric, session_index, kind, message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run_id,
            case_row,
            failure.case_id,
            failure.metric,
            session_index(failure.target),
            failure.kind.as_str(),
            failure.message
        ],
    )?;
    Ok(())
}

fn insert_summaries(
    tx: &rusqlite::Transaction<'_>,
    run_id: i64,
    scope: &str,
    summaries: &[MetricSummary],
) -> Result<()> {
    for summary in summaries {
        tx.execute(
            "INSERT INTO metric_summaries
                 (run_id, scope, metric, succeeded, failed, coverage, mean, aggregate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                scope,
                summary.metric,
                summary.succeeded as i64,
                summary.failed as i64,
                summary.coverage,
                summary.aggregate.as_ref().and_then(|a| a.mean()),
                summary.aggregate.as_ref().map(serde_json::to_string).transpose()?
            ],
        )?;
    }
    Ok(())
}
