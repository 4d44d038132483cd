use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use stepgraph_core::error::{Result, StepgraphError};
use stepgraph_core::traits::RunStore;
use stepgraph_core::types::{
    GraphId, GraphRecord, NewStep, RunId, RunState, RunSummary, StepRecord,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS graphs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        graphName TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS steps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        runId TEXT NOT NULL,
        graphId INTEGER NOT NULL REFERENCES graphs(id),
        nodeType TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT NOT NULL,
        routed TEXT NOT NULL,
        datetime TEXT NOT NULL,
        success INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(runId, id);
    CREATE INDEX IF NOT EXISTS idx_steps_graph ON steps(graphId, id);";

/// SQLite-backed run history.
///
/// A single connection sits behind a mutex, so every step insert is atomic
/// and concurrent runs sharing the store are serialized.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> StepgraphError {
    StepgraphError::Database(e.to_string())
}

/// Fixed-width RFC 3339 so that `MIN`/`MAX` over the text column order correctly.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse the `datetime` column at `idx`. A malformed value fails the row.
fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            warn!(value = %s, error = %e, "Unparseable step timestamp");
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

impl SqliteRunStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets history readers run alongside a writing executor
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of graph rows with the given name (0 or 1).
    pub fn graph_count(&self, graph_name: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(db_err)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM graphs WHERE graphName = ?1",
                params![graph_name],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

impl RunStore for SqliteRunStore {
    fn ensure_graph(&self, graph_name: &str) -> BoxFuture<'_, Result<GraphId>> {
        let graph_name = graph_name.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;

            conn.execute(
                "INSERT OR IGNORE INTO graphs (graphName) VALUES (?1)",
                params![graph_name],
            )
            .map_err(db_err)?;

            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM graphs WHERE graphName = ?1",
                    params![graph_name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match id {
                Some(id) => Ok(GraphId(id)),
                None => Err(StepgraphError::Config(format!(
                    "Graph '{}' missing after ensure",
                    graph_name
                ))),
            }
        })
    }

    fn append_step(&self, step: &NewStep) -> BoxFuture<'_, Result<()>> {
        let step = step.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;

            conn.execute(
                "INSERT INTO steps (runId, graphId, nodeType, input, output, routed, datetime, success)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    step.run_id.0,
                    step.graph_id.0,
                    step.node_type,
                    step.input,
                    step.output,
                    step.routed,
                    format_ts(&step.timestamp),
                    step.success as i64,
                ],
            )
            .map_err(db_err)?;

            Ok(())
        })
    }

    fn find_graph(&self, graph_name: &str) -> BoxFuture<'_, Result<Option<GraphRecord>>> {
        let graph_name = graph_name.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.query_row(
                "SELECT id, graphName FROM graphs WHERE graphName = ?1",
                params![graph_name],
                |row| {
                    Ok(GraphRecord {
                        id: GraphId(row.get(0)?),
                        graph_name: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<GraphRecord>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT id, graphName FROM graphs ORDER BY id ASC")
                .map_err(db_err)?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(GraphRecord {
                        id: GraphId(row.get(0)?),
                        graph_name: row.get(1)?,
                    })
                })
                .map_err(db_err)?;

            let mut graphs = Vec::new();
            for row in rows {
                graphs.push(row.map_err(db_err)?);
            }
            Ok(graphs)
        })
    }

    fn list_runs(
        &self,
        graph_id: Option<GraphId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let graph_id = graph_id.map(|g| g.0);

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT r.runId, r.graphId, g.graphName, r.steps, r.started_at,
                            r.finished_at, last.success, last.routed
                     FROM (
                         SELECT runId, graphId, COUNT(*) AS steps,
                                MIN(datetime) AS started_at, MAX(datetime) AS finished_at,
                                MAX(id) AS last_id
                         FROM steps
                         WHERE ?1 IS NULL OR graphId = ?1
                         GROUP BY runId, graphId
                     ) r
                     JOIN steps last ON last.id = r.last_id
                     JOIN graphs g ON g.id = r.graphId
                     ORDER BY r.last_id DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![graph_id, limit as i64], |row| {
                    let started: String = row.get(4)?;
                    let finished: String = row.get(5)?;
                    let success: i64 = row.get(6)?;
                    let routed: String = row.get(7)?;
                    Ok(RunSummary {
                        run_id: RunId(row.get(0)?),
                        graph_id: GraphId(row.get(1)?),
                        graph_name: row.get(2)?,
                        steps: row.get::<_, i64>(3)? as usize,
                        started_at: parse_ts(4, &started)?,
                        finished_at: parse_ts(5, &finished)?,
                        state: RunState::from_last_step(success != 0, &routed),
                    })
                })
                .map_err(db_err)?;

            let mut runs = Vec::new();
            for row in rows {
                runs.push(row.map_err(db_err)?);
            }
            Ok(runs)
        })
    }

    fn load_steps(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        let run_id = run_id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, runId, graphId, nodeType, input, output, routed, datetime, success
                     FROM steps
                     WHERE runId = ?1
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![run_id], |row| {
                    let ts_str: String = row.get(7)?;
                    Ok(StepRecord {
                        id: row.get(0)?,
                        run_id: RunId(row.get(1)?),
                        graph_id: GraphId(row.get(2)?),
                        node_type: row.get(3)?,
                        input: row.get(4)?,
                        output: row.get(5)?,
                        routed: row.get(6)?,
                        timestamp: parse_ts(7, &ts_str)?,
                        success: row.get::<_, i64>(8)? != 0,
                    })
                })
                .map_err(db_err)?;

            let mut steps = Vec::new();
            for row in rows {
                steps.push(row.map_err(db_err)?);
            }
            Ok(steps)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(run_id: &RunId, graph_id: GraphId, node: &str, routed: &str, success: bool) -> NewStep {
        NewStep {
            run_id: run_id.clone(),
            graph_id,
            node_type: node.to_string(),
            input: "\"in\"".to_string(),
            output: "\"out\"".to_string(),
            routed: routed.to_string(),
            success,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ensure_graph_is_idempotent() {
        let store = SqliteRunStore::in_memory().unwrap();

        let first = store.ensure_graph("scrape").await.unwrap();
        let second = store.ensure_graph("scrape").await.unwrap();
        let other = store.ensure_graph("summarize").await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(store.graph_count("scrape").unwrap(), 1);
        assert_eq!(store.list_graphs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_find_graph() {
        let store = SqliteRunStore::in_memory().unwrap();
        assert!(store.find_graph("missing").await.unwrap().is_none());

        let id = store.ensure_graph("present").await.unwrap();
        let found = store.find_graph("present").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.graph_name, "present");
    }

    #[tokio::test]
    async fn test_steps_keep_insertion_order() {
        let store = SqliteRunStore::in_memory().unwrap();
        let gid = store.ensure_graph("g").await.unwrap();
        let run = RunId::new();

        for node in ["a", "b", "c"] {
            store.append_step(&step(&run, gid, node, "next", true)).await.unwrap();
        }

        let steps = store.load_steps(&run).await.unwrap();
        let order: Vec<_> = steps.iter().map(|s| s.node_type.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(steps.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(steps[0].input, "\"in\"");
    }

    #[tokio::test]
    async fn test_list_runs_derives_state() {
        let store = SqliteRunStore::in_memory().unwrap();
        let gid = store.ensure_graph("g").await.unwrap();

        let done = RunId::new();
        store.append_step(&step(&done, gid, "a", "b", true)).await.unwrap();
        store.append_step(&step(&done, gid, "b", "END", true)).await.unwrap();

        let failed = RunId::new();
        store.append_step(&step(&failed, gid, "a", "a", false)).await.unwrap();

        let capped = RunId::new();
        store.append_step(&step(&capped, gid, "a", "a", true)).await.unwrap();
        store.append_step(&step(&capped, gid, "a", "MAX_STEPS", false)).await.unwrap();

        let runs = store.list_runs(Some(gid), 10).await.unwrap();
        assert_eq!(runs.len(), 3);
        // Newest first
        assert_eq!(runs[0].run_id, capped);
        assert_eq!(runs[0].state, RunState::CapReached);
        assert_eq!(runs[1].run_id, failed);
        assert_eq!(runs[1].state, RunState::Failed);
        assert_eq!(runs[2].run_id, done);
        assert_eq!(runs[2].state, RunState::Completed);
        assert_eq!(runs[2].steps, 2);
        assert_eq!(runs[2].graph_name, "g");

        assert_eq!(store.list_runs(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_runs_filters_by_graph() {
        let store = SqliteRunStore::in_memory().unwrap();
        let g1 = store.ensure_graph("one").await.unwrap();
        let g2 = store.ensure_graph("two").await.unwrap();

        store.append_step(&step(&RunId::new(), g1, "a", "END", true)).await.unwrap();
        store.append_step(&step(&RunId::new(), g2, "a", "END", true)).await.unwrap();

        let runs = store.list_runs(Some(g2), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].graph_name, "two");
        assert_eq!(store.list_runs(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_columns_use_persisted_names() {
        let store = SqliteRunStore::in_memory().unwrap();
        let gid = store.ensure_graph("scrape").await.unwrap();
        let run = RunId::new();
        store.append_step(&step(&run, gid, "fetch", "END", true)).await.unwrap();

        let conn = store.conn.lock().unwrap();
        let (run_id, graph_id, node_type, routed, success): (String, i64, String, String, i64) = conn
            .query_row(
                "SELECT runId, graphId, nodeType, routed, success FROM steps",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .unwrap();
        assert_eq!(run_id, run.0);
        assert_eq!(graph_id, gid.0);
        assert_eq!(node_type, "fetch");
        assert_eq!(routed, "END");
        assert_eq!(success, 1);

        let name: String = conn
            .query_row(
                "SELECT graphName FROM graphs WHERE id = ?1",
                params![gid.0],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "scrape");
    }

    #[tokio::test]
    async fn test_malformed_timestamp_is_an_error() {
        let store = SqliteRunStore::in_memory().unwrap();
        let gid = store.ensure_graph("g").await.unwrap();
        let run = RunId::new();
        store.append_step(&step(&run, gid, "a", "END", true)).await.unwrap();

        store
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE steps SET datetime = 'yesterday'", [])
            .unwrap();

        assert!(matches!(
            store.load_steps(&run).await,
            Err(StepgraphError::Database(_))
        ));
        assert!(matches!(
            store.list_runs(None, 10).await,
            Err(StepgraphError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let run = RunId::new();

        {
            let store = SqliteRunStore::open(&path).unwrap();
            let gid = store.ensure_graph("g").await.unwrap();
            store.append_step(&step(&run, gid, "a", "END", true)).await.unwrap();
        }

        let reopened = SqliteRunStore::open(&path).unwrap();
        let steps = reopened.load_steps(&run).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].is_terminal());
    }
}
