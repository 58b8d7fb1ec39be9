use crate::rows::stored_value;
use crate::tracking::{require_active_run, require_run};
use crate::{MetaStore, RequestContext, StoreError};
use mlmeta_core::{
    sanitize_value, select_latest, supersedes, LoggedModelMetric, Metric, MetricOrdering, RunInfo,
};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{HashMap, HashSet};
use std::slice;
use tracing::debug;

/// A metric observation as it lands in the history table, value already sanitized.
#[derive(Debug, Clone, PartialEq)]
struct HistoryRow {
    key: String,
    value: f64,
    timestamp: i64,
    step: i64,
    is_nan: bool,
    model_id: Option<String>,
    dataset_name: Option<String>,
    dataset_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HistoryIdentity {
    key: String,
    value_bits: u64,
    timestamp: i64,
    step: i64,
    is_nan: bool,
    model_id: Option<String>,
    dataset_name: Option<String>,
    dataset_digest: Option<String>,
}

impl HistoryRow {
    fn from_metric(metric: &Metric) -> Self {
        let (value, is_nan) = sanitize_value(metric.value);
        Self {
            key: metric.key.clone(),
            value,
            timestamp: metric.timestamp,
            step: metric.step,
            is_nan,
            model_id: metric.model_id.clone(),
            dataset_name: metric.dataset_name.clone(),
            dataset_digest: metric.dataset_digest.clone(),
        }
    }

    fn identity(&self) -> HistoryIdentity {
        HistoryIdentity {
            key: self.key.clone(),
            value_bits: self.value.to_bits(),
            timestamp: self.timestamp,
            step: self.step,
            is_nan: self.is_nan,
            model_id: self.model_id.clone(),
            dataset_name: self.dataset_name.clone(),
            dataset_digest: self.dataset_digest.clone(),
        }
    }

    fn into_metric(self) -> Metric {
        Metric {
            key: self.key,
            value: stored_value(self.value, self.is_nan),
            timestamp: self.timestamp,
            step: self.step,
            model_id: self.model_id,
            dataset_name: self.dataset_name,
            dataset_digest: self.dataset_digest,
        }
    }
}

impl MetricOrdering for HistoryRow {
    fn metric_key(&self) -> &str {
        &self.key
    }

    fn ordering_key(&self) -> (i64, i64, f64) {
        (self.step, self.timestamp, self.value)
    }
}

/// The current pointer row for one `(run, key)`.
#[derive(Debug, Clone, PartialEq)]
struct LatestRow {
    key: String,
    value: f64,
    timestamp: i64,
    step: i64,
    is_nan: bool,
}

impl MetricOrdering for LatestRow {
    fn metric_key(&self) -> &str {
        &self.key
    }

    fn ordering_key(&self) -> (i64, i64, f64) {
        (self.step, self.timestamp, self.value)
    }
}

/// Drops observations that repeat an earlier one in the same batch field for field.
fn dedupe_history(metrics: &[Metric]) -> Vec<HistoryRow> {
    let mut seen = HashSet::with_capacity(metrics.len());
    let mut rows = Vec::with_capacity(metrics.len());
    for metric in metrics {
        let row = HistoryRow::from_metric(metric);
        if seen.insert(row.identity()) {
            rows.push(row);
        }
    }
    rows
}

fn insert_history(
    conn: &Connection,
    run_id: &str,
    rows: &[HistoryRow],
) -> Result<usize, StoreError> {
    let mut statement = conn.prepare(
        "
        INSERT OR IGNORE INTO metrics (
            key,
            value,
            timestamp,
            run_uuid,
            step,
            is_nan,
            model_id,
            dataset_name,
            dataset_digest
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ",
    )?;

    let mut inserted = 0;
    for row in rows {
        inserted += statement.execute(params![
            row.key,
            row.value,
            row.timestamp,
            run_id,
            row.step,
            row.is_nan,
            row.model_id,
            row.dataset_name,
            row.dataset_digest,
        ])?;
    }
    Ok(inserted)
}

/// Copies observations tied to a logged model into the model-centric projection.
fn insert_logged_model_metrics(
    conn: &Connection,
    run: &RunInfo,
    rows: &[HistoryRow],
) -> Result<usize, StoreError> {
    let mut statement = conn.prepare(
        "
        INSERT OR IGNORE INTO logged_model_metrics (
            model_id,
            metric_name,
            metric_timestamp_ms,
            metric_step,
            metric_value,
            experiment_id,
            run_id,
            dataset_name,
            dataset_digest
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ",
    )?;

    let mut inserted = 0;
    for row in rows {
        let Some(model_id) = row.model_id.as_deref() else {
            continue;
        };
        inserted += statement.execute(params![
            model_id,
            row.key,
            row.timestamp,
            row.step,
            row.value,
            run.experiment_id,
            run.run_id,
            row.dataset_name,
            row.dataset_digest,
        ])?;
    }
    Ok(inserted)
}

/// Reads the current pointer rows for `keys`, `chunk_size` keys per statement.
///
/// Callers hold the write lock, so the rows cannot change until their transaction ends.
fn load_latest_rows(
    conn: &Connection,
    run_id: &str,
    keys: &[&str],
    chunk_size: usize,
) -> Result<HashMap<String, LatestRow>, StoreError> {
    let mut existing = HashMap::with_capacity(keys.len());
    for chunk in keys.chunks(chunk_size.max(1)) {
        let placeholders = (0..chunk.len())
            .map(|index| format!("?{}", index + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT key, value, timestamp, step, is_nan FROM latest_metrics \
             WHERE run_uuid = ?1 AND key IN ({placeholders})"
        );
        let mut statement = conn.prepare(&sql)?;
        let bound = std::iter::once(run_id).chain(chunk.iter().copied());
        let rows = statement.query_map(params_from_iter(bound), |row| {
            Ok(LatestRow {
                key: row.get(0)?,
                value: row.get(1)?,
                timestamp: row.get(2)?,
                step: row.get(3)?,
                is_nan: row.get(4)?,
            })
        })?;
        for row in rows {
            let row = row?;
            existing.insert(row.key.clone(), row);
        }
    }
    Ok(existing)
}

fn upsert_latest(conn: &Connection, run_id: &str, row: &HistoryRow) -> Result<(), StoreError> {
    conn.execute(
        "
        INSERT INTO latest_metrics (key, value, timestamp, step, is_nan, run_uuid)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(key, run_uuid) DO UPDATE SET
            value=excluded.value,
            timestamp=excluded.timestamp,
            step=excluded.step,
            is_nan=excluded.is_nan
        ",
        params![row.key, row.value, row.timestamp, row.step, row.is_nan, run_id],
    )?;
    Ok(())
}

/// Moves each key's pointer to the batch winner when the winner outranks what is stored.
fn update_latest(
    conn: &Connection,
    run_id: &str,
    rows: &[HistoryRow],
    chunk_size: usize,
) -> Result<usize, StoreError> {
    let winners = select_latest(rows);
    let keys = winners.keys().copied().collect::<Vec<_>>();
    let existing = load_latest_rows(conn, run_id, &keys, chunk_size)?;

    let mut updated = 0;
    for (key, winner) in winners {
        let replace = existing
            .get(key)
            .map_or(true, |current| supersedes(winner, current));
        if replace {
            upsert_latest(conn, run_id, winner)?;
            updated += 1;
        }
    }
    Ok(updated)
}

fn load_history(
    conn: &Connection,
    run_id: &str,
    key: Option<&str>,
) -> Result<Vec<HistoryRow>, StoreError> {
    let mut statement = conn.prepare(
        "
        SELECT key, value, timestamp, step, is_nan, model_id, dataset_name, dataset_digest
        FROM metrics
        WHERE run_uuid = ?1 AND (?2 IS NULL OR key = ?2)
        ORDER BY rowid ASC
        ",
    )?;
    let rows = statement.query_map(params![run_id, key], |row| {
        Ok(HistoryRow {
            key: row.get(0)?,
            value: row.get(1)?,
            timestamp: row.get(2)?,
            step: row.get(3)?,
            is_nan: row.get(4)?,
            model_id: row.get(5)?,
            dataset_name: row.get(6)?,
            dataset_digest: row.get(7)?,
        })
    })?;

    let mut history = Vec::new();
    for row in rows {
        history.push(row?);
    }
    Ok(history)
}

fn validate_metrics(metrics: &[Metric]) -> Result<(), StoreError> {
    if let Some(metric) = metrics.iter().find(|metric| metric.key.trim().is_empty()) {
        return Err(StoreError::InvalidParameterValue(format!(
            "Invalid metric name: '{}'. Metric names must not be empty.",
            metric.key
        )));
    }
    Ok(())
}

impl MetaStore {
    pub fn log_metric(
        &mut self,
        ctx: &RequestContext,
        run_id: &str,
        metric: &Metric,
    ) -> Result<(), StoreError> {
        self.log_metrics(ctx, run_id, slice::from_ref(metric))
    }

    /// Records a batch of observations for one run in a single transaction.
    ///
    /// History rows are inserted first (exact repeats are ignored), then model-tied rows are
    /// fanned out, then each key's latest pointer is moved to the batch winner if that winner
    /// outranks the stored one. A failure at any step rolls back the whole batch.
    pub fn log_metrics(
        &mut self,
        ctx: &RequestContext,
        run_id: &str,
        metrics: &[Metric],
    ) -> Result<(), StoreError> {
        let chunk_size = self.config.latest_metrics_chunk_size;
        let history = dedupe_history(metrics);

        let (inserted, fanned_out, updated) = self
            .transaction(ctx, "log_metrics", |tx| {
                let run = require_active_run(tx, run_id)?;
                validate_metrics(metrics)?;
                if history.is_empty() {
                    return Ok((0, 0, 0));
                }
                let inserted = insert_history(tx, run_id, &history)?;
                ctx.check("log_metrics")?;
                let fanned_out = insert_logged_model_metrics(tx, &run, &history)?;
                ctx.check("log_metrics")?;
                let updated = update_latest(tx, run_id, &history, chunk_size)?;
                Ok((inserted, fanned_out, updated))
            })
            .map_err(StoreError::wrap("error logging metrics"))?;

        debug!(
            event = "metrics_logged",
            run_id = run_id,
            submitted = metrics.len(),
            inserted,
            fanned_out,
            latest_updated = updated
        );
        Ok(())
    }

    pub fn get_metric_history(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        key: &str,
    ) -> Result<Vec<Metric>, StoreError> {
        self.read(ctx, "get_metric_history", |conn| {
            require_run(conn, run_id)?;
            let mut history = load_history(conn, run_id, Some(key))?;
            history.sort_by_key(|row| (row.step, row.timestamp));
            Ok(history.into_iter().map(HistoryRow::into_metric).collect())
        })
    }

    /// Current latest value per key for a run, sorted by key.
    pub fn get_latest_metrics(
        &self,
        ctx: &RequestContext,
        run_id: &str,
    ) -> Result<Vec<Metric>, StoreError> {
        self.read(ctx, "get_latest_metrics", |conn| {
            require_run(conn, run_id)?;
            let mut statement = conn.prepare(
                "
                SELECT key, value, timestamp, step, is_nan
                FROM latest_metrics
                WHERE run_uuid = ?1
                ORDER BY key ASC
                ",
            )?;
            let rows = statement.query_map([run_id], |row| {
                let value: f64 = row.get(1)?;
                let is_nan: bool = row.get(4)?;
                Ok(Metric::new(
                    row.get::<_, String>(0)?,
                    stored_value(value, is_nan),
                    row.get(2)?,
                    row.get(3)?,
                ))
            })?;

            let mut latest = Vec::new();
            for row in rows {
                latest.push(row?);
            }
            Ok(latest)
        })
    }

    /// Recomputes a run's latest pointers from its full history. Returns the rows written.
    pub fn rebuild_latest_metrics(
        &mut self,
        ctx: &RequestContext,
        run_id: &str,
    ) -> Result<usize, StoreError> {
        let written = self
            .transaction(ctx, "rebuild_latest_metrics", |tx| {
                require_run(tx, run_id)?;
                let history = load_history(tx, run_id, None)?;
                tx.execute("DELETE FROM latest_metrics WHERE run_uuid = ?1", [run_id])?;
                ctx.check("rebuild_latest_metrics")?;

                let winners = select_latest(&history);
                for winner in winners.values() {
                    upsert_latest(tx, run_id, *winner)?;
                }
                Ok(winners.len())
            })
            .map_err(StoreError::wrap("error rebuilding latest metrics"))?;

        debug!(
            event = "latest_metrics_rebuilt",
            run_id = run_id,
            written
        );
        Ok(written)
    }

    pub fn get_logged_model_metrics(
        &self,
        ctx: &RequestContext,
        model_id: &str,
    ) -> Result<Vec<LoggedModelMetric>, StoreError> {
        self.read(ctx, "get_logged_model_metrics", |conn| {
            let mut statement = conn.prepare(
                "
                SELECT model_id, metric_name, metric_timestamp_ms, metric_step, metric_value,
                       experiment_id, run_id, dataset_name, dataset_digest
                FROM logged_model_metrics
                WHERE model_id = ?1
                ORDER BY metric_name ASC, metric_step ASC, metric_timestamp_ms ASC
                ",
            )?;
            let rows = statement.query_map([model_id], |row| {
                Ok(LoggedModelMetric {
                    model_id: row.get(0)?,
                    metric_name: row.get(1)?,
                    metric_timestamp_ms: row.get(2)?,
                    metric_step: row.get(3)?,
                    metric_value: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
                    experiment_id: row.get(5)?,
                    run_id: row.get(6)?,
                    dataset_name: row.get(7)?,
                    dataset_digest: row.get(8)?,
                })
            })?;

            let mut metrics = Vec::new();
            for row in rows {
                metrics.push(row?);
            }
            Ok(metrics)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn store_with_run() -> (MetaStore, String) {
        let mut store = MetaStore::open_in_memory().expect("open db");
        let ctx = RequestContext::background();
        let experiment_id = store
            .create_experiment(&ctx, "exp", None, &[])
            .expect("create experiment");
        let run = store
            .create_run(&ctx, experiment_id, "run", None, 0, &[])
            .expect("create run");
        (store, run.run_id)
    }

    fn point(key: &str, step: i64, timestamp: i64, value: f64) -> Metric {
        Metric::new(key, value, timestamp, step)
    }

    fn latest(store: &MetaStore, run_id: &str, key: &str) -> Metric {
        store
            .get_latest_metrics(&RequestContext::background(), run_id)
            .expect("latest metrics")
            .into_iter()
            .find(|metric| metric.key == key)
            .expect("latest row")
    }

    #[test]
    fn batch_winner_is_highest_step() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        store
            .log_metrics(
                &ctx,
                &run_id,
                &[
                    point("loss", 1, 10, 1.0),
                    point("loss", 1, 10, 5.0),
                    point("loss", 2, 5, 0.0),
                ],
            )
            .expect("log metrics");

        let winner = latest(&store, &run_id, "loss");
        assert_eq!((winner.step, winner.timestamp, winner.value), (2, 5, 0.0));
        assert_eq!(
            store
                .get_metric_history(&ctx, &run_id, "loss")
                .expect("history")
                .len(),
            3
        );
    }

    #[test]
    fn later_timestamp_wins_within_a_step() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        store
            .log_metrics(
                &ctx,
                &run_id,
                &[point("loss", 1, 10, 1.0), point("loss", 1, 20, 0.0)],
            )
            .expect("log metrics");

        let winner = latest(&store, &run_id, "loss");
        assert_eq!((winner.step, winner.timestamp, winner.value), (1, 20, 0.0));
    }

    #[test]
    fn identical_observation_is_stored_once() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        let metric = point("acc", 3, 100, 0.75);
        store
            .log_metrics(&ctx, &run_id, &[metric.clone(), metric.clone()])
            .expect("log batch");
        store
            .log_metric(&ctx, &run_id, &metric)
            .expect("log again");

        let history = store
            .get_metric_history(&ctx, &run_id, "acc")
            .expect("history");
        assert_eq!(history, vec![metric.clone()]);
        assert_eq!(latest(&store, &run_id, "acc"), metric);
    }

    #[test]
    fn older_observation_does_not_move_the_pointer() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        store
            .log_metric(&ctx, &run_id, &point("loss", 5, 50, 0.1))
            .expect("log newer");
        store
            .log_metric(&ctx, &run_id, &point("loss", 4, 99, 9.0))
            .expect("log older step");

        let winner = latest(&store, &run_id, "loss");
        assert_eq!((winner.step, winner.timestamp), (5, 50));
    }

    #[test]
    fn non_finite_values_are_sanitized() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        store
            .log_metrics(
                &ctx,
                &run_id,
                &[
                    point("nan", 0, 1, f64::NAN),
                    point("pos", 0, 1, f64::INFINITY),
                    point("neg", 0, 1, f64::NEG_INFINITY),
                ],
            )
            .expect("log metrics");

        let stored_nan: (f64, bool) = store
            .conn
            .query_row(
                "SELECT value, is_nan FROM metrics WHERE key = 'nan'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("nan row");
        assert_eq!(stored_nan, (0.0, true));
        assert!(latest(&store, &run_id, "nan").value.is_nan());
        assert_eq!(latest(&store, &run_id, "pos").value, f64::MAX);
        assert_eq!(latest(&store, &run_id, "neg").value, f64::MIN);
    }

    #[test]
    fn model_tied_metrics_are_fanned_out() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        store
            .log_metrics(
                &ctx,
                &run_id,
                &[
                    point("auc", 1, 10, 0.9)
                        .with_model("m-1")
                        .with_dataset("holdout", "abc123"),
                    point("auc", 1, 10, 0.8),
                ],
            )
            .expect("log metrics");

        let fanned = store
            .get_logged_model_metrics(&ctx, "m-1")
            .expect("model metrics");
        assert_eq!(fanned.len(), 1);
        assert_eq!(fanned[0].metric_name, "auc");
        assert_eq!(fanned[0].run_id, run_id);
        assert_eq!(fanned[0].dataset_digest.as_deref(), Some("abc123"));
    }

    #[test]
    fn model_projection_keeps_observations_that_differ_in_value() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        let batch = [
            point("auc", 1, 10, 0.9).with_model("m-1"),
            point("auc", 1, 10, 0.8).with_model("m-1"),
            point("auc", 1, 10, 0.8)
                .with_model("m-1")
                .with_dataset("holdout", "abc123"),
        ];
        store.log_metrics(&ctx, &run_id, &batch).expect("log metrics");
        store
            .log_metrics(&ctx, &run_id, &batch)
            .expect("resubmit batch");

        let mut values = store
            .get_logged_model_metrics(&ctx, "m-1")
            .expect("model metrics")
            .into_iter()
            .map(|metric| (metric.metric_value, metric.dataset_name))
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        assert_eq!(
            values,
            vec![
                (0.8, None),
                (0.8, Some("holdout".to_string())),
                (0.9, None),
            ]
        );
    }

    #[test]
    fn empty_batch_still_checks_the_run() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        store
            .log_metrics(&ctx, &run_id, &[])
            .expect("empty batch on active run");

        let err = store
            .log_metrics(&ctx, "missing-run", &[])
            .expect_err("unknown run");
        assert_eq!(err.code(), ErrorCode::ResourceDoesNotExist);

        store.delete_run(&ctx, &run_id).expect("delete run");
        let err = store
            .log_metrics(&ctx, &run_id, &[])
            .expect_err("deleted run");
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[test]
    fn deleted_run_rejects_metrics() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        store.delete_run(&ctx, &run_id).expect("delete run");

        let err = store
            .log_metric(&ctx, &run_id, &point("loss", 0, 0, 1.0))
            .expect_err("deleted run");
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[test]
    fn empty_key_is_invalid() {
        let (mut store, run_id) = store_with_run();
        let err = store
            .log_metric(
                &RequestContext::background(),
                &run_id,
                &point(" ", 0, 0, 1.0),
            )
            .expect_err("empty key");
        assert_eq!(err.code(), ErrorCode::InvalidParameterValue);
    }

    #[test]
    fn small_chunks_still_find_every_pointer() {
        let mut config = crate::StoreConfig::in_memory();
        config.latest_metrics_chunk_size = 2;
        let mut store = MetaStore::with_config(config).expect("open db");
        let ctx = RequestContext::background();
        let experiment_id = store
            .create_experiment(&ctx, "exp", None, &[])
            .expect("create experiment");
        let run_id = store
            .create_run(&ctx, experiment_id, "run", None, 0, &[])
            .expect("create run")
            .run_id;

        let keys = ["a", "b", "c", "d", "e"];
        let first = keys
            .iter()
            .map(|key| point(key, 2, 10, 1.0))
            .collect::<Vec<_>>();
        store.log_metrics(&ctx, &run_id, &first).expect("first batch");
        let stale = keys
            .iter()
            .map(|key| point(key, 1, 99, 7.0))
            .collect::<Vec<_>>();
        store.log_metrics(&ctx, &run_id, &stale).expect("stale batch");

        let latest = store.get_latest_metrics(&ctx, &run_id).expect("latest");
        assert_eq!(latest.len(), 5);
        assert!(latest.iter().all(|metric| metric.step == 2));
    }

    #[test]
    fn rebuild_matches_incremental_pointers() {
        let (mut store, run_id) = store_with_run();
        let ctx = RequestContext::background();
        store
            .log_metrics(
                &ctx,
                &run_id,
                &[point("loss", 1, 10, 1.0), point("acc", 1, 10, 0.5)],
            )
            .expect("first batch");
        store
            .log_metrics(
                &ctx,
                &run_id,
                &[point("loss", 3, 5, 0.2), point("acc", 1, 10, 0.4)],
            )
            .expect("second batch");

        let incremental = store.get_latest_metrics(&ctx, &run_id).expect("latest");
        store
            .conn
            .execute("DELETE FROM latest_metrics", [])
            .expect("drop pointers");
        let written = store
            .rebuild_latest_metrics(&ctx, &run_id)
            .expect("rebuild");
        assert_eq!(written, 2);
        assert_eq!(
            store.get_latest_metrics(&ctx, &run_id).expect("latest"),
            incremental
        );
    }
}
