use crate::error::is_unique_violation;
use crate::rows::{experiment_from_row, run_info_from_row, RUN_COLUMNS};
use crate::{MetaStore, RequestContext, StoreError};
use mlmeta_core::{now_millis, Experiment, ExperimentTag, LifecycleStage, RunInfo, RunTag};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

pub(crate) fn fetch_run(conn: &Connection, run_id: &str) -> Result<Option<RunInfo>, StoreError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_uuid = ?1");
    Ok(conn
        .query_row(&sql, [run_id], run_info_from_row)
        .optional()?)
}

pub(crate) fn require_run(conn: &Connection, run_id: &str) -> Result<RunInfo, StoreError> {
    fetch_run(conn, run_id)?.ok_or_else(|| {
        StoreError::ResourceDoesNotExist(format!("Run with id={run_id} not found"))
    })
}

/// Loads the run and refuses writes against a deleted one.
pub(crate) fn require_active_run(conn: &Connection, run_id: &str) -> Result<RunInfo, StoreError> {
    let run = require_run(conn, run_id)?;
    if run.lifecycle_stage != LifecycleStage::Active {
        return Err(StoreError::InvalidState(format!(
            "The run {run_id} must be in the 'active' state. Current state is {}.",
            run.lifecycle_stage
        )));
    }
    Ok(run)
}

fn fetch_experiment(
    conn: &Connection,
    experiment_id: i64,
) -> Result<Option<Experiment>, StoreError> {
    let experiment = conn
        .query_row(
            "
            SELECT experiment_id, name, artifact_location, lifecycle_stage, creation_time, last_update_time
            FROM experiments
            WHERE experiment_id = ?1
            ",
            [experiment_id],
            experiment_from_row,
        )
        .optional()?;

    let Some(mut experiment) = experiment else {
        return Ok(None);
    };

    let mut statement = conn.prepare(
        "SELECT key, value FROM experiment_tags WHERE experiment_id = ?1 ORDER BY key",
    )?;
    let rows = statement.query_map([experiment_id], |row| {
        Ok(ExperimentTag {
            key: row.get(0)?,
            value: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        })
    })?;
    for row in rows {
        experiment.tags.push(row?);
    }
    Ok(Some(experiment))
}

impl MetaStore {
    pub fn create_experiment(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        artifact_location: Option<&str>,
        tags: &[ExperimentTag],
    ) -> Result<i64, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidParameterValue(
                "Invalid experiment name: must not be empty".to_string(),
            ));
        }
        let artifact_root = self.config.default_artifact_root.clone();

        let experiment_id = self.transaction(ctx, "create_experiment", |tx| {
            let now = now_millis();
            tx.execute(
                "
                INSERT INTO experiments (name, artifact_location, lifecycle_stage, creation_time, last_update_time)
                VALUES (?1, ?2, 'active', ?3, ?3)
                ",
                params![name, artifact_location.unwrap_or_default(), now],
            )
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::ResourceAlreadyExists(format!(
                        "Experiment(name={name}) already exists."
                    ))
                } else {
                    StoreError::internal("error creating experiment", err)
                }
            })?;
            let experiment_id = tx.last_insert_rowid();

            if artifact_location.map_or(true, str::is_empty) {
                let location = format!(
                    "{}/{experiment_id}",
                    artifact_root.trim_end_matches('/')
                );
                tx.execute(
                    "UPDATE experiments SET artifact_location = ?1 WHERE experiment_id = ?2",
                    params![location, experiment_id],
                )?;
            }

            ctx.check("create_experiment")?;
            for tag in tags {
                tx.execute(
                    "
                    INSERT INTO experiment_tags (key, value, experiment_id) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key, experiment_id) DO UPDATE SET value=excluded.value
                    ",
                    params![tag.key, tag.value, experiment_id],
                )?;
            }
            Ok(experiment_id)
        })?;

        debug!(event = "experiment_created", experiment_id, name = name);
        Ok(experiment_id)
    }

    pub fn get_experiment(
        &self,
        ctx: &RequestContext,
        experiment_id: i64,
    ) -> Result<Experiment, StoreError> {
        self.read(ctx, "get_experiment", |conn| {
            fetch_experiment(conn, experiment_id)?.ok_or_else(|| {
                StoreError::ResourceDoesNotExist(format!(
                    "No Experiment with id={experiment_id} exists"
                ))
            })
        })
    }

    pub fn create_run(
        &mut self,
        ctx: &RequestContext,
        experiment_id: i64,
        run_name: &str,
        user_id: Option<&str>,
        start_time: i64,
        tags: &[RunTag],
    ) -> Result<RunInfo, StoreError> {
        let run = self.transaction(ctx, "create_run", |tx| {
            let experiment = fetch_experiment(tx, experiment_id)?.ok_or_else(|| {
                StoreError::ResourceDoesNotExist(format!(
                    "No Experiment with id={experiment_id} exists"
                ))
            })?;
            if experiment.lifecycle_stage != LifecycleStage::Active {
                return Err(StoreError::InvalidParameterValue(format!(
                    "The experiment {experiment_id} must be in the 'active' state. Current state is {}.",
                    experiment.lifecycle_stage
                )));
            }

            let run_id = Uuid::new_v4().simple().to_string();
            let artifact_uri = format!(
                "{}/{run_id}/artifacts",
                experiment.artifact_location.trim_end_matches('/')
            );
            tx.execute(
                "
                INSERT INTO runs (run_uuid, name, user_id, status, start_time, lifecycle_stage, artifact_uri, experiment_id)
                VALUES (?1, ?2, ?3, 'RUNNING', ?4, 'active', ?5, ?6)
                ",
                params![run_id, run_name, user_id, start_time, artifact_uri, experiment_id],
            )
            .map_err(|err| StoreError::internal("error creating run", err))?;

            for tag in tags {
                tx.execute(
                    "
                    INSERT INTO tags (key, value, run_uuid) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key, run_uuid) DO UPDATE SET value=excluded.value
                    ",
                    params![tag.key, tag.value, run_id],
                )?;
            }
            require_run(tx, &run_id)
        })?;

        debug!(event = "run_created", run_id = %run.run_id, experiment_id);
        Ok(run)
    }

    pub fn get_run_info(&self, ctx: &RequestContext, run_id: &str) -> Result<RunInfo, StoreError> {
        self.read(ctx, "get_run_info", |conn| require_run(conn, run_id))
    }

    /// Soft-deletes a run. Metric writes against it fail with `InvalidState` afterwards.
    pub fn delete_run(&mut self, ctx: &RequestContext, run_id: &str) -> Result<(), StoreError> {
        self.transaction(ctx, "delete_run", |tx| {
            require_run(tx, run_id)?;
            tx.execute(
                "UPDATE runs SET lifecycle_stage = 'deleted', deleted_time = ?1 WHERE run_uuid = ?2",
                params![now_millis(), run_id],
            )?;
            Ok(())
        })?;
        debug!(event = "run_deleted", run_id = run_id);
        Ok(())
    }

    pub fn restore_run(&mut self, ctx: &RequestContext, run_id: &str) -> Result<(), StoreError> {
        self.transaction(ctx, "restore_run", |tx| {
            require_run(tx, run_id)?;
            tx.execute(
                "UPDATE runs SET lifecycle_stage = 'active', deleted_time = NULL WHERE run_uuid = ?1",
                [run_id],
            )?;
            Ok(())
        })?;
        debug!(event = "run_restored", run_id = run_id);
        Ok(())
    }
}
