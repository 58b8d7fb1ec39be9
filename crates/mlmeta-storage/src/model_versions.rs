use crate::error::model_version_not_found;
use crate::registered_models::{require_registered_model, touch_registered_model};
use crate::rows::{model_version_from_row, MODEL_VERSION_COLUMNS};
use crate::{MetaStore, RequestContext, StoreError};
use mlmeta_core::lifecycle::{REDACTED_RUN_ID, REDACTED_RUN_LINK, REDACTED_SOURCE};
use mlmeta_core::{
    now_millis, validate_alias, ContractError, ModelVersion, ModelVersionStage,
    ModelVersionStatus, ModelVersionTag,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// Input for [`MetaStore::create_model_version`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewModelVersion {
    pub source: String,
    pub run_id: Option<String>,
    pub run_link: Option<String>,
    pub description: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<ModelVersionTag>,
}

impl NewModelVersion {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(ModelVersionTag::new(key, value));
        self
    }
}

/// Active (not soft-deleted) version row, without tags or aliases.
fn fetch_model_version(
    conn: &Connection,
    name: &str,
    version: i64,
) -> Result<Option<ModelVersion>, StoreError> {
    let sql = format!(
        "SELECT {MODEL_VERSION_COLUMNS} FROM model_versions \
         WHERE name = ?1 AND version = ?2 AND current_stage <> 'Deleted_Internal'"
    );
    Ok(conn
        .query_row(&sql, params![name, version], model_version_from_row)
        .optional()?)
}

pub(crate) fn require_model_version(
    conn: &Connection,
    name: &str,
    version: i64,
) -> Result<ModelVersion, StoreError> {
    fetch_model_version(conn, name, version)?.ok_or_else(|| model_version_not_found(name, version))
}

fn attach_aliases(conn: &Connection, model_version: &mut ModelVersion) -> Result<(), StoreError> {
    let mut statement = conn.prepare(
        "SELECT alias FROM registered_model_aliases WHERE name = ?1 AND version = ?2 ORDER BY alias",
    )?;
    let rows = statement.query_map(
        params![model_version.name, model_version.version],
        |row| row.get::<_, String>(0),
    )?;
    for row in rows {
        model_version.aliases.push(row?);
    }
    Ok(())
}

fn attach_tags(conn: &Connection, model_version: &mut ModelVersion) -> Result<(), StoreError> {
    let mut statement = conn.prepare(
        "SELECT key, value FROM model_version_tags WHERE name = ?1 AND version = ?2 ORDER BY key",
    )?;
    let rows = statement.query_map(
        params![model_version.name, model_version.version],
        |row| {
            Ok(ModelVersionTag {
                key: row.get(0)?,
                value: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        },
    )?;
    for row in rows {
        model_version.tags.push(row?);
    }
    Ok(())
}

fn load_model_version(
    conn: &Connection,
    name: &str,
    version: i64,
) -> Result<ModelVersion, StoreError> {
    let mut model_version = require_model_version(conn, name, version)?;
    attach_tags(conn, &mut model_version)?;
    attach_aliases(conn, &mut model_version)?;
    Ok(model_version)
}

/// Highest non-deleted version in each stage, ordered by version.
pub(crate) fn latest_versions_per_stage(
    conn: &Connection,
    name: &str,
) -> Result<Vec<ModelVersion>, StoreError> {
    let sql = format!(
        "
        SELECT {MODEL_VERSION_COLUMNS}
        FROM model_versions
        WHERE name = ?1
          AND current_stage <> 'Deleted_Internal'
          AND version = (
              SELECT MAX(inner_versions.version)
              FROM model_versions AS inner_versions
              WHERE inner_versions.name = model_versions.name
                AND inner_versions.current_stage = model_versions.current_stage
          )
        ORDER BY version ASC
        "
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map([name], model_version_from_row)?;

    let mut versions = Vec::new();
    for row in rows {
        let mut model_version = row?;
        attach_aliases(conn, &mut model_version)?;
        versions.push(model_version);
    }
    Ok(versions)
}

fn upsert_version_tag(
    conn: &Connection,
    name: &str,
    version: i64,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "
        INSERT INTO model_version_tags (key, value, name, version) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(key, name, version) DO UPDATE SET value=excluded.value
        ",
        params![key, value, name, version],
    )?;
    Ok(())
}

fn validate_tag_key(key: &str) -> Result<(), StoreError> {
    if key.trim().is_empty() {
        return Err(ContractError::MissingField { field: "key" }.into());
    }
    Ok(())
}

impl MetaStore {
    /// Registers the next version of `name`. Numbers are never reused, even after deletion.
    pub fn create_model_version(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        new_version: NewModelVersion,
    ) -> Result<ModelVersion, StoreError> {
        for tag in &new_version.tags {
            validate_tag_key(&tag.key)?;
        }

        let created = self
            .transaction(ctx, "create_model_version", |tx| {
                require_registered_model(tx, name)?;
                let version: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM model_versions WHERE name = ?1",
                    [name],
                    |row| row.get(0),
                )?;
                let now = now_millis();

                tx.execute(
                    "
                    INSERT INTO model_versions (
                        name,
                        version,
                        creation_time,
                        last_updated_time,
                        description,
                        user_id,
                        current_stage,
                        source,
                        run_id,
                        run_link,
                        status
                    ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ",
                    params![
                        name,
                        version,
                        now,
                        new_version.description,
                        new_version.user_id,
                        ModelVersionStage::None.as_str(),
                        new_version.source,
                        new_version.run_id,
                        new_version.run_link,
                        ModelVersionStatus::Ready.as_str(),
                    ],
                )?;
                for tag in &new_version.tags {
                    upsert_version_tag(tx, name, version, &tag.key, &tag.value)?;
                }
                touch_registered_model(tx, name, now)?;
                load_model_version(tx, name, version)
            })
            .map_err(StoreError::wrap("error creating model version"))?;

        debug!(
            event = "model_version_created",
            name = name,
            version = created.version
        );
        Ok(created)
    }

    pub fn get_model_version(
        &self,
        ctx: &RequestContext,
        name: &str,
        version: i64,
    ) -> Result<ModelVersion, StoreError> {
        self.read(ctx, "get_model_version", |conn| {
            load_model_version(conn, name, version)
        })
    }

    /// Newest non-deleted version per stage; an empty `stages` slice means every stage.
    pub fn get_latest_versions(
        &self,
        ctx: &RequestContext,
        name: &str,
        stages: &[ModelVersionStage],
    ) -> Result<Vec<ModelVersion>, StoreError> {
        self.read(ctx, "get_latest_versions", |conn| {
            require_registered_model(conn, name)?;
            let mut versions = latest_versions_per_stage(conn, name)?;
            if !stages.is_empty() {
                versions.retain(|model_version| stages.contains(&model_version.current_stage));
            }
            Ok(versions)
        })
    }

    /// Replaces the description (`None` clears it) and returns the refreshed version.
    pub fn update_model_version(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        version: i64,
        description: Option<&str>,
    ) -> Result<ModelVersion, StoreError> {
        self.transaction(ctx, "update_model_version", |tx| {
            require_model_version(tx, name, version)?;
            tx.execute(
                "
                UPDATE model_versions
                SET description = ?1, last_updated_time = ?2
                WHERE name = ?3 AND version = ?4
                ",
                params![description, now_millis(), name, version],
            )?;
            load_model_version(tx, name, version)
        })
        .map_err(StoreError::wrap("error updating model version"))
    }

    /// Moves a version to `stage`, optionally archiving the versions already there.
    ///
    /// Archiving is only allowed when entering Staging or Production. The version update,
    /// the archive sweep and the parent's timestamp bump commit together or not at all.
    pub fn transition_model_version_stage(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        version: i64,
        stage: ModelVersionStage,
        archive_existing: bool,
    ) -> Result<ModelVersion, StoreError> {
        if stage.is_deleted() {
            return Err(ContractError::InvalidStage {
                input: stage.to_string(),
                valid: ModelVersionStage::valid_stages(),
            }
            .into());
        }
        if archive_existing && !stage.is_active() {
            return Err(ContractError::ArchiveRequiresActiveStage {
                stage: stage.to_string(),
                valid: "Staging, Production".to_string(),
            }
            .into());
        }

        let (transitioned, archived) = self
            .transaction(ctx, "transition_model_version_stage", |tx| {
                require_model_version(tx, name, version)?;
                require_registered_model(tx, name)?;
                let now = now_millis();

                touch_registered_model(tx, name, now)?;
                tx.execute(
                    "
                    UPDATE model_versions
                    SET current_stage = ?1, last_updated_time = ?2
                    WHERE name = ?3 AND version = ?4
                    ",
                    params![stage.as_str(), now, name, version],
                )?;

                let mut archived = 0;
                if archive_existing {
                    ctx.check("transition_model_version_stage")?;
                    archived = tx.execute(
                        "
                        UPDATE model_versions
                        SET current_stage = ?1, last_updated_time = ?2
                        WHERE name = ?3 AND version <> ?4 AND current_stage = ?5
                        ",
                        params![
                            ModelVersionStage::Archived.as_str(),
                            now,
                            name,
                            version,
                            stage.as_str()
                        ],
                    )?;
                }
                Ok((load_model_version(tx, name, version)?, archived))
            })
            .map_err(StoreError::wrap("error transitioning model version stage"))?;

        debug!(
            event = "stage_transitioned",
            name = name,
            version,
            stage = %stage,
            archived
        );
        Ok(transitioned)
    }

    /// Soft-deletes a version: aliases bound to it are removed and the row is kept with its
    /// run id, run link and source redacted. The version number stays taken.
    pub fn delete_model_version(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        version: i64,
    ) -> Result<(), StoreError> {
        self.transaction(ctx, "delete_model_version", |tx| {
            require_registered_model(tx, name)?;
            require_model_version(tx, name, version)?;
            let now = now_millis();

            touch_registered_model(tx, name, now)?;
            tx.execute(
                "DELETE FROM registered_model_aliases WHERE name = ?1 AND version = ?2",
                params![name, version],
            )?;
            ctx.check("delete_model_version")?;
            tx.execute(
                "
                UPDATE model_versions
                SET current_stage = ?1,
                    run_id = ?2,
                    run_link = ?3,
                    source = ?4,
                    user_id = NULL,
                    description = NULL,
                    status_message = NULL,
                    last_updated_time = ?5
                WHERE name = ?6 AND version = ?7
                ",
                params![
                    ModelVersionStage::DeletedInternal.as_str(),
                    REDACTED_RUN_ID,
                    REDACTED_RUN_LINK,
                    REDACTED_SOURCE,
                    now,
                    name,
                    version
                ],
            )?;
            Ok(())
        })
        .map_err(StoreError::wrap("error deleting model version"))?;

        debug!(event = "model_version_deleted", name = name, version);
        Ok(())
    }

    pub fn set_model_version_tag(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        version: i64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        validate_tag_key(key)?;
        self.transaction(ctx, "set_model_version_tag", |tx| {
            require_model_version(tx, name, version)?;
            upsert_version_tag(tx, name, version, key, value)
        })
    }

    /// Deleting a tag that is not set is a no-op.
    pub fn delete_model_version_tag(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        version: i64,
        key: &str,
    ) -> Result<(), StoreError> {
        validate_tag_key(key)?;
        self.transaction(ctx, "delete_model_version_tag", |tx| {
            require_model_version(tx, name, version)?;
            tx.execute(
                "DELETE FROM model_version_tags WHERE name = ?1 AND version = ?2 AND key = ?3",
                params![name, version, key],
            )?;
            Ok(())
        })
    }

    pub fn get_model_version_by_alias(
        &self,
        ctx: &RequestContext,
        name: &str,
        alias: &str,
    ) -> Result<ModelVersion, StoreError> {
        validate_alias(alias)?;
        self.read(ctx, "get_model_version_by_alias", |conn| {
            require_registered_model(conn, name)?;
            let version: Option<i64> = conn
                .query_row(
                    "SELECT version FROM registered_model_aliases WHERE name = ?1 AND alias = ?2",
                    params![name, alias],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(version) = version else {
                return Err(StoreError::ResourceDoesNotExist(format!(
                    "Registered model alias {alias} not found."
                )));
            };
            load_model_version(conn, name, version)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn ctx() -> RequestContext {
        RequestContext::background()
    }

    fn store_with_versions(count: usize) -> MetaStore {
        let mut store = MetaStore::open_in_memory().expect("open db");
        store
            .create_registered_model(&ctx(), "m", None, &[])
            .expect("create model");
        for index in 0..count {
            store
                .create_model_version(
                    &ctx(),
                    "m",
                    NewModelVersion::new(format!("s3://bucket/m/{}", index + 1)).with_run("run-1"),
                )
                .expect("create version");
        }
        store
    }

    #[test]
    fn versions_are_numbered_sequentially() {
        let store = store_with_versions(2);
        let second = store.get_model_version(&ctx(), "m", 2).expect("get v2");
        assert_eq!(second.version, 2);
        assert_eq!(second.current_stage, ModelVersionStage::None);
        assert_eq!(second.status, ModelVersionStatus::Ready);
        assert_eq!(second.run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn deleted_version_numbers_are_not_reused() {
        let mut store = store_with_versions(2);
        store
            .delete_model_version(&ctx(), "m", 2)
            .expect("delete v2");
        let next = store
            .create_model_version(&ctx(), "m", NewModelVersion::new("src"))
            .expect("create v3");
        assert_eq!(next.version, 3);
    }

    #[test]
    fn archive_sweeps_the_target_stage() {
        let mut store = store_with_versions(3);
        store
            .transition_model_version_stage(&ctx(), "m", 1, ModelVersionStage::Production, false)
            .expect("v1 to production");
        store
            .transition_model_version_stage(&ctx(), "m", 3, ModelVersionStage::Staging, false)
            .expect("v3 to staging");
        let before = store.get_registered_model(&ctx(), "m").expect("model");

        let promoted = store
            .transition_model_version_stage(&ctx(), "m", 2, ModelVersionStage::Production, true)
            .expect("v2 to production");
        assert_eq!(promoted.current_stage, ModelVersionStage::Production);

        let v1 = store.get_model_version(&ctx(), "m", 1).expect("v1");
        let v3 = store.get_model_version(&ctx(), "m", 3).expect("v3");
        assert_eq!(v1.current_stage, ModelVersionStage::Archived);
        assert_eq!(v3.current_stage, ModelVersionStage::Staging);

        let after = store.get_registered_model(&ctx(), "m").expect("model");
        assert!(after.last_updated_time > before.last_updated_time);
    }

    #[test]
    fn archive_into_inactive_stage_is_invalid() {
        let mut store = store_with_versions(1);
        let err = store
            .transition_model_version_stage(&ctx(), "m", 1, ModelVersionStage::Archived, true)
            .expect_err("archive into archived");
        assert_eq!(err.code(), ErrorCode::InvalidParameterValue);

        let err = store
            .transition_model_version_stage(
                &ctx(),
                "m",
                1,
                ModelVersionStage::DeletedInternal,
                false,
            )
            .expect_err("deleted stage is internal");
        assert_eq!(err.code(), ErrorCode::InvalidParameterValue);

        let err = store
            .transition_model_version_stage(&ctx(), "m", 7, ModelVersionStage::Staging, false)
            .expect_err("missing version");
        assert_eq!(err.code(), ErrorCode::ResourceDoesNotExist);
    }

    #[test]
    fn latest_versions_filter_by_stage() {
        let mut store = store_with_versions(3);
        store
            .transition_model_version_stage(&ctx(), "m", 1, ModelVersionStage::Staging, false)
            .expect("v1 to staging");
        store
            .transition_model_version_stage(&ctx(), "m", 2, ModelVersionStage::Staging, false)
            .expect("v2 to staging");

        let all = store
            .get_latest_versions(&ctx(), "m", &[])
            .expect("latest versions");
        let summary = all
            .iter()
            .map(|version| (version.version, version.current_stage))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![(2, ModelVersionStage::Staging), (3, ModelVersionStage::None)]
        );

        let staging = store
            .get_latest_versions(&ctx(), "m", &[ModelVersionStage::Staging])
            .expect("staging versions");
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].version, 2);

        let err = store
            .get_latest_versions(&ctx(), "missing", &[])
            .expect_err("missing model");
        assert_eq!(err.code(), ErrorCode::ResourceDoesNotExist);
    }

    #[test]
    fn update_and_tags() {
        let mut store = store_with_versions(1);
        let updated = store
            .update_model_version(&ctx(), "m", 1, Some("calibrated"))
            .expect("update");
        assert_eq!(updated.description.as_deref(), Some("calibrated"));

        store
            .set_model_version_tag(&ctx(), "m", 1, "validated", "yes")
            .expect("set tag");
        assert_eq!(
            store.get_model_version(&ctx(), "m", 1).expect("v1").tags,
            vec![ModelVersionTag::new("validated", "yes")]
        );
        store
            .delete_model_version_tag(&ctx(), "m", 1, "validated")
            .expect("delete tag");
        store
            .delete_model_version_tag(&ctx(), "m", 1, "validated")
            .expect("delete missing tag");
        assert!(store
            .get_model_version(&ctx(), "m", 1)
            .expect("v1")
            .tags
            .is_empty());
    }

    #[test]
    fn unknown_alias_does_not_exist() {
        let store = store_with_versions(1);
        let err = store
            .get_model_version_by_alias(&ctx(), "m", "champion")
            .expect_err("unknown alias");
        assert_eq!(err.code(), ErrorCode::ResourceDoesNotExist);
    }
}
