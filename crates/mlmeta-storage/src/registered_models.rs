use crate::error::{is_unique_violation, model_already_exists, registered_model_not_found};
use crate::model_versions::{latest_versions_per_stage, require_model_version};
use crate::rows::registered_model_from_row;
use crate::{MetaStore, RequestContext, StoreError};
use mlmeta_core::{
    is_prompt_tagged, now_millis, validate_alias, validate_model_name, ContractError,
    RegisteredModel, RegisteredModelAlias, RegisteredModelTag,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use tracing::{debug, warn};

fn fetch_registered_model(
    conn: &Connection,
    name: &str,
) -> Result<Option<RegisteredModel>, StoreError> {
    Ok(conn
        .query_row(
            "
            SELECT name, creation_time, last_updated_time, description
            FROM registered_models
            WHERE name = ?1
            ",
            [name],
            registered_model_from_row,
        )
        .optional()?)
}

/// Model row without tags, aliases or versions.
pub(crate) fn require_registered_model(
    conn: &Connection,
    name: &str,
) -> Result<RegisteredModel, StoreError> {
    fetch_registered_model(conn, name)?.ok_or_else(|| registered_model_not_found(name))
}

/// Bumps the model's last-updated time, strictly past its previous value.
pub(crate) fn touch_registered_model(
    conn: &Connection,
    name: &str,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "
        UPDATE registered_models
        SET last_updated_time = MAX(?1, last_updated_time + 1)
        WHERE name = ?2
        ",
        params![now, name],
    )?;
    Ok(())
}

fn load_model_tags(conn: &Connection, name: &str) -> Result<Vec<RegisteredModelTag>, StoreError> {
    let mut statement =
        conn.prepare("SELECT key, value FROM registered_model_tags WHERE name = ?1 ORDER BY key")?;
    let rows = statement.query_map([name], |row| {
        Ok(RegisteredModelTag {
            key: row.get(0)?,
            value: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        })
    })?;

    let mut tags = Vec::new();
    for row in rows {
        tags.push(row?);
    }
    Ok(tags)
}

fn load_model_aliases(
    conn: &Connection,
    name: &str,
) -> Result<Vec<RegisteredModelAlias>, StoreError> {
    let mut statement = conn.prepare(
        "SELECT alias, version FROM registered_model_aliases WHERE name = ?1 ORDER BY alias",
    )?;
    let rows = statement.query_map([name], |row| {
        Ok(RegisteredModelAlias {
            alias: row.get(0)?,
            version: row.get(1)?,
        })
    })?;

    let mut aliases = Vec::new();
    for row in rows {
        aliases.push(row?);
    }
    Ok(aliases)
}

/// Full view of a model: tags, aliases and the newest version per stage.
fn load_registered_model(conn: &Connection, name: &str) -> Result<RegisteredModel, StoreError> {
    let mut model = require_registered_model(conn, name)?;
    model.tags = load_model_tags(conn, name)?;
    model.aliases = load_model_aliases(conn, name)?;
    model.latest_versions = latest_versions_per_stage(conn, name)?;
    Ok(model)
}

fn upsert_model_tag(
    conn: &Connection,
    name: &str,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "
        INSERT INTO registered_model_tags (key, value, name) VALUES (?1, ?2, ?3)
        ON CONFLICT(key, name) DO UPDATE SET value=excluded.value
        ",
        params![key, value, name],
    )?;
    Ok(())
}

fn validate_tag_key(key: &str) -> Result<(), StoreError> {
    if key.trim().is_empty() {
        return Err(ContractError::MissingField { field: "key" }.into());
    }
    Ok(())
}

/// Keeps the first occurrence of each tag key.
fn first_tag_per_key(tags: &[RegisteredModelTag]) -> Vec<RegisteredModelTag> {
    let mut seen = HashSet::with_capacity(tags.len());
    tags.iter()
        .filter(|tag| seen.insert(tag.key.as_str()))
        .cloned()
        .collect()
}

impl MetaStore {
    pub fn create_registered_model(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        description: Option<&str>,
        tags: &[RegisteredModelTag],
    ) -> Result<RegisteredModel, StoreError> {
        validate_model_name(name)?;
        let tags = first_tag_per_key(tags);
        for tag in &tags {
            validate_tag_key(&tag.key)?;
        }
        let new_is_prompt = is_prompt_tagged(&tags);

        let model = self.transaction(ctx, "create_registered_model", |tx| {
            let now = now_millis();
            if let Err(err) = tx.execute(
                "
                INSERT INTO registered_models (name, creation_time, last_updated_time, description)
                VALUES (?1, ?2, ?2, ?3)
                ",
                params![name, now, description],
            ) {
                if is_unique_violation(&err) {
                    let existing_is_prompt = is_prompt_tagged(&load_model_tags(tx, name)?);
                    return Err(StoreError::ResourceAlreadyExists(model_already_exists(
                        name,
                        existing_is_prompt,
                        new_is_prompt,
                    )));
                }
                return Err(StoreError::internal("error creating registered model", err));
            }

            for tag in &tags {
                upsert_model_tag(tx, name, &tag.key, &tag.value)?;
            }
            load_registered_model(tx, name)
        })?;

        debug!(
            event = "registered_model_created",
            name = name,
            prompt = new_is_prompt
        );
        Ok(model)
    }

    pub fn get_registered_model(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<RegisteredModel, StoreError> {
        self.read(ctx, "get_registered_model", |conn| {
            load_registered_model(conn, name)
        })
    }

    /// Replaces the description (`None` clears it) and returns the refreshed model.
    pub fn update_registered_model(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        description: Option<&str>,
    ) -> Result<RegisteredModel, StoreError> {
        self.transaction(ctx, "update_registered_model", |tx| {
            require_registered_model(tx, name)?;
            tx.execute(
                "UPDATE registered_models SET description = ?1 WHERE name = ?2",
                params![description, name],
            )?;
            touch_registered_model(tx, name, now_millis())?;
            load_registered_model(tx, name)
        })
        .map_err(StoreError::wrap("error updating registered model"))
    }

    /// Renames a model together with every row that carries its name.
    ///
    /// Foreign keys are checked at commit, so the rows can move in any order; a name that is
    /// already taken aborts the whole rename.
    pub fn rename_registered_model(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        new_name: &str,
    ) -> Result<RegisteredModel, StoreError> {
        validate_model_name(new_name)?;

        let model = self
            .transaction(ctx, "rename_registered_model", |tx| {
                require_registered_model(tx, name)?;
                tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
                let now = now_millis();

                tx.execute(
                    "
                    UPDATE registered_models
                    SET name = ?1, last_updated_time = MAX(?2, last_updated_time + 1)
                    WHERE name = ?3
                    ",
                    params![new_name, now, name],
                )
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        warn!(event = "rename_conflict", name = name, new_name = new_name);
                        StoreError::ResourceAlreadyExists(format!(
                            "Registered Model (name={new_name}) already exists."
                        ))
                    } else {
                        StoreError::internal("error renaming registered model", err)
                    }
                })?;

                ctx.check("rename_registered_model")?;
                tx.execute(
                    "UPDATE model_versions SET name = ?1, last_updated_time = ?2 WHERE name = ?3",
                    params![new_name, now, name],
                )?;
                tx.execute(
                    "UPDATE model_version_tags SET name = ?1 WHERE name = ?2",
                    params![new_name, name],
                )?;
                tx.execute(
                    "UPDATE registered_model_tags SET name = ?1 WHERE name = ?2",
                    params![new_name, name],
                )?;
                tx.execute(
                    "UPDATE registered_model_aliases SET name = ?1 WHERE name = ?2",
                    params![new_name, name],
                )?;
                load_registered_model(tx, new_name)
            })
            .map_err(StoreError::wrap("error renaming registered model"))?;

        debug!(event = "registered_model_renamed", name = name, new_name = new_name);
        Ok(model)
    }

    /// Removes a model and everything it owns.
    pub fn delete_registered_model(
        &mut self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<(), StoreError> {
        self.transaction(ctx, "delete_registered_model", |tx| {
            require_registered_model(tx, name)?;
            tx.execute("DELETE FROM model_version_tags WHERE name = ?1", [name])?;
            tx.execute("DELETE FROM model_versions WHERE name = ?1", [name])?;
            ctx.check("delete_registered_model")?;
            tx.execute("DELETE FROM registered_model_tags WHERE name = ?1", [name])?;
            tx.execute("DELETE FROM registered_model_aliases WHERE name = ?1", [name])?;
            tx.execute("DELETE FROM registered_models WHERE name = ?1", [name])?;
            Ok(())
        })
        .map_err(StoreError::wrap("error deleting registered model"))?;

        debug!(event = "registered_model_deleted", name = name);
        Ok(())
    }

    pub fn set_registered_model_tag(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        validate_tag_key(key)?;
        self.transaction(ctx, "set_registered_model_tag", |tx| {
            require_registered_model(tx, name)?;
            upsert_model_tag(tx, name, key, value)
        })
    }

    /// Deleting a tag that is not set is a no-op.
    pub fn delete_registered_model_tag(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        key: &str,
    ) -> Result<(), StoreError> {
        validate_tag_key(key)?;
        self.transaction(ctx, "delete_registered_model_tag", |tx| {
            require_registered_model(tx, name)?;
            tx.execute(
                "DELETE FROM registered_model_tags WHERE name = ?1 AND key = ?2",
                params![name, key],
            )?;
            Ok(())
        })
    }

    /// Points `alias` at `version`, moving it if it was bound elsewhere.
    pub fn set_registered_model_alias(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        alias: &str,
        version: i64,
    ) -> Result<(), StoreError> {
        validate_alias(alias)?;
        self.transaction(ctx, "set_registered_model_alias", |tx| {
            require_registered_model(tx, name)?;
            require_model_version(tx, name, version)?;
            tx.execute(
                "
                INSERT INTO registered_model_aliases (alias, version, name) VALUES (?1, ?2, ?3)
                ON CONFLICT(name, alias) DO UPDATE SET version=excluded.version
                ",
                params![alias, version, name],
            )?;
            Ok(())
        })?;

        debug!(event = "alias_set", name = name, alias = alias, version);
        Ok(())
    }

    pub fn delete_registered_model_alias(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        alias: &str,
    ) -> Result<(), StoreError> {
        validate_alias(alias)?;
        self.transaction(ctx, "delete_registered_model_alias", |tx| {
            require_registered_model(tx, name)?;
            tx.execute(
                "DELETE FROM registered_model_aliases WHERE name = ?1 AND alias = ?2",
                params![name, alias],
            )?;
            Ok(())
        })
    }
}
