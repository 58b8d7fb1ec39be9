use mlmeta_core::{
    Experiment, LifecycleStage, ModelVersion, ModelVersionStage, ModelVersionStatus,
    RegisteredModel, RunInfo,
};
use rusqlite::types::Type;
use rusqlite::Row;

pub(crate) const MODEL_VERSION_COLUMNS: &str = "name, version, creation_time, last_updated_time, \
     description, user_id, current_stage, source, run_id, run_link, status, status_message";

pub(crate) const RUN_COLUMNS: &str = "run_uuid, experiment_id, name, user_id, status, start_time, \
     end_time, artifact_uri, lifecycle_stage, deleted_time";

fn decode<T>(index: usize, value: &str, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Text,
            format!("unexpected stored value '{value}'").into(),
        )
    })
}

pub(crate) fn lifecycle_stage_at(row: &Row<'_>, index: usize) -> rusqlite::Result<LifecycleStage> {
    let value: String = row.get(index)?;
    decode(index, &value, LifecycleStage::from_stored)
}

/// Decodes a row selected with [`MODEL_VERSION_COLUMNS`]. Tags and aliases are attached later.
pub(crate) fn model_version_from_row(row: &Row<'_>) -> rusqlite::Result<ModelVersion> {
    let stage: String = row.get(6)?;
    let status: String = row.get(10)?;
    Ok(ModelVersion {
        name: row.get(0)?,
        version: row.get(1)?,
        creation_time: row.get(2)?,
        last_updated_time: row.get(3)?,
        description: row.get(4)?,
        user_id: row.get(5)?,
        current_stage: decode(6, &stage, ModelVersionStage::from_stored)?,
        source: row.get(7)?,
        run_id: row.get(8)?,
        run_link: row.get(9)?,
        status: decode(10, &status, ModelVersionStatus::from_stored)?,
        status_message: row.get(11)?,
        tags: Vec::new(),
        aliases: Vec::new(),
    })
}

/// Decodes `name, creation_time, last_updated_time, description`.
pub(crate) fn registered_model_from_row(row: &Row<'_>) -> rusqlite::Result<RegisteredModel> {
    Ok(RegisteredModel {
        name: row.get(0)?,
        creation_time: row.get(1)?,
        last_updated_time: row.get(2)?,
        description: row.get(3)?,
        tags: Vec::new(),
        aliases: Vec::new(),
        latest_versions: Vec::new(),
    })
}

pub(crate) fn run_info_from_row(row: &Row<'_>) -> rusqlite::Result<RunInfo> {
    Ok(RunInfo {
        run_id: row.get(0)?,
        experiment_id: row.get(1)?,
        run_name: row.get(2)?,
        user_id: row.get(3)?,
        status: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        artifact_uri: row.get(7)?,
        lifecycle_stage: lifecycle_stage_at(row, 8)?,
        deleted_time: row.get(9)?,
    })
}

/// Decodes `experiment_id, name, artifact_location, lifecycle_stage, creation_time, last_update_time`.
pub(crate) fn experiment_from_row(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    Ok(Experiment {
        experiment_id: row.get(0)?,
        name: row.get(1)?,
        artifact_location: row.get(2)?,
        lifecycle_stage: lifecycle_stage_at(row, 3)?,
        creation_time: row.get(4)?,
        last_update_time: row.get(5)?,
        tags: Vec::new(),
    })
}

/// Reads a stored metric value back, turning the NaN marker into NaN.
pub(crate) fn stored_value(value: f64, is_nan: bool) -> f64 {
    if is_nan {
        f64::NAN
    } else {
        value
    }
}
