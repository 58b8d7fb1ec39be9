use crate::lifecycle::{LifecycleStage, ModelVersionStage, ModelVersionStatus, PROMPT_TAG_KEY};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentTag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: i64,
    pub name: String,
    pub artifact_location: String,
    pub lifecycle_stage: LifecycleStage,
    pub creation_time: i64,
    pub last_update_time: i64,
    #[serde(default)]
    pub tags: Vec<ExperimentTag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: i64,
    pub run_name: String,
    pub user_id: Option<String>,
    pub status: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub artifact_uri: String,
    pub lifecycle_stage: LifecycleStage,
    pub deleted_time: Option<i64>,
}

/// One metric observation as logged by a client.
///
/// The optional model and dataset fields associate the observation with a logged model; only
/// observations carrying a `model_id` are fanned out to the model-centric projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub step: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_digest: Option<String>,
}

impl Metric {
    pub fn new(key: impl Into<String>, value: f64, timestamp: i64, step: i64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
            step,
            model_id: None,
            dataset_name: None,
            dataset_digest: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_dataset(mut self, name: impl Into<String>, digest: impl Into<String>) -> Self {
        self.dataset_name = Some(name.into());
        self.dataset_digest = Some(digest.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedModelMetric {
    pub model_id: String,
    pub metric_name: String,
    pub metric_timestamp_ms: i64,
    pub metric_step: i64,
    pub metric_value: f64,
    pub experiment_id: i64,
    pub run_id: String,
    pub dataset_name: Option<String>,
    pub dataset_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModelTag {
    pub key: String,
    pub value: String,
}

impl RegisteredModelTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModelAlias {
    pub alias: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersionTag {
    pub key: String,
    pub value: String,
}

impl ModelVersionTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: i64,
    pub creation_time: i64,
    pub last_updated_time: i64,
    pub description: Option<String>,
    pub user_id: Option<String>,
    pub current_stage: ModelVersionStage,
    pub source: String,
    pub run_id: Option<String>,
    pub run_link: Option<String>,
    pub status: ModelVersionStatus,
    pub status_message: Option<String>,
    #[serde(default)]
    pub tags: Vec<ModelVersionTag>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub creation_time: i64,
    pub last_updated_time: i64,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<RegisteredModelTag>,
    #[serde(default)]
    pub aliases: Vec<RegisteredModelAlias>,
    /// Highest non-deleted version per stage.
    #[serde(default)]
    pub latest_versions: Vec<ModelVersion>,
}

impl RegisteredModel {
    pub fn is_prompt(&self) -> bool {
        is_prompt_tagged(&self.tags)
    }
}

pub fn is_prompt_tagged(tags: &[RegisteredModelTag]) -> bool {
    tags.iter()
        .any(|tag| tag.key == PROMPT_TAG_KEY && tag.value.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_json_omits_missing_associations() {
        let metric = Metric::new("loss", 0.25, 1_000, 3);
        let json = serde_json::to_value(&metric).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"key": "loss", "value": 0.25, "timestamp": 1000, "step": 3})
        );

        let decoded: Metric =
            serde_json::from_str(r#"{"key":"acc","value":1.0,"timestamp":5}"#).expect("decode");
        assert_eq!(decoded.step, 0);
        assert!(decoded.model_id.is_none());
    }

    #[test]
    fn stage_serializes_with_stored_spelling() {
        let json = serde_json::to_string(&ModelVersionStage::DeletedInternal).expect("serialize");
        assert_eq!(json, "\"Deleted_Internal\"");
    }

    #[test]
    fn prompt_detection_uses_reserved_tag() {
        assert!(is_prompt_tagged(&[RegisteredModelTag::new(PROMPT_TAG_KEY, "true")]));
        assert!(!is_prompt_tagged(&[RegisteredModelTag::new(PROMPT_TAG_KEY, "false")]));
        assert!(!is_prompt_tagged(&[RegisteredModelTag::new("team", "vision")]));
    }
}
