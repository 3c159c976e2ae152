//! Executing individual job steps against a bridge.

use serde_json::{Value, json};

use super::job::{JobDefinition, Step};
use crate::bridge::{Bridge, ModelInfo};
use crate::error::StepError;

/// Text sent to make the agent reload its runtime.
pub const RELOAD_MESSAGE: &str = "/reload-runtime";

/// Run one step. Returns the agent's reply for `prompt` steps.
pub async fn execute_step(
    bridge: &Bridge,
    job: &JobDefinition,
    step: &Step,
) -> Result<Option<String>, StepError> {
    match step {
        Step::NewSession => {
            bridge.command("new_session", Value::Null).await?;
        }
        Step::Compact => {
            bridge.command("compact", Value::Null).await?;
        }
        Step::Reload => {
            // A full turn so the next step cannot overlap it; the reply is dropped
            bridge.send_message(RELOAD_MESSAGE).await?;
        }
        Step::Model(query) => {
            let available = bridge.command("get_available_models", Value::Null).await?;
            let models = parse_models(&available)?;
            let model = match_model(&models, query).ok_or_else(|| StepError::NoModelMatch {
                query: query.clone(),
            })?;
            tracing::info!(job = %job.name, model = %model.qualified(), "Switching model");
            bridge
                .command(
                    "set_model",
                    json!({ "provider": model.provider, "modelId": model.id }),
                )
                .await?;
        }
        Step::Prompt => {
            let reply = bridge.send_message(&job.prompt_text()).await?;
            return Ok(Some(reply));
        }
    }
    Ok(None)
}

/// Accepts either a bare array or `{"models": [...]}`.
pub fn parse_models(data: &Value) -> Result<Vec<ModelInfo>, StepError> {
    let list = match data {
        Value::Array(_) => data,
        Value::Object(map) => map
            .get("models")
            .ok_or_else(|| StepError::InvalidModelList("missing 'models' field".to_string()))?,
        _ => return Err(StepError::InvalidModelList(data.to_string())),
    };
    serde_json::from_value(list.clone()).map_err(|e| StepError::InvalidModelList(e.to_string()))
}

/// Case-insensitive match of `query` against id, name or `provider/id`.
/// Exact matches win over substring matches; ties go to list order.
pub fn match_model<'a>(models: &'a [ModelInfo], query: &str) -> Option<&'a ModelInfo> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return None;
    }

    models
        .iter()
        .find(|m| match_keys(m).iter().any(|k| *k == query))
        .or_else(|| {
            models
                .iter()
                .find(|m| match_keys(m).iter().any(|k| k.contains(&query)))
        })
}

fn match_keys(model: &ModelInfo) -> Vec<String> {
    let mut keys = vec![model.id.to_lowercase(), model.qualified().to_lowercase()];
    if let Some(name) = &model.name {
        keys.push(name.to_lowercase());
    }
    keys
}
