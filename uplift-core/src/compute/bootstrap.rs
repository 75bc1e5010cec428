use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, Result},
    types::{ObjectLocator, RecordId},
};

/// Everything a worker needs to find its input, handed over as user data.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapPayload {
    pub record_id: RecordId,
    pub object: ObjectLocator,
    pub table_name: String,
    pub script: ObjectLocator,
}

impl BootstrapPayload {
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(user_data: &str) -> Result<Self> {
        let raw = STANDARD.decode(user_data).map_err(|err| {
            PipelineError::Invalid(format!("user data is not base64: {err}"))
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
