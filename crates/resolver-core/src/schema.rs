//! Schema of a built resolver, as emitted next to the bundled script

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::ConfigError;

/// Declared argument types, keyed by argument name. Values are type names
/// such as `"number"` or `"string[]"`; they are checked by `validate_user_args`.
pub type UserArgsSchema = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverSchema {
    /// Memory limit in megabytes.
    pub memory: u64,
    /// Execution timeout in seconds.
    pub timeout: u64,
    #[serde(default)]
    pub user_args: UserArgsSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_limit: Option<u32>,
}

impl ResolverSchema {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("Invalid resolver schema: {}", e)))
    }
}
