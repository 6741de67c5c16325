/// Project type definitions
///
/// A project groups the flows of one tenant. The coordinator only needs enough
/// of it to validate routed requests and to build remote routing keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Unique project identifier (UUID string)
    pub id: String,
    /// Owning tenant identifier (UUID string)
    pub tenant_id: String,
    /// Human-readable project name
    pub name: String,
    /// Free-form project settings
    #[serde(default)]
    pub settings: Value,
}

impl Project {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            settings: Value::Object(Default::default()),
        }
    }

    /// Routing key prefix used by the remote executor: `{tenant}/{project}`
    pub fn artifact_prefix(&self) -> String {
        format!("{}/{}", self.tenant_id, self.id)
    }
}
