//! Decoded form of a resource payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{ResourceError, ResourceKey, ResourceResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// spec, status and anything else the payload carries.
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl Resource {
    pub fn decode(value: &[u8]) -> ResourceResult<Self> {
        serde_json::from_slice(value).map_err(|e| ResourceError::Validation(format!("decoding resource: {}", e)))
    }

    /// First `/`-separated segment of `apiVersion`. A bare version such as `v1`
    /// is returned as-is.
    pub fn group(&self) -> &str {
        self.api_version.split('/').next().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("")
    }

    pub fn labels(&self) -> SmallVec<[(String, String); 8]> {
        self.metadata.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn annotations(&self) -> SmallVec<[(String, String); 4]> {
        self.metadata.annotations.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Ensure the payload's metadata agrees with the key it is written under.
    pub fn check_identity(&self, key: &ResourceKey) -> ResourceResult<()> {
        if self.group() != key.group {
            return Err(ResourceError::Validation(format!(
                "apiVersion group {:?} does not match key group {:?}",
                self.group(),
                key.group
            )));
        }
        if self.metadata.name != key.name {
            return Err(ResourceError::Validation(format!(
                "metadata.name {:?} does not match key name {:?}",
                self.metadata.name, key.name
            )));
        }
        if self.namespace() != key.namespace {
            return Err(ResourceError::Validation(format!(
                "metadata.namespace {:?} does not match key namespace {:?}",
                self.namespace(),
                key.namespace
            )));
        }
        Ok(())
    }
}
