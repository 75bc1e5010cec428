use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::RecordId;

/// Metadata row describing one uploaded file.
///
/// Attributes are kept in a `BTreeMap` so two images with the same content
/// compare equal and digest identically regardless of insertion order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: RecordId,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl UploadRecord {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Short stable digest of the attribute map, used to tell record
    /// revisions apart.
    pub fn attributes_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.attributes {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }
}
