//! Vendor-private tag definitions registered per ingest.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateTag {
    pub tag_id: i64,
    pub ingest_id: i64,
    pub private_creator: String,
    pub tag: String,
    pub vr: String,
    pub description: String,
    pub vm: String,
}

/// Row of a private tag dictionary CSV
/// (`PrivateCreator,Tag,VR,Description,VM`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPrivateTag {
    #[serde(rename = "PrivateCreator")]
    pub private_creator: String,
    #[serde(rename = "Tag")]
    pub tag: String,
    #[serde(rename = "VR")]
    pub vr: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "VM")]
    pub vm: String,
}
