//! Core domain model for site records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "sdr-core";

/// The presence rule shared by every field this tool inspects: a value
/// counts only when it is present and non-empty, so a missing key and an
/// empty string are treated identically everywhere.
pub fn text_value(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

pub fn has_text(value: Option<&str>) -> bool {
    text_value(value).is_some()
}

/// A site document as stored and as embedded in dump lines.
///
/// Only the fields this tool reasons about are modeled; everything else a
/// stored document carries rides along in the flattened `extra` map and is
/// written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SiteRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identification: Option<Identification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Description>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Identification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Description {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SiteRecord {
    /// Human-readable label for narration: the identification name when it
    /// carries text, the id otherwise.
    pub fn label(&self) -> &str {
        text_value(
            self.identification
                .as_ref()
                .and_then(|ident| ident.name.as_deref()),
        )
        .unwrap_or(&self.id)
    }

    pub fn present_address(&self) -> Option<&str> {
        text_value(self.description.as_ref().and_then(|d| d.address.as_deref()))
    }

    pub fn present_note(&self) -> Option<&str> {
        text_value(self.description.as_ref().and_then(|d| d.note.as_deref()))
    }
}
