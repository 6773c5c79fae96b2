//! Core data types.
//!
//! Work items flow through the pipeline as:
//!
//! ```text
//! WorkItem ─▶ (merge) ─▶ WorkItem ─▶ (format) ─▶ FormattedRecord ─▶ (chunk) ─▶ EmbeddableChunk
//! ```
//!
//! A merged record is still a [`WorkItem`]: continuation text is appended to
//! its description, or it is a hazard/failure-mode child that inherited
//! attributes from its parent. Its `external_id` is always its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Catalog label used when an index covers every release.
pub const ALL_RELEASES: &str = "All releases";

/// Work-item types the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemType {
    Requirement,
    SafetyDecision,
    Hazard,
    FailureMode,
}

impl WorkItemType {
    /// Type id as Polarion spells it.
    pub fn as_source_id(&self) -> &'static str {
        match self {
            WorkItemType::Requirement => "requirement",
            WorkItemType::SafetyDecision => "safetydecision",
            WorkItemType::Hazard => "hazard",
            WorkItemType::FailureMode => "failuremode",
        }
    }

    pub fn from_source_id(id: &str) -> Option<Self> {
        match id {
            "requirement" => Some(WorkItemType::Requirement),
            "safetydecision" => Some(WorkItemType::SafetyDecision),
            "hazard" => Some(WorkItemType::Hazard),
            "failuremode" => Some(WorkItemType::FailureMode),
            _ => None,
        }
    }

    /// Requirements and safety decisions carry their content in the description.
    pub fn is_textual(&self) -> bool {
        matches!(self, WorkItemType::Requirement | WorkItemType::SafetyDecision)
    }
}

impl fmt::Display for WorkItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_source_id())
    }
}

impl FromStr for WorkItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-', ' '], "");
        WorkItemType::from_source_id(&normalized).ok_or_else(|| {
            format!(
                "unknown work-item type '{}'. Expected requirement, safetydecision, hazard, or failuremode",
                s
            )
        })
    }
}

/// Whether a location id names a single project or a project group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    Project,
    Group,
}

impl LocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationType::Project => "project",
            LocationType::Group => "group",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(LocationType::Project),
            "group" => Ok(LocationType::Group),
            other => Err(format!("unknown location type '{}'", other)),
        }
    }
}

/// Custom fields read from a work item, decoded once at the source boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomFields {
    /// Human-facing identifier (`ibaFullPuid`). Continuation fragments carry
    /// the continuation marker here.
    pub external_id: Option<String>,
    pub hazardous_situation: Option<String>,
    pub initiating_event: Option<String>,
    pub harm: Option<String>,
    pub failure_mode: Option<String>,
    pub cause: Option<String>,
    pub effects: Option<String>,
}

/// An outgoing or derived link to another work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub role: String,
    pub target_project: String,
    pub target_id: String,
}

impl Link {
    pub fn new(role: &str, target_project: &str, target_id: &str) -> Self {
        Self {
            role: role.to_string(),
            target_project: target_project.to_string(),
            target_id: target_id.to_string(),
        }
    }
}

/// A work item as returned by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Short id, unique within the source (e.g. `"TSS-1042"`).
    pub id: String,
    pub project_id: String,
    pub title: Option<String>,
    /// `None` for types the pipeline does not process.
    pub item_type: Option<WorkItemType>,
    /// Raw HTML.
    pub description: Option<String>,
    pub fields: CustomFields,
    /// In source order.
    pub links: Vec<Link>,
}

impl WorkItem {
    /// True when the external id carries the continuation marker.
    pub fn is_continuation(&self, marker: &str) -> bool {
        self.fields
            .external_id
            .as_deref()
            .is_some_and(|id| id.contains(marker))
    }

    pub fn has_description(&self) -> bool {
        self.description
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
    }
}

/// Identifier and deep link carried by every record and chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub external_id: String,
    pub url: String,
}

/// Normalized text plus its reference, ready for chunking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedRecord {
    pub text: String,
    pub reference: Reference,
}

/// A window of a record's text. At most `chunk_size` characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddableChunk {
    pub text: String,
    pub reference: Reference,
}

/// The set of work-item types an index covers, kept sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeSet(BTreeSet<WorkItemType>);

impl TypeSet {
    pub fn new(types: impl IntoIterator<Item = WorkItemType>) -> Self {
        Self(types.into_iter().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItemType> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Space-separated source ids, the form used in queries and storage.
    pub fn to_key(&self) -> String {
        self.0
            .iter()
            .map(|t| t.as_source_id())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn from_key(key: &str) -> Result<Self, String> {
        key.split_whitespace()
            .map(WorkItemType::from_str)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

/// Identifies one pipeline target: the same key always addresses the same
/// pending cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub location: String,
    pub location_type: LocationType,
    /// `None` means every release.
    pub release: Option<String>,
    pub item_types: TypeSet,
}

impl IndexKey {
    pub fn release_label(&self) -> &str {
        self.release.as_deref().unwrap_or(ALL_RELEASES)
    }

    /// Inverse of [`release_label`](Self::release_label).
    pub fn release_from_label(label: &str) -> Option<String> {
        if label == ALL_RELEASES {
            None
        } else {
            Some(label.to_string())
        }
    }
}

/// One persisted vector index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub db_id: String,
    pub key: IndexKey,
    pub last_update: DateTime<Utc>,
}

/// Formatted records staged for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub db_id: String,
    pub key: IndexKey,
    /// True when the records will be appended to an existing index.
    pub is_update: bool,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    /// SHA-256 over the staged records.
    pub digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_parsing_accepts_common_spellings() {
        assert_eq!(
            "safety_decision".parse::<WorkItemType>().unwrap(),
            WorkItemType::SafetyDecision
        );
        assert_eq!(
            "Failure-Mode".parse::<WorkItemType>().unwrap(),
            WorkItemType::FailureMode
        );
        assert!("defect".parse::<WorkItemType>().is_err());
    }

    #[test]
    fn type_set_key_is_sorted_and_deduplicated() {
        let set = TypeSet::new([
            WorkItemType::Hazard,
            WorkItemType::Requirement,
            WorkItemType::Hazard,
        ]);
        assert_eq!(set.to_key(), "requirement hazard");
        assert_eq!(TypeSet::from_key("hazard requirement").unwrap(), set);
    }

    #[test]
    fn continuation_detection_uses_external_id() {
        let mut item = WorkItem {
            id: "TSS-2".to_string(),
            project_id: "TSS".to_string(),
            title: None,
            item_type: Some(WorkItemType::Requirement),
            description: Some("x".to_string()),
            fields: CustomFields::default(),
            links: vec![],
        };
        assert!(!item.is_continuation("(cont'd)"));
        item.fields.external_id = Some("SYS-REQ-12 (cont'd)".to_string());
        assert!(item.is_continuation("(cont'd)"));
    }

    #[test]
    fn release_label_round_trip() {
        assert_eq!(IndexKey::release_from_label(ALL_RELEASES), None);
        assert_eq!(
            IndexKey::release_from_label("R12.1"),
            Some("R12.1".to_string())
        );
    }
}
