//! Record formatter: merged work items to `(text, reference)` pairs.
//!
//! Requirements and safety decisions contribute their normalized
//! description. Hazards and failure modes are rendered from their custom
//! fields into a fixed sentence template, then normalized. Every record
//! carries its own external id and a deep link into the Polarion UI.

use tracing::warn;

use crate::models::{FormattedRecord, Reference, WorkItem, WorkItemType};
use crate::normalize::normalize;

/// Placeholder for a risk-analysis field that is empty on the record.
const UNSPECIFIED: &str = "unspecified";

/// Deep link to a work item in the Polarion web UI.
pub fn work_item_url(base_url: &str, project_id: &str, id: &str) -> String {
    format!(
        "{}/#/project/{}/workitem?id={}",
        base_url.trim_end_matches('/'),
        project_id,
        id
    )
}

/// Format merged records, skipping (with a warning) any record without an
/// external id or without content.
pub fn format_records(records: &[WorkItem], base_url: &str) -> Vec<FormattedRecord> {
    records
        .iter()
        .filter_map(|record| {
            let formatted = format_record(record, base_url);
            if formatted.is_none() {
                warn!(item = %record.id, project = %record.project_id, "skipping record without external id or content");
            }
            formatted
        })
        .collect()
}

/// Format one record. `None` if it has no external id or nothing to say.
pub fn format_record(record: &WorkItem, base_url: &str) -> Option<FormattedRecord> {
    let external_id = record
        .fields
        .external_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())?;

    let raw = match record.item_type? {
        WorkItemType::Requirement | WorkItemType::SafetyDecision => record.description.clone()?,
        WorkItemType::Hazard => format!(
            "[Risk analysis] Hazardous situation: {}. Initiating event: {}. Harm: {}",
            field(&record.fields.hazardous_situation),
            field(&record.fields.initiating_event),
            field(&record.fields.harm),
        ),
        WorkItemType::FailureMode => format!(
            "[Risk analysis] Failure mode: {}. Cause: {}. Effects: {}",
            field(&record.fields.failure_mode),
            field(&record.fields.cause),
            field(&record.fields.effects),
        ),
    };

    let text = normalize(&raw);
    if text.is_empty() {
        return None;
    }

    Some(FormattedRecord {
        text,
        reference: Reference {
            external_id: external_id.to_string(),
            url: work_item_url(base_url, &record.project_id, &record.id),
        },
    })
}

fn field(value: &Option<String>) -> &str {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNSPECIFIED)
}
