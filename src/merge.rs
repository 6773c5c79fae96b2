//! Hierarchy merger.
//!
//! Long work items are split in Polarion into a head item plus continuation
//! fragments whose external id carries the continuation marker. The merger
//! walks each fetched item's links and rebuilds self-contained records:
//!
//! - **requirement / safety decision**: the description of every
//!   continuation fragment linked with role `parent` is appended,
//!   `", "`-separated, in link order.
//! - **hazard / failure mode**: every continuation child linked with role
//!   `parent` becomes its own record. It takes the parent's situation (or
//!   failure mode) and fills its missing event/harm (or cause/effects) from
//!   the parent. Its external id stays its own.
//!
//! Lookups go through the [`WorkItemSource`]. A linked item the source
//! reports as not retrievable skips the item being merged, with a warning.

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult, SourceError};
use crate::models::{CustomFields, Link, WorkItem, WorkItemType};
use crate::progress::{PipelineEvent, ProgressReporter};
use crate::source::WorkItemSource;

/// Link role connecting a continuation fragment or child to its head.
pub const CHILD_LINK_ROLE: &str = "parent";

#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub continuation_marker: String,
    /// Emit a hazard/failure mode without continuation children as itself.
    pub emit_childless_parents: bool,
}

impl MergePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            continuation_marker: config.source.continuation_marker.clone(),
            emit_childless_parents: config.merge.emit_childless_parents,
        }
    }
}

/// Merge continuation fragments into their heads.
///
/// # Errors
///
/// - [`PipelineError::EmptyResult`] for an empty input list.
/// - [`PipelineError::MergeIntegrity`] for a malformed link or lookup.
/// - [`PipelineError::SourceUnavailable`] if a lookup cannot reach the source.
pub async fn merge(
    source: &dyn WorkItemSource,
    items: Vec<WorkItem>,
    policy: &MergePolicy,
    location: &str,
    progress: &dyn ProgressReporter,
) -> PipelineResult<Vec<WorkItem>> {
    if items.is_empty() {
        return Err(PipelineError::EmptyResult(location.to_string()));
    }

    let total = items.len() as u64;
    let mut merged = Vec::with_capacity(items.len());

    for (n, item) in items.into_iter().enumerate() {
        match item.item_type {
            Some(WorkItemType::Requirement) | Some(WorkItemType::SafetyDecision) => {
                if let Some(record) = merge_textual(source, item, policy).await? {
                    merged.push(record);
                }
            }
            Some(kind @ (WorkItemType::Hazard | WorkItemType::FailureMode)) => {
                merged.extend(merge_risk(source, item, kind, policy).await?);
            }
            None => debug!(item = %item.id, "ignoring unsupported work-item type"),
        }

        progress.report(PipelineEvent::Merging {
            location: location.to_string(),
            n: n as u64 + 1,
            total,
        });
    }

    Ok(merged)
}

async fn merge_textual(
    source: &dyn WorkItemSource,
    mut item: WorkItem,
    policy: &MergePolicy,
) -> PipelineResult<Option<WorkItem>> {
    if item.is_continuation(&policy.continuation_marker) || !item.has_description() {
        return Ok(None);
    }

    let mut appended = Vec::new();
    for link in item.links.iter().filter(|l| l.role == CHILD_LINK_ROLE) {
        let Some(target) = lookup(source, &item, link).await? else {
            return Ok(None);
        };
        let is_fragment = target.item_type.is_some_and(|t| t.is_textual())
            && target.is_continuation(&policy.continuation_marker);
        if !is_fragment {
            continue;
        }
        if let Some(text) = target.description.filter(|d| !d.trim().is_empty()) {
            appended.push(text);
        }
    }

    if let Some(description) = item.description.as_mut() {
        for text in appended {
            description.push_str(", ");
            description.push_str(&text);
        }
    }
    Ok(Some(item))
}

async fn merge_risk(
    source: &dyn WorkItemSource,
    parent: WorkItem,
    kind: WorkItemType,
    policy: &MergePolicy,
) -> PipelineResult<Vec<WorkItem>> {
    let mut children = Vec::new();

    for link in parent.links.iter().filter(|l| l.role == CHILD_LINK_ROLE) {
        let Some(mut child) = lookup(source, &parent, link).await? else {
            return Ok(Vec::new());
        };
        if !child.is_continuation(&policy.continuation_marker) {
            continue;
        }
        match kind {
            WorkItemType::Hazard => inherit_hazard(&parent.fields, &mut child.fields),
            _ => inherit_failure_mode(&parent.fields, &mut child.fields),
        }
        child.item_type = Some(kind);
        children.push(child);
    }

    if children.is_empty() {
        if policy.emit_childless_parents {
            children.push(parent);
        } else {
            debug!(item = %parent.id, "dropping {} without continuation children", kind);
        }
    }
    Ok(children)
}

fn inherit_hazard(parent: &CustomFields, child: &mut CustomFields) {
    child.hazardous_situation = parent.hazardous_situation.clone();
    fill_missing(&mut child.initiating_event, &parent.initiating_event);
    fill_missing(&mut child.harm, &parent.harm);
}

fn inherit_failure_mode(parent: &CustomFields, child: &mut CustomFields) {
    child.failure_mode = parent.failure_mode.clone();
    fill_missing(&mut child.cause, &parent.cause);
    fill_missing(&mut child.effects, &parent.effects);
}

fn fill_missing(slot: &mut Option<String>, parent: &Option<String>) {
    if slot.as_deref().map_or(true, |v| v.trim().is_empty()) {
        slot.clone_from(parent);
    }
}

/// Resolve a link. `Ok(None)` means the target is not retrievable and the
/// owning item must be skipped.
async fn lookup(
    source: &dyn WorkItemSource,
    owner: &WorkItem,
    link: &Link,
) -> PipelineResult<Option<WorkItem>> {
    if link.target_id.is_empty() || link.target_project.is_empty() {
        return Err(PipelineError::merge_integrity(
            &owner.id,
            format!("link with role '{}' has no target", link.role),
        ));
    }

    match source
        .get_work_item(&link.target_project, &link.target_id)
        .await
    {
        Ok(target) if target.id == link.target_id => Ok(Some(target)),
        Ok(target) => Err(PipelineError::merge_integrity(
            &owner.id,
            format!("lookup of {} returned {}", link.target_id, target.id),
        )),
        Err(SourceError::NotRetrievable { project, id }) => {
            warn!(
                item = %owner.id,
                linked = %format!("{project}/{id}"),
                "linked work item is not retrievable; skipping item"
            );
            Ok(None)
        }
        Err(SourceError::Malformed { id, reason }) => Err(PipelineError::merge_integrity(
            &owner.id,
            format!("linked item {id}: {reason}"),
        )),
        Err(other) => Err(PipelineError::SourceUnavailable(other)),
    }
}
