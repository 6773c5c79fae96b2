//! Work-item source boundary.
//!
//! [`WorkItemSource`] is the seam between the pipeline and the requirements
//! tracker. The Polarion REST client in [`crate::polarion`] implements it;
//! tests use in-memory doubles.
//!
//! [`fetch`] builds the tracker query for an [`IndexKey`], resolves the
//! release name to its configuration work item, expands project groups,
//! and returns the matching approved, non-continuation work items.
//!
//! # Query grammar
//!
//! ```text
//! type:(requirement hazard) AND NOT ibaFullPuid:("(cont'd)") AND status:approved
//!     [AND ibaApplicableConfiguration.KEY:("PTSC-42")]
//!     [AND (updated:[20240301 TO 30000000] OR created:[20240301 TO 30000000])]
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::{PipelineError, PipelineResult, SourceError};
use crate::models::{IndexKey, LocationType, TypeSet, WorkItem};

/// Upper bound of the open-ended date range in incremental queries.
const DATE_RANGE_END: &str = "30000000";

/// A hierarchical work-item store.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use polarion_copilot::error::SourceError;
/// use polarion_copilot::models::WorkItem;
/// use polarion_copilot::source::WorkItemSource;
///
/// struct EmptySource;
///
/// #[async_trait]
/// impl WorkItemSource for EmptySource {
///     async fn query(&self, _project: &str, _query: &str) -> Result<Vec<WorkItem>, SourceError> {
///         Ok(vec![])
///     }
///
///     async fn get_work_item(&self, project: &str, id: &str) -> Result<WorkItem, SourceError> {
///         Err(SourceError::NotRetrievable { project: project.into(), id: id.into() })
///     }
///
///     async fn group_projects(&self, group: &str) -> Result<Vec<String>, SourceError> {
///         Err(SourceError::UnknownLocation(group.into()))
///     }
/// }
/// ```
#[async_trait]
pub trait WorkItemSource: Send + Sync {
    /// Run a query against one project and return every matching item.
    async fn query(&self, project_id: &str, query: &str) -> Result<Vec<WorkItem>, SourceError>;

    /// Read a single work item. Unreadable items are
    /// [`SourceError::NotRetrievable`].
    async fn get_work_item(&self, project_id: &str, id: &str) -> Result<WorkItem, SourceError>;

    /// Member projects of a project group, in a stable order.
    async fn group_projects(&self, group_id: &str) -> Result<Vec<String>, SourceError>;
}

/// Build the work-item query.
///
/// `release_item` is the id of the resolved release configuration item.
pub fn build_query(
    config: &SourceConfig,
    item_types: &TypeSet,
    release_item: Option<&str>,
    since: Option<NaiveDate>,
) -> String {
    let mut query = format!(
        "type:({}) AND NOT {}:(\"{}\") AND status:approved",
        item_types.to_key(),
        config.fields.external_id,
        escape_phrase(&config.continuation_marker)
    );
    if let Some(item) = release_item {
        query.push_str(&format!(
            " AND {}.KEY:(\"{}\")",
            config.release_field,
            escape_phrase(item)
        ));
    }
    if let Some(date) = since {
        let day = date.format("%Y%m%d");
        query.push_str(&format!(
            " AND (updated:[{day} TO {DATE_RANGE_END}] OR created:[{day} TO {DATE_RANGE_END}])"
        ));
    }
    query
}

/// Escape a value for use inside a quoted Lucene phrase.
fn escape_phrase(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Resolve a release name to the id of its configuration work item.
///
/// The name is trimmed and must match exactly one item title in the
/// configuration project (exact, case-sensitive).
pub async fn resolve_release(
    source: &dyn WorkItemSource,
    config: &SourceConfig,
    release: &str,
) -> PipelineResult<String> {
    let title = release.trim();
    let query = format!("title:\"{}\"", escape_phrase(title));
    let candidates = source
        .query(&config.config_project, &query)
        .await
        .map_err(PipelineError::SourceUnavailable)?;

    let matches: Vec<&WorkItem> = candidates
        .iter()
        .filter(|item| item.title.as_deref().map(str::trim) == Some(title))
        .collect();

    match matches.as_slice() {
        [only] => {
            debug!(release = title, item = %only.id, "resolved release");
            Ok(only.id.clone())
        }
        other => Err(PipelineError::ReleaseResolution {
            release: title.to_string(),
            matches: other.len(),
        }),
    }
}

/// Fetch the approved, non-continuation work items addressed by `key`.
///
/// `since` narrows the result to items created or updated on or after that
/// day. An empty result is not an error.
pub async fn fetch(
    source: &dyn WorkItemSource,
    config: &SourceConfig,
    key: &IndexKey,
    since: Option<DateTime<Utc>>,
) -> PipelineResult<Vec<WorkItem>> {
    let release_item = match key.release.as_deref() {
        Some(release) => Some(resolve_release(source, config, release).await?),
        None => None,
    };

    let query = build_query(
        config,
        &key.item_types,
        release_item.as_deref(),
        since.map(|ts| ts.date_naive()),
    );

    let projects = match key.location_type {
        LocationType::Project => vec![key.location.clone()],
        LocationType::Group => source
            .group_projects(&key.location)
            .await
            .map_err(PipelineError::SourceUnavailable)?,
    };

    let mut items = Vec::new();
    for project in &projects {
        debug!(project = %project, query = %query, "querying work items");
        let found = source
            .query(project, &query)
            .await
            .map_err(PipelineError::SourceUnavailable)?;
        items.extend(found);
    }

    info!(
        location = %key.location,
        projects = projects.len(),
        items = items.len(),
        "fetched work items"
    );
    Ok(items)
}
