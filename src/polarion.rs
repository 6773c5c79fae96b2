//! Polarion REST client.
//!
//! Implements [`WorkItemSource`] over the Polarion REST API (JSON:API
//! documents under `/rest/v1`). Authentication uses a personal access
//! token sent as a bearer token; the token is read from the environment
//! variable named by `source.token_env`.
//!
//! Work items are requested with a sparse fieldset: title, type,
//! description, the configured custom fields, and the `backlinkedWorkItems`
//! relationship. Back-links carry the items that link *to* this one, which
//! is how continuation fragments and hazard children point at their parent.
//! Link ids have the form `{project}/{id}/{role}/{targetProject}/{targetId}`.
//!
//! Custom fields are decoded here, once, into [`CustomFields`]. Rich-text
//! values (`{"type": "text/html", "value": ...}`) and enum values
//! (`{"id": ...}`) are reduced to their string content.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::{FieldNames, SourceConfig};
use crate::error::SourceError;
use crate::models::{CustomFields, Link, WorkItem, WorkItemType};
use crate::source::WorkItemSource;

const LINK_RELATIONSHIP: &str = "backlinkedWorkItems";

pub struct PolarionClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    page_size: usize,
    fields: FieldNames,
    groups: BTreeMap<String, Vec<String>>,
}

impl PolarionClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Fails if the token variable is unset or the CA bundle cannot be read.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .with_context(|| format!("{} environment variable not set", config.token_env))?;

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));
        if let Some(path) = &config.ca_cert {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read CA bundle: {}", path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid CA bundle: {}", path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            http: builder.build()?,
            api_url: format!("{}/rest/v1", config.base_url.trim_end_matches('/')),
            token,
            page_size: config.page_size,
            fields: config.fields.clone(),
            groups: config.groups.clone(),
        })
    }

    fn fieldset(&self) -> String {
        let mut fields = vec!["title", "type", "description"];
        fields.extend(self.fields.all());
        fields.push(LINK_RELATIONSHIP);
        fields.join(",")
    }

    async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<(reqwest::StatusCode, Value), SourceError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Ok((status, Value::Null));
        }
        let body: Value = response.json().await?;
        Ok((status, body))
    }
}

#[async_trait]
impl WorkItemSource for PolarionClient {
    async fn query(&self, project_id: &str, query: &str) -> Result<Vec<WorkItem>, SourceError> {
        let url = format!("{}/projects/{}/workitems", self.api_url, project_id);
        let mut items = Vec::new();
        let mut page = 1usize;

        loop {
            let params = [
                ("query", query.to_string()),
                ("fields[workitems]", self.fieldset()),
                ("page[size]", self.page_size.to_string()),
                ("page[number]", page.to_string()),
            ];
            let (status, body) = self.get_json(&url, &params).await?;
            if !status.is_success() {
                return Err(SourceError::unavailable(format!(
                    "GET {} returned {}",
                    url, status
                )));
            }

            let data = body
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| SourceError::malformed(project_id, "response has no data array"))?;
            debug!(project = project_id, page, count = data.len(), "work item page");

            for resource in data {
                items.push(decode_work_item(resource, &self.fields)?);
            }

            let has_next = body.pointer("/links/next").is_some_and(|v| !v.is_null());
            if !has_next || data.is_empty() {
                break;
            }
            page += 1;
        }

        Ok(items)
    }

    async fn get_work_item(&self, project_id: &str, id: &str) -> Result<WorkItem, SourceError> {
        let url = format!("{}/projects/{}/workitems/{}", self.api_url, project_id, id);
        let params = [("fields[workitems]", self.fieldset())];
        let (status, body) = self.get_json(&url, &params).await?;

        match status.as_u16() {
            200..=299 => {}
            403 | 404 => {
                return Err(SourceError::NotRetrievable {
                    project: project_id.to_string(),
                    id: id.to_string(),
                })
            }
            _ => {
                return Err(SourceError::unavailable(format!(
                    "GET {} returned {}",
                    url, status
                )))
            }
        }

        let resource = body
            .get("data")
            .ok_or_else(|| SourceError::malformed(id, "response has no data object"))?;
        decode_work_item(resource, &self.fields)
    }

    async fn group_projects(&self, group_id: &str) -> Result<Vec<String>, SourceError> {
        self.groups
            .get(group_id)
            .filter(|projects| !projects.is_empty())
            .cloned()
            .ok_or_else(|| SourceError::UnknownLocation(group_id.to_string()))
    }
}

/// Decode one JSON:API work-item resource.
pub fn decode_work_item(resource: &Value, fields: &FieldNames) -> Result<WorkItem, SourceError> {
    let full_id = resource
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::malformed("<unknown>", "resource has no id"))?;
    let (project_id, id) = full_id
        .split_once('/')
        .ok_or_else(|| SourceError::malformed(full_id, "id is not of the form project/id"))?;

    let attributes = resource.get("attributes").unwrap_or(&Value::Null);
    let text = |name: &str| attributes.get(name).and_then(field_text);

    let links = match resource.pointer(&format!("/relationships/{LINK_RELATIONSHIP}/data")) {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| {
                entry
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(parse_backlink)
                    .ok_or_else(|| SourceError::malformed(full_id, "unparseable link id"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };

    Ok(WorkItem {
        id: id.to_string(),
        project_id: project_id.to_string(),
        title: text("title"),
        item_type: text("type").as_deref().and_then(WorkItemType::from_source_id),
        description: text("description"),
        fields: CustomFields {
            external_id: text(&fields.external_id),
            hazardous_situation: text(&fields.hazardous_situation),
            initiating_event: text(&fields.initiating_event),
            harm: text(&fields.harm),
            failure_mode: text(&fields.failure_mode),
            cause: text(&fields.cause),
            effects: text(&fields.effects),
        },
        links,
    })
}

/// Reduce a field value to text: plain strings, rich text, or enum options.
fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("value")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a back-link id. The linking item is the first two segments.
fn parse_backlink(link_id: &str) -> Option<Link> {
    let parts: Vec<&str> = link_id.split('/').collect();
    match parts.as_slice() {
        [project, id, role, _, _] if !project.is_empty() && !id.is_empty() => {
            Some(Link::new(role, project, id))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_requirement_with_rich_text() {
        let resource = json!({
            "type": "workitems",
            "id": "TSS/TSS-7",
            "attributes": {
                "title": "Beam stop",
                "type": "requirement",
                "description": {"type": "text/html", "value": "<p>Stop the beam.</p>"},
                "ibaFullPuid": "SYS-REQ-7"
            },
            "relationships": {
                "backlinkedWorkItems": {
                    "data": [
                        {"type": "linkedworkitems", "id": "TSS/TSS-8/parent/TSS/TSS-7"}
                    ]
                }
            }
        });
        let item = decode_work_item(&resource, &FieldNames::default()).unwrap();
        assert_eq!(item.id, "TSS-7");
        assert_eq!(item.project_id, "TSS");
        assert_eq!(item.item_type, Some(WorkItemType::Requirement));
        assert_eq!(item.description.as_deref(), Some("<p>Stop the beam.</p>"));
        assert_eq!(item.fields.external_id.as_deref(), Some("SYS-REQ-7"));
        assert_eq!(item.links, vec![Link::new("parent", "TSS", "TSS-8")]);
    }

    #[test]
    fn decodes_hazard_fields_and_unknown_type() {
        let resource = json!({
            "id": "RA/RA-3",
            "attributes": {
                "type": "hazard",
                "ibaHazardousSituation": {"type": "text/plain", "value": "Beam on"},
                "ibaHarm": "Overdose"
            }
        });
        let item = decode_work_item(&resource, &FieldNames::default()).unwrap();
        assert_eq!(item.fields.hazardous_situation.as_deref(), Some("Beam on"));
        assert_eq!(item.fields.harm.as_deref(), Some("Overdose"));
        assert_eq!(item.fields.initiating_event, None);
        assert!(item.links.is_empty());

        let other = json!({"id": "RA/RA-4", "attributes": {"type": "task"}});
        let item = decode_work_item(&other, &FieldNames::default()).unwrap();
        assert_eq!(item.item_type, None);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let no_project = json!({"id": "RA-3", "attributes": {}});
        assert!(matches!(
            decode_work_item(&no_project, &FieldNames::default()),
            Err(SourceError::Malformed { .. })
        ));

        let bad_link = json!({
            "id": "RA/RA-3",
            "relationships": {"backlinkedWorkItems": {"data": [{"id": "RA/RA-4"}]}}
        });
        assert!(matches!(
            decode_work_item(&bad_link, &FieldNames::default()),
            Err(SourceError::Malformed { .. })
        ));
    }

    #[test]
    fn enum_values_reduce_to_id() {
        assert_eq!(field_text(&json!({"id": "approved"})).as_deref(), Some("approved"));
        assert_eq!(field_text(&json!(null)), None);
    }
}
