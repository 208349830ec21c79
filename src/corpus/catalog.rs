//! Upstream event catalog client.

use crate::config::CatalogConfig;
use crate::error::{CatalogError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// One page of catalog results plus the cursor for the next page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPage {
    pub items: Vec<Value>,
    /// `None` on the last page.
    pub after: Option<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct AgendaQuery {
    pub updated_since: DateTime<Utc>,
    pub after: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub after: Option<Vec<Value>>,
}

/// Source of agendas and their events.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_agendas(&self, query: &AgendaQuery) -> Result<CatalogPage>;

    async fn fetch_events(&self, agenda_uid: &str, query: &EventQuery) -> Result<CatalogPage>;
}

/// HTTP client for an OpenAgenda-style REST API.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    config: CatalogConfig,
}

impl HttpCatalog {
    pub fn new(config: CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .gzip(true)
            .build()
            .map_err(CatalogError::from)?;
        Ok(Self { client, config })
    }

    fn agendas_url(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.agendas_endpoint
        )
    }

    fn events_url(&self, agenda_uid: &str) -> String {
        format!(
            "{}/agendas/{agenda_uid}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.events_path_suffix
        )
    }

    fn common_params(&self, after: Option<&Vec<Value>>) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(key) = &self.config.api_key {
            params.push(("key".to_string(), key.clone()));
        }
        params.push(("size".to_string(), self.config.page_size.to_string()));
        params.push(("sort".to_string(), "createdAt.desc".to_string()));
        for value in after.into_iter().flatten() {
            params.push(("after[]".to_string(), cursor_value(value)));
        }
        params
    }

    fn agenda_params(&self, query: &AgendaQuery) -> Vec<(String, String)> {
        let mut params = self.common_params(query.after.as_ref());
        params.push((
            "updatedAt.gte".to_string(),
            query
                .updated_since
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
        ));
        if self.config.official_only {
            params.push(("official".to_string(), "1".to_string()));
        }
        if let Some(region) = &self.config.region {
            params.push(("search".to_string(), region.clone()));
        }
        params
    }

    fn event_params(&self, query: &EventQuery) -> Vec<(String, String)> {
        let mut params = self.common_params(query.after.as_ref());
        params.push(("relative[]".to_string(), "upcoming".to_string()));
        params.push(("monolingual".to_string(), self.config.language.clone()));
        params.push(("includeLabels".to_string(), "1".to_string()));
        params.push(("detailed".to_string(), "0".to_string()));
        if let Some(region) = &self.config.region {
            params.push(("region".to_string(), region.clone()));
        }
        for field in &self.config.include_fields {
            params.push(("includeFields[]".to_string(), field.clone()));
        }
        params
    }

    async fn get_page(&self, url: &str, params: &[(String, String)], items_key: &str) -> Result<CatalogPage> {
        tracing::debug!(url, params = params.len(), "catalog request");

        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(CatalogError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))?;
        parse_page(body, items_key)
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn fetch_agendas(&self, query: &AgendaQuery) -> Result<CatalogPage> {
        self.get_page(&self.agendas_url(), &self.agenda_params(query), "agendas")
            .await
    }

    async fn fetch_events(&self, agenda_uid: &str, query: &EventQuery) -> Result<CatalogPage> {
        self.get_page(&self.events_url(agenda_uid), &self.event_params(query), "events")
            .await
    }
}

/// Split a response body into items and the next-page cursor.
fn parse_page(body: Value, items_key: &str) -> Result<CatalogPage> {
    let Value::Object(mut object) = body else {
        return Err(CatalogError::Decode("response is not a JSON object".into()).into());
    };

    let items = match object.remove(items_key) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(CatalogError::Decode(format!("'{items_key}' is not an array")).into());
        }
    };

    let after = match object.remove("after") {
        Some(Value::Array(values)) if !values.is_empty() => Some(values),
        Some(Value::Null) | Some(Value::Array(_)) | None => None,
        Some(Value::Bool(false)) => None,
        Some(value) => Some(vec![value]),
    };

    Ok(CatalogPage { items, after })
}

fn cursor_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
