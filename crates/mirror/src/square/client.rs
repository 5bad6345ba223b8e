//! Square listing client
//!
//! Customers and payments are listed with GET and query parameters, orders
//! through the search endpoint. Every listing is sorted newest first.

use anyhow::{Context, anyhow};
use log::debug;
use serde_json::{Value, json};

use super::api::ApiErrorDetail;
use super::{API_VERSION, BASE_URL};
use crate::error::ListError;
use crate::models::Resource;
use crate::sync::{ListPage, ListRequest, ListingSource};

/// Largest page the GET listing endpoints accept
const MAX_LIST_LIMIT: usize = 100;

/// Largest page the order search endpoint accepts
const MAX_SEARCH_LIMIT: usize = 1000;

/// Square API client for listing merchant records
pub struct SquareClient {
    base_url: String,
    location_ids: Vec<String>,
}

impl Default for SquareClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SquareClient {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            location_ids: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Locations searched when listing orders
    pub fn with_location_ids(mut self, location_ids: Vec<String>) -> Self {
        self.location_ids = location_ids;
        self
    }

    fn list_url(&self, request: &ListRequest) -> String {
        let mut url = format!(
            "{}/v2/{}?limit={}&sort_field={}&sort_order=DESC",
            self.base_url,
            request.resource.as_str(),
            request.limit.clamp(1, MAX_LIST_LIMIT),
            request.resource.sort_field(),
        );
        if let Some(cursor) = &request.cursor {
            url.push_str(&format!("&cursor={}", urlencoding::encode(cursor)));
        }
        url
    }

    fn search_body(&self, request: &ListRequest) -> Value {
        let mut body = json!({
            "limit": request.limit.clamp(1, MAX_SEARCH_LIMIT),
            "location_ids": self.location_ids,
            "query": {
                "sort": {
                    "sort_field": request.resource.sort_field(),
                    "sort_order": "DESC",
                }
            },
        });
        if let Some(cursor) = &request.cursor {
            body["cursor"] = json!(cursor);
        }
        body
    }

    fn send(&self, access_token: &str, request: &ListRequest) -> Result<Value, ListError> {
        let auth = format!("Bearer {}", access_token);
        let result = match request.resource {
            Resource::Customers | Resource::Payments => ureq::get(&self.list_url(request))
                .header("Authorization", &auth)
                .header("Square-Version", API_VERSION)
                .call(),
            Resource::Orders => {
                if self.location_ids.is_empty() {
                    return Err(ListError::Remote(anyhow!(
                        "Listing orders requires at least one location id"
                    )));
                }
                ureq::post(&format!("{}/v2/orders/search", self.base_url))
                    .header("Authorization", &auth)
                    .header("Square-Version", API_VERSION)
                    .send_json(self.search_body(request))
            }
        };

        let mut response = match result {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(429)) => return Err(ListError::RateLimited),
            Err(e) => {
                return Err(ListError::Remote(
                    anyhow::Error::new(e).context(format!("Failed to list {}", request.resource)),
                ));
            }
        };

        response
            .body_mut()
            .read_json()
            .with_context(|| format!("Failed to parse {} listing response", request.resource))
            .map_err(ListError::Remote)
    }
}

impl ListingSource for SquareClient {
    fn list(&self, access_token: &str, request: &ListRequest) -> Result<ListPage, ListError> {
        let body = self.send(access_token, request)?;
        parse_page(request.resource, body).map_err(ListError::Remote)
    }
}

/// Split a listing response into its records and the next cursor
///
/// A missing list is an empty page; a missing or empty cursor ends the listing.
fn parse_page(resource: Resource, mut body: Value) -> anyhow::Result<ListPage> {
    if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
        let errors: Vec<ApiErrorDetail> =
            serde_json::from_value(errors.clone()).context("Malformed errors in listing response")?;
        if !errors.is_empty() {
            let detail = errors
                .iter()
                .map(|e| {
                    format!(
                        "{}: {}",
                        e.code.as_deref().or(e.category.as_deref()).unwrap_or("UNKNOWN"),
                        e.detail.as_deref().unwrap_or("")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::bail!("Square API returned errors: {}", detail);
        }
    }

    let records = match body.get_mut(resource.as_str()).map(Value::take) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => anyhow::bail!("Expected {} to be an array, got {}", resource, other),
    };
    let cursor = body
        .get("cursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    debug!("Parsed {} page with {} records", resource, records.len());
    Ok(ListPage { records, cursor })
}
