//! HTTP record source for read-only JSON APIs.
//!
//! One [`HttpSource`] wraps one endpoint. The response body may be a JSON
//! array (one item per element) or a single object (one item); anything else
//! is rejected. The source only classifies failures, retrying is left to the
//! caller's [`RetryPolicy`](gleaner_core::retry::RetryPolicy).
//!
//! # URL templates
//!
//! A `{parent_id}` placeholder in the URL is replaced with the external id of
//! the user being enriched:
//!
//! ```text
//! https://api.example.com/users/{parent_id}/address
//! ```
//!
//! # Paging
//!
//! With a page size set, requests carry JSONPlaceholder-style `_page` and
//! `_limit` query parameters and the cursor is the next page number. Paging
//! stops at the first page that comes back short.

use gleaner_core::HttpConfig;
use gleaner_core::error::AppError;
use gleaner_core::records::{PageRequest, SourcePage};
use gleaner_core::traits::RecordSource;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Placeholder substituted with the parent's external id.
pub const PARENT_PLACEHOLDER: &str = "{parent_id}";

const USER_AGENT: &str = concat!("gleaner/", env!("CARGO_PKG_VERSION"));

/// Builds the HTTP client shared by every source.
pub fn build_client(config: &HttpConfig) -> Result<Client, AppError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.timeout)
        .build()
        .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

/// Record source backed by one HTTP endpoint.
///
/// # Examples
///
/// ```no_run
/// use gleaner_client::HttpSource;
/// use gleaner_core::HttpConfig;
/// use gleaner_core::records::PageRequest;
/// use gleaner_core::traits::RecordSource;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = HttpSource::new(
///     "users",
///     "https://jsonplaceholder.typicode.com/users",
///     &HttpConfig::default(),
/// )?;
/// let page = source.fetch_page(&PageRequest::default()).await?;
/// println!("Fetched {} users", page.items.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    name: String,
    url_template: String,
    page_size: Option<u32>,
    timeout_secs: u64,
}

impl HttpSource {
    /// Creates a source with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidUrl` if the URL, with the placeholder
    /// substituted, does not parse.
    pub fn new(name: &str, url_template: &str, config: &HttpConfig) -> Result<Self, AppError> {
        Self::with_client(build_client(config)?, name, url_template, config)
    }

    /// Creates a source sharing an existing HTTP client.
    pub fn with_client(
        client: Client,
        name: &str,
        url_template: &str,
        config: &HttpConfig,
    ) -> Result<Self, AppError> {
        Url::parse(&url_template.replace(PARENT_PLACEHOLDER, "0"))
            .map_err(|e| AppError::InvalidUrl(format!("{}: {}", url_template, e)))?;

        Ok(Self {
            client,
            name: name.to_string(),
            url_template: url_template.to_string(),
            page_size: None,
            timeout_secs: config.timeout.as_secs(),
        })
    }

    /// Enables `_page`/`_limit` paging. A size of zero disables it.
    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size.filter(|&size| size > 0);
        self
    }

    /// Whether the URL is resolved per parent.
    pub fn is_per_parent(&self) -> bool {
        self.url_template.contains(PARENT_PLACEHOLDER)
    }

    fn current_page(request: &PageRequest) -> Result<u32, AppError> {
        match &request.cursor {
            None => Ok(1),
            Some(cursor) => cursor
                .parse::<u32>()
                .ok()
                .filter(|&page| page > 0)
                .ok_or_else(|| AppError::InvalidUrl(format!("invalid page cursor '{}'", cursor))),
        }
    }

    fn build_url(&self, request: &PageRequest) -> Result<Url, AppError> {
        let raw = if self.is_per_parent() {
            let parent = request.parent.ok_or_else(|| {
                AppError::InvalidUrl(format!("{}: no parent id for {}", self.name, self.url_template))
            })?;
            self.url_template
                .replace(PARENT_PLACEHOLDER, &parent.to_string())
        } else {
            self.url_template.clone()
        };

        let mut url =
            Url::parse(&raw).map_err(|e| AppError::InvalidUrl(format!("{}: {}", raw, e)))?;

        if let Some(size) = self.page_size {
            let page = Self::current_page(request)?;
            url.query_pairs_mut()
                .append_pair("_page", &page.to_string())
                .append_pair("_limit", &size.to_string());
        }

        Ok(url)
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {}", e))
        } else {
            AppError::NetworkError(e.to_string())
        }
    }
}

/// Maps a non-success status to the matching error.
fn status_error(status: StatusCode, url: &Url) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        AppError::RateLimitExceeded
    } else if status.is_server_error() {
        AppError::ServerError {
            status: status.as_u16(),
            url: url.to_string(),
        }
    } else {
        AppError::ClientStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }
    }
}

/// Splits a response body into items.
fn into_items(source: &str, body: Value) -> Result<Vec<Value>, AppError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(_) => Ok(vec![body]),
        other => Err(AppError::SchemaReject(format!(
            "{}: expected a JSON array or object, got {}",
            source,
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl RecordSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, AppError> {
        let url = self.build_url(request)?;
        debug!(source = %self.name, url = %url, "Fetching page");

        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, &url));
        }

        let body: Value = resp.json().await.map_err(|e| {
            if e.is_decode() {
                AppError::SchemaReject(format!("{}: response is not JSON: {}", self.name, e))
            } else {
                self.transport_error(e)
            }
        })?;
        let items = into_items(&self.name, body)?;

        let next_cursor = match self.page_size {
            Some(size) if !items.is_empty() && items.len() >= size as usize => {
                Some((Self::current_page(request)? + 1).to_string())
            }
            _ => None,
        };

        Ok(SourcePage { items, next_cursor })
    }
}
