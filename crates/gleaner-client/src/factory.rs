//! Source factory mapping phases to their configured endpoints.

use gleaner_core::error::AppError;
use gleaner_core::models::Phase;
use gleaner_core::traits::SourceFactory;
use gleaner_core::{HttpConfig, SourceConfig};
use reqwest::Client;

use crate::http::{HttpSource, build_client};

/// Creates [`HttpSource`]s from a [`SourceConfig`].
///
/// All sources share one HTTP client and its connection pool. Paging only
/// applies to the users source; related sources are fetched once per parent.
#[derive(Clone)]
pub struct HttpSourceFactory {
    client: Client,
    sources: SourceConfig,
    http: HttpConfig,
    page_size: Option<u32>,
}

impl HttpSourceFactory {
    pub fn new(sources: SourceConfig, http: HttpConfig) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(&http)?,
            sources,
            http,
            page_size: None,
        })
    }

    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }
}

impl SourceFactory for HttpSourceFactory {
    type Source = HttpSource;

    fn create(&self, phase: Phase) -> Result<HttpSource, AppError> {
        let source = HttpSource::with_client(
            self.client.clone(),
            phase.as_str(),
            self.sources.url_for(phase),
            &self.http,
        )?;

        Ok(match phase {
            Phase::Users => source.with_page_size(self.page_size),
            Phase::Addresses | Phase::CreditCards => source,
        })
    }
}
