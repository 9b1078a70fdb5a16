use dsa_adapters::{extract_project_list, list_page_url, AdapterError, ExtractedPage, PageLayout};
use dsa_core::PageCursor;
use dsa_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// A failure that ends pagination for one district.
#[derive(Debug, Error)]
pub enum DistrictError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("page {page} at {url} has neither a results grid nor a no-results message")]
    UnrecognizedMarkup { page: u32, url: String },
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page_index: u32,
    pub url: String,
    pub body: Vec<u8>,
    pub extracted: ExtractedPage,
}

#[derive(Debug)]
pub enum PageOutcome {
    Fetched(FetchedPage),
    /// Transient failure that outlasted the retry limit. Pagination moves on.
    Failed {
        page_index: u32,
        url: String,
        error: FetchError,
    },
}

/// Pull-based pagination over one district's project list. Each call to
/// [`DistrictPager::next_page`] issues at most one list request.
pub struct DistrictPager<'a> {
    fetcher: &'a HttpFetcher,
    base_url: &'a Url,
    job_id: Uuid,
    cursor: PageCursor,
    max_pages: u32,
    cancel: CancellationToken,
}

impl<'a> DistrictPager<'a> {
    pub fn new(
        fetcher: &'a HttpFetcher,
        base_url: &'a Url,
        job_id: Uuid,
        district_code: &str,
        max_pages: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            base_url,
            job_id,
            cursor: PageCursor::new(district_code),
            max_pages,
            cancel,
        }
    }

    pub fn cursor(&self) -> &PageCursor {
        &self.cursor
    }

    /// `Ok(None)` once the district is exhausted, the page limit is hit or the
    /// job is cancelled.
    pub async fn next_page(&mut self) -> Result<Option<PageOutcome>, DistrictError> {
        if !self.cursor.has_more {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            debug!(district = %self.cursor.district_code, "cancelled before next page");
            self.cursor.exhaust();
            return Ok(None);
        }
        if self.cursor.page_index >= self.max_pages {
            warn!(
                district = %self.cursor.district_code,
                max_pages = self.max_pages,
                "page limit reached"
            );
            self.cursor.exhaust();
            return Ok(None);
        }

        let page_index = self.cursor.page_index;
        let url = match list_page_url(self.base_url, &self.cursor.district_code, page_index) {
            Ok(url) => url,
            Err(err) => {
                self.cursor.exhaust();
                return Err(err.into());
            }
        };

        let response = match self
            .fetcher
            .fetch_page(self.job_id, &self.cursor.district_code, &url)
            .await
        {
            Ok(response) => response,
            Err(error) if error.is_transient() => {
                self.cursor.advance(true);
                return Ok(Some(PageOutcome::Failed {
                    page_index,
                    url,
                    error,
                }));
            }
            Err(error) => {
                self.cursor.exhaust();
                return Err(error.into());
            }
        };

        let body = String::from_utf8_lossy(&response.body);
        let extracted = match extract_project_list(&body, page_index) {
            Ok(extracted) => extracted,
            Err(err) => {
                self.cursor.exhaust();
                return Err(err.into());
            }
        };

        match extracted.layout {
            PageLayout::Grid => {
                let has_more = extracted.has_next_page && !extracted.is_empty();
                self.cursor.advance(has_more);
            }
            PageLayout::NoResults => self.cursor.advance(false),
            PageLayout::Unrecognized => {
                self.cursor.exhaust();
                return Err(DistrictError::UnrecognizedMarkup {
                    page: page_index + 1,
                    url,
                });
            }
        }
        debug!(
            district = %self.cursor.district_code,
            page = page_index + 1,
            rows = extracted.rows.len(),
            malformed = extracted.malformed.len(),
            has_more = self.cursor.has_more,
            "list page extracted"
        );

        Ok(Some(PageOutcome::Fetched(FetchedPage {
            page_index,
            url,
            body: response.body,
            extracted,
        })))
    }
}
