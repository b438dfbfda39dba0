use std::sync::Arc;
use std::time::Duration;

use oppsync_adapters::{ApiError, SearchApi, SearchFilters, SearchParams};
use oppsync_core::OpportunityRecord;
use tracing::{info, warn};

/// Walks every page of one upstream query.
pub struct BulkFetcher {
    api: Arc<dyn SearchApi>,
    page_size: u32,
    page_delay: Duration,
}

impl BulkFetcher {
    pub fn new(api: Arc<dyn SearchApi>, page_size: u32, page_delay: Duration) -> Self {
        Self {
            api,
            page_size,
            page_delay,
        }
    }

    /// Returns all records for the window, in upstream order. The first failed
    /// page aborts the fetch; retries already happened inside the client.
    pub async fn fetch_all(
        &self,
        posted_from: &str,
        posted_to: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<OpportunityRecord>, ApiError> {
        let mut records: Vec<OpportunityRecord> = Vec::new();
        let mut offset = 0u64;
        let mut total: Option<u64> = None;
        let mut pages = 0usize;

        loop {
            if pages > 0 && !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }

            let page = self
                .api
                .search(&SearchParams {
                    posted_from: posted_from.to_string(),
                    posted_to: posted_to.to_string(),
                    limit: self.page_size,
                    offset,
                    filters: filters.clone(),
                })
                .await?;
            pages += 1;

            let total = *total.get_or_insert(page.total_count);
            let received = page.records.len() as u64;
            records.extend(page.records);
            offset += received;

            info!(
                fetched = records.len(),
                total,
                pages,
                naics = filters.naics_code.as_deref().unwrap_or(""),
                "fetch progress"
            );

            if total == 0 || offset >= total {
                break;
            }
            if received == 0 {
                warn!(
                    fetched = offset,
                    total, "upstream returned an empty page before the reported total; stopping"
                );
                break;
            }
        }

        Ok(records)
    }
}
