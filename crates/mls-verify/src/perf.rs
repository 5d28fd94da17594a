use mls_adapters::Services;
use mls_types::{MeasureStrategy, PagePerformance, SiteInventory};

use crate::visual::edge_page_url;

/// Mobile measurement for every page, matching the other categories' full
/// coverage. Per-page failures are logged and skipped.
pub async fn run(
    services: &Services,
    inventory: &SiteInventory,
    edge_url: &str,
) -> Result<Vec<PagePerformance>, String> {
    let mut results = Vec::new();
    for page in &inventory.pages {
        let Some(edge_page) = edge_page_url(edge_url, &page.output_path) else {
            continue;
        };
        match services
            .measurement
            .measure(&edge_page, MeasureStrategy::Mobile)
            .await
        {
            Ok(outcome) => results.push(PagePerformance {
                page: page.output_path.clone(),
                performance: outcome.performance,
                ttfb_ms: outcome.vitals.ttfb_ms,
                load_time_ms: outcome.vitals.lcp_ms,
            }),
            Err(err) => {
                tracing::warn!(page = %page.output_path, error = %err, "page measurement failed");
            }
        }
    }
    Ok(results)
}
