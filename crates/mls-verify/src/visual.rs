use std::path::Path;

use mls_types::{DiffStatus, SiteInventory, ViewportKind, VisualDiffResult};

use mls_adapters::Services;
use mls_pipeline::{page_slug, resolve_url};

/// Byte-wise pixel comparison over the raw buffers the browser service
/// returns. Buffers of different lengths are compared over the overlap and
/// the length delta counts as differing.
pub fn pixel_diff(baseline: &[u8], candidate: &[u8]) -> (u64, f64) {
    let overlap = baseline.len().min(candidate.len());
    let mut differing_bytes = baseline[..overlap]
        .iter()
        .zip(&candidate[..overlap])
        .filter(|(a, b)| a != b)
        .count();
    differing_bytes += baseline.len().abs_diff(candidate.len());
    let total = baseline.len().max(candidate.len()).max(1);
    let diff_pixels = (differing_bytes / 4) as u64;
    let diff_percent = differing_bytes as f64 / total as f64 * 100.0;
    (diff_pixels, diff_percent)
}

/// Renders every page × viewport on the edge and compares against the crawl
/// baselines. Pages without a baseline (carried forward unchanged) are
/// skipped; per-page failures are reported, not fatal.
pub async fn run(
    services: &Services,
    inventory: &SiteInventory,
    edge_url: &str,
    screenshots_dir: &Path,
) -> Result<Vec<VisualDiffResult>, String> {
    let mut results = Vec::new();
    for page in &inventory.pages {
        let slug = page_slug(&page.output_path);
        let Some(edge_page) = edge_page_url(edge_url, &page.output_path) else {
            continue;
        };
        for viewport in ViewportKind::ALL {
            let baseline_path =
                screenshots_dir.join(format!("{slug}.{}.png", viewport.as_str()));
            let Ok(baseline) = tokio::fs::read(&baseline_path).await else {
                continue;
            };
            match services.browser.screenshot(&edge_page, viewport).await {
                Ok(candidate) => {
                    let (diff_pixels, diff_percent) = pixel_diff(&baseline, &candidate);
                    results.push(VisualDiffResult {
                        page: page.output_path.clone(),
                        viewport: viewport.as_str().to_string(),
                        diff_percent,
                        diff_pixels,
                        status: DiffStatus::from_percent(diff_percent),
                    });
                }
                Err(err) => {
                    tracing::warn!(page = %page.output_path, viewport = viewport.as_str(), error = %err, "edge screenshot failed");
                    results.push(VisualDiffResult {
                        page: page.output_path.clone(),
                        viewport: viewport.as_str().to_string(),
                        diff_percent: 100.0,
                        diff_pixels: 0,
                        status: DiffStatus::Failed,
                    });
                }
            }
        }
    }
    Ok(results)
}

/// `about/index.html` on `https://mls-x.edge.test` → `…/about/`.
pub fn edge_page_url(edge_url: &str, output_path: &str) -> Option<String> {
    let path = if output_path == "index.html" {
        "/".to_string()
    } else if let Some(dir) = output_path.strip_suffix("/index.html") {
        format!("/{dir}/")
    } else {
        format!("/{output_path}")
    };
    resolve_url(edge_url, &path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_buffers_have_zero_diff() {
        let (pixels, percent) = pixel_diff(b"aaaa", b"aaaa");
        assert_eq!(pixels, 0);
        assert_eq!(percent, 0.0);
    }

    #[test]
    fn length_mismatch_counts_as_difference() {
        let (_, percent) = pixel_diff(b"aaaaaaaa", b"aaaa");
        assert_eq!(percent, 50.0);
    }

    #[test]
    fn edge_urls_follow_directory_convention() {
        assert_eq!(
            edge_page_url("https://mls-a.edge.test", "index.html").as_deref(),
            Some("https://mls-a.edge.test/")
        );
        assert_eq!(
            edge_page_url("https://mls-a.edge.test", "about/index.html").as_deref(),
            Some("https://mls-a.edge.test/about/")
        );
        assert_eq!(
            edge_page_url("https://mls-a.edge.test", "feed.xml").as_deref(),
            Some("https://mls-a.edge.test/feed.xml")
        );
    }
}
