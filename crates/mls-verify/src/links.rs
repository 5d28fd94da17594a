use mls_pipeline::{resolve_url, same_origin, Fetcher};
use mls_types::{LinkCheckResult, SiteInventory};

/// HEADs every `<a href>` per page. Internal links resolve against the edge
/// copy; external links are timeout-tolerant, so an unreachable third party
/// is reported but not failed.
pub async fn run(
    fetcher: &Fetcher,
    inventory: &SiteInventory,
    edge_url: &str,
) -> Result<Vec<LinkCheckResult>, String> {
    let mut results = Vec::new();
    for page in &inventory.pages {
        for href in &page.links {
            let Some(absolute) = resolve_url(&page.url, href) else {
                continue;
            };
            let internal = same_origin(&inventory.source_url, &absolute);
            let target = if internal {
                // Rebase the original path onto the edge host.
                let path = absolute
                    .splitn(4, '/')
                    .nth(3)
                    .map(|p| format!("/{p}"))
                    .unwrap_or_else(|| "/".to_string());
                match resolve_url(edge_url, &path) {
                    Some(url) => url,
                    None => continue,
                }
            } else {
                absolute.clone()
            };

            match fetcher.head_status(&target).await {
                Ok(status) => {
                    results.push(LinkCheckResult {
                        page: page.output_path.clone(),
                        href: href.clone(),
                        status,
                        passed: (200..400).contains(&status),
                        external: !internal,
                    });
                }
                Err(err) if !internal => {
                    tracing::info!(href = %href, error = %err, "external link unreachable");
                    results.push(LinkCheckResult {
                        page: page.output_path.clone(),
                        href: href.clone(),
                        status: 0,
                        passed: true,
                        external: true,
                    });
                }
                Err(_) => {
                    results.push(LinkCheckResult {
                        page: page.output_path.clone(),
                        href: href.clone(),
                        status: 0,
                        passed: false,
                        external: false,
                    });
                }
            }
        }
    }
    Ok(results)
}
