use mls_adapters::{ElementState, Services};
use mls_types::{FunctionalResult, SiteInventory};

use crate::visual::edge_page_url;

fn state_changed(states: &[ElementState]) -> bool {
    let before = states.iter().find(|s| s.phase == "before");
    let after = states.iter().find(|s| s.phase == "after");
    match (before, after) {
        (Some(before), Some(after)) => {
            before.outer_html != after.outer_html || before.visible != after.visible
        }
        _ => false,
    }
}

/// Replays every detected interactive element against both the source page
/// (baseline behavior) and the edge copy, and flags elements that respond on
/// the source but no longer on the edge.
pub async fn run(
    services: &Services,
    inventory: &SiteInventory,
    edge_url: &str,
) -> Result<Vec<FunctionalResult>, String> {
    let mut results = Vec::new();
    for page in &inventory.pages {
        let Some(edge_page) = edge_page_url(edge_url, &page.output_path) else {
            continue;
        };
        for element in &page.interactive {
            let baseline = services.browser.replay(&page.url, element).await;
            let optimized = services.browser.replay(&edge_page, element).await;

            let result = match (baseline, optimized) {
                (Ok(baseline), Ok(optimized)) => {
                    let baseline_changed = state_changed(&baseline);
                    let optimized_changed = state_changed(&optimized);
                    if baseline_changed && !optimized_changed {
                        FunctionalResult {
                            page: page.output_path.clone(),
                            selector: element.selector.clone(),
                            action: element.action.clone(),
                            passed: false,
                            failure_reason: Some(format!(
                                "{} responds on the source but not on the optimized copy",
                                element.kind.as_str()
                            )),
                        }
                    } else {
                        FunctionalResult {
                            page: page.output_path.clone(),
                            selector: element.selector.clone(),
                            action: element.action.clone(),
                            passed: true,
                            failure_reason: None,
                        }
                    }
                }
                (_, Err(err)) => FunctionalResult {
                    page: page.output_path.clone(),
                    selector: element.selector.clone(),
                    action: element.action.clone(),
                    passed: false,
                    failure_reason: Some(format!("replay failed: {err}")),
                },
                (Err(err), Ok(_)) => {
                    // Baseline itself is unreplayable; nothing to compare.
                    tracing::warn!(selector = %element.selector, error = %err, "baseline replay failed");
                    continue;
                }
            };
            results.push(result);
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(phase: &str, html: &str) -> ElementState {
        ElementState {
            phase: phase.to_string(),
            outer_html: html.to_string(),
            visible: true,
        }
    }

    #[test]
    fn change_detection_compares_before_and_after() {
        assert!(state_changed(&[
            state("before", "<div></div>"),
            state("after", "<div class='open'></div>"),
        ]));
        assert!(!state_changed(&[
            state("before", "<div></div>"),
            state("after", "<div></div>"),
        ]));
        assert!(!state_changed(&[state("before", "<div></div>")]));
    }
}
