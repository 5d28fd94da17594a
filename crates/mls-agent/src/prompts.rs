use serde_json::{json, Value};

use mls_types::{IterationRecord, SiteInventory, VerificationReport};

pub const PLAN_SYSTEM: &str = "You are an expert web performance engineer tuning a \
WordPress-to-static conversion pipeline. Given a site inventory and current measurement data, \
produce an optimization plan as a single JSON object with keys: `settings` (a full settings \
override document with sections crawl, images, css, js, html, fonts), `rationale` (an object \
mapping each section name to a short explanation), and `expected` (an object with \
`performanceScore`, `payloadSavingsPercent`, `lcpImprovementPercent`). Only emit JSON. \
Be conservative with CSS purging on page-builder sites; functional breakage is worse than a \
slower page.";

pub const REVIEW_SYSTEM: &str = "You are reviewing the outcome of one optimization iteration. \
Given verification results and the full iteration history, answer with a single JSON object: \
`verdict` (one of \"pass\", \"needs-changes\", \"critical-failure\"), `settingDelta` (a sparse \
settings object to merge before the next iteration; only when verdict is \"needs-changes\"), \
`reasoning` (a short string), `shouldRebuild` (boolean), `confidence` (0.0-1.0). Only emit \
JSON. Treat any functional regression as at least needs-changes; broken pages or failed \
visual diffs above 10% on most pages are a critical-failure.";

/// User content for the first-iteration plan request.
pub fn plan_user_content(
    inventory: Option<&SiteInventory>,
    measurements: &Value,
    current_settings: &Value,
) -> String {
    let inventory_summary = inventory.map(summarize_inventory).unwrap_or(Value::Null);
    json!({
        "inventory": inventory_summary,
        "measurements": measurements,
        "currentSettings": current_settings,
    })
    .to_string()
}

/// User content for the end-of-iteration review request.
pub fn review_user_content(
    iteration: u32,
    report: &VerificationReport,
    history: &[IterationRecord],
) -> String {
    json!({
        "iteration": iteration,
        "verification": {
            "visualFailures": report.visual_failures(),
            "functionalFailures": report.functional_failures(),
            "brokenLinks": report.broken_links(),
            "visual": report.visual,
            "functional": report.functional,
            "performance": report.performance,
            "errors": report.errors,
        },
        "history": history,
    })
    .to_string()
}

/// Compact inventory view; full page HTML never goes to the oracle.
fn summarize_inventory(inventory: &SiteInventory) -> Value {
    json!({
        "sourceUrl": inventory.source_url,
        "pageCount": inventory.pages.len(),
        "fingerprint": inventory.fingerprint,
        "isPageBuilder": inventory.is_page_builder(),
        "pages": inventory.pages.iter().take(20).map(|p| json!({
            "path": p.output_path,
            "scripts": p.scripts.len(),
            "stylesheets": p.stylesheets.len(),
            "images": p.images.len(),
            "interactive": p.interactive.iter().map(|i| i.kind.as_str()).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn plan_content_is_valid_json_with_expected_keys() {
        let inventory = SiteInventory {
            site_id: "site_a".into(),
            source_url: "https://acme.test".into(),
            pages: Vec::new(),
            fingerprint: vec!["plugin:elementor".into()],
            crawled_at: Utc::now(),
        };
        let content = plan_user_content(
            Some(&inventory),
            &json!({"mobile": {"performance": 40}}),
            &json!({}),
        );
        let parsed: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["inventory"]["isPageBuilder"], true);
        assert_eq!(parsed["measurements"]["mobile"]["performance"], 40);
    }
}
