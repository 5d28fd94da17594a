mod functional;
mod links;
mod perf;
mod visual;

pub use visual::{edge_page_url, pixel_diff};

use std::path::PathBuf;

use mls_adapters::Services;
use mls_pipeline::Fetcher;
use mls_types::{SiteInventory, VerificationReport};

/// Runs the four verification categories concurrently against a deployed
/// artifact. A failure in one category lands in `errors` and leaves the
/// other three intact.
pub struct VerificationSuite {
    services: Services,
    fetcher: Fetcher,
}

impl VerificationSuite {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            fetcher: Fetcher::new(),
        }
    }

    pub async fn run(
        &self,
        inventory: &SiteInventory,
        edge_url: &str,
        screenshots_dir: PathBuf,
    ) -> VerificationReport {
        let (visual, functional, links, performance) = tokio::join!(
            visual::run(&self.services, inventory, edge_url, &screenshots_dir),
            functional::run(&self.services, inventory, edge_url),
            links::run(&self.fetcher, inventory, edge_url),
            perf::run(&self.services, inventory, edge_url),
        );

        let mut report = VerificationReport::default();
        match visual {
            Ok(results) => report.visual = results,
            Err(err) => report.errors.push(format!("visual: {err}")),
        }
        match functional {
            Ok(results) => report.functional = results,
            Err(err) => report.errors.push(format!("functional: {err}")),
        }
        match links {
            Ok(results) => report.links = results,
            Err(err) => report.errors.push(format!("links: {err}")),
        }
        match performance {
            Ok(results) => report.performance = results,
            Err(err) => report.errors.push(format!("performance: {err}")),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mls_pipeline::testing::mock_services;
    use mls_types::{
        DiffStatus, InteractiveElement, InteractiveKind, PageEntry, ViewportKind,
    };
    use std::collections::HashMap;

    fn inventory() -> SiteInventory {
        SiteInventory {
            site_id: "site_a".into(),
            source_url: "https://acme.test".into(),
            pages: vec![PageEntry {
                url: "https://acme.test/".into(),
                output_path: "index.html".into(),
                content_hash: "h".into(),
                html_bytes: 100,
                scripts: Vec::new(),
                stylesheets: Vec::new(),
                images: Vec::new(),
                fonts: Vec::new(),
                interactive: vec![InteractiveElement {
                    kind: InteractiveKind::Slider,
                    selector: ".swiper".into(),
                    action: "click".into(),
                    jquery_dependent: true,
                }],
                links: Vec::new(),
            }],
            fingerprint: Vec::new(),
            crawled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn visual_and_functional_pass_against_identical_mock_renders() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pages = HashMap::new();
        pages.insert("https://acme.test/".to_string(), "<html></html>".to_string());
        pages.insert(
            "https://mls-site_a.edge.test/".to_string(),
            "<html></html>".to_string(),
        );
        let services = mock_services(pages, Vec::new());

        // Baselines must match what the mock browser returns for the edge
        // render of the same page.
        let edge_url = "https://mls-site_a.edge.test";
        for viewport in ViewportKind::ALL {
            let bytes = services
                .browser
                .screenshot(&format!("{edge_url}/"), viewport)
                .await
                .unwrap();
            std::fs::write(
                tmp.path().join(format!("index.{}.png", viewport.as_str())),
                bytes,
            )
            .unwrap();
        }

        let suite = VerificationSuite::new(services);
        let report = suite
            .run(&inventory(), edge_url, tmp.path().to_path_buf())
            .await;

        assert_eq!(report.visual.len(), 3);
        assert!(report
            .visual
            .iter()
            .all(|v| v.status == DiffStatus::Identical));
        assert_eq!(report.functional.len(), 1);
        assert!(report.functional[0].passed);
        assert_eq!(report.performance.len(), 1);
        assert!(report.errors.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn differing_render_is_flagged_by_visual_diff() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pages = HashMap::new();
        pages.insert("https://acme.test/".to_string(), "<html></html>".to_string());
        pages.insert(
            "https://mls-site_a.edge.test/".to_string(),
            "<html></html>".to_string(),
        );
        let services = mock_services(pages, Vec::new());

        for viewport in ViewportKind::ALL {
            std::fs::write(
                tmp.path().join(format!("index.{}.png", viewport.as_str())),
                b"completely different baseline bytes",
            )
            .unwrap();
        }

        let suite = VerificationSuite::new(services);
        let report = suite
            .run(&inventory(), "https://mls-site_a.edge.test", tmp.path().to_path_buf())
            .await;

        assert!(report.visual_failures() > 0);
        assert!(!report.is_clean());
    }
}
