use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use mls_types::{
    BuildPhase, BuildScope, FontRef, ImageRef, InteractiveElement, InteractiveKind, PageEntry,
    ScriptRef, SiteInventory, StylesheetRef, ViewportKind,
};

use crate::context::BuildContext;
use crate::error::{PipelineError, PipelineResult};
use crate::fetch::{output_path_for, page_slug, resolve_url, same_origin};

const PHASE: BuildPhase = BuildPhase::Crawl;

/// Crawl result: the inventory plus the set of pages whose content hash is
/// unchanged since the last successful build (partial scope only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlOutput {
    pub inventory: SiteInventory,
    pub unchanged: HashSet<String>,
}

pub async fn run(ctx: &mut BuildContext) -> PipelineResult<CrawlOutput> {
    ctx.step_start(PHASE, "discovering and rendering pages");

    let source_url = ctx.site.source_url.clone();
    let max_pages = ctx.settings.crawl.max_pages as usize;
    let max_depth = ctx.settings.crawl.max_depth;
    let concurrency = ctx.settings.crawl.concurrency.max(1) as usize;

    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    queue.push_back((source_url.clone(), 0));
    if ctx.settings.crawl.use_sitemap {
        for url in sitemap_urls(ctx, &source_url).await {
            queue.push_back((url, 0));
        }
    }

    let prior_hashes = if ctx.build.scope == BuildScope::Partial {
        ctx.store
            .page_fingerprints(&ctx.site.id)
            .await
            .map_err(|err| PipelineError::from_store(PHASE, "fingerprints", err))?
    } else {
        HashMap::new()
    };
    let prior_build = if ctx.build.scope == BuildScope::Partial {
        ctx.store
            .latest_successful_build(&ctx.site.id)
            .await
            .map_err(|err| PipelineError::from_store(PHASE, "prior-build", err))?
    } else {
        None
    };

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut visited: HashSet<String> = HashSet::new();
    let mut pages: Vec<PageEntry> = Vec::new();
    let mut unchanged: HashSet<String> = HashSet::new();
    let mut attempted = 0usize;

    while !queue.is_empty() && pages.len() < max_pages {
        ctx.check_cancelled()?;

        // Drain one breadth level at a time so depth accounting stays exact.
        let mut batch = Vec::new();
        while let Some((url, depth)) = queue.pop_front() {
            let normalized = normalize_url(&url);
            if !visited.insert(normalized.clone()) {
                continue;
            }
            if !same_origin(&source_url, &normalized) {
                continue;
            }
            batch.push((normalized, depth));
            if batch.len() + pages.len() >= max_pages {
                break;
            }
        }
        if batch.is_empty() {
            break;
        }

        let mut futures = FuturesUnordered::new();
        for (url, depth) in batch {
            let permit = semaphore.clone();
            let browser = ctx.services.browser.clone();
            futures.push(async move {
                let _permit = permit.acquire().await;
                let rendered = browser.render(&url, ViewportKind::Desktop).await;
                (url, depth, rendered)
            });
        }

        let mut discovered: Vec<(String, u32)> = Vec::new();
        while let Some((url, depth, rendered)) = futures.next().await {
            attempted += 1;
            let html = match rendered {
                Ok(page) => page.html,
                Err(err) => {
                    ctx.log("warn", format!("crawl skipped {url}: {err}"));
                    continue;
                }
            };

            let entry = extract_page(&url, &html);
            let output_path = entry.output_path.clone();

            if depth < max_depth {
                for link in &entry.links {
                    if let Some(absolute) = resolve_url(&url, link) {
                        if same_origin(&source_url, &absolute) {
                            discovered.push((absolute, depth + 1));
                        }
                    }
                }
            }

            // Raw HTML lands first either way, so a page whose carry-forward
            // copy fails still rebuilds from a real file.
            ctx.write_output(&output_path, html.as_bytes(), PHASE).await?;

            let prior_hash = prior_hashes.get(&output_path);
            if prior_hash == Some(&entry.content_hash) && prior_build.is_some() {
                unchanged.insert(output_path.clone());
                ctx.log("info", format!("unchanged since last build: {output_path}"));
                pages.push(entry);
                continue;
            }

            capture_baselines(ctx, &url, &output_path).await;
            ctx.log("info", format!("crawled {url} -> {output_path}"));
            pages.push(entry);
        }

        for item in discovered {
            queue.push_back(item);
        }
    }

    if pages.is_empty() {
        return Err(PipelineError::fatal(
            PHASE,
            "no-pages",
            format!("crawl of {source_url} reached zero pages (attempted {attempted})"),
        ));
    }

    // Copy prior optimized outputs forward for unchanged pages; later phases
    // skip them entirely. A failed copy drops the page back into the rebuild
    // set, where its freshly rendered HTML is already in place.
    let mut carried: HashSet<String> = HashSet::new();
    if let Some(prior) = &prior_build {
        for path in &unchanged {
            let from = ctx.paths.build_output_dir(&prior.id).join(path);
            let to = ctx.output_path(path);
            if let Some(parent) = to.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            match tokio::fs::copy(&from, &to).await {
                Ok(_) => {
                    carried.insert(path.clone());
                }
                Err(err) => {
                    ctx.log(
                        "warn",
                        format!("carry-forward failed for {path}: {err}; page will rebuild"),
                    );
                }
            }
        }
    }

    let fingerprint = detect_fingerprint(&pages);
    let inventory = SiteInventory {
        site_id: ctx.site.id.clone(),
        source_url,
        pages,
        fingerprint,
        crawled_at: Utc::now(),
    };

    let hashes: HashMap<String, String> = inventory
        .pages
        .iter()
        .map(|p| (p.output_path.clone(), p.content_hash.clone()))
        .collect();
    ctx.store
        .replace_page_fingerprints(&ctx.site.id, &hashes)
        .await
        .map_err(|err| PipelineError::from_store(PHASE, "fingerprints", err))?;

    let output = CrawlOutput {
        inventory,
        unchanged: carried,
    };
    persist(ctx, &output).await?;

    ctx.build.pages_total = output.inventory.pages.len() as u64;
    ctx.step_complete(
        PHASE,
        serde_json::json!({
            "pages": output.inventory.pages.len(),
            "unchanged": output.unchanged.len(),
        }),
    );
    Ok(output)
}

/// Re-reads a persisted crawl result; used when a retry re-enters after the
/// crawl phase.
pub async fn load_persisted(ctx: &BuildContext) -> PipelineResult<CrawlOutput> {
    let raw = tokio::fs::read_to_string(ctx.paths.inventory_path(&ctx.build.id))
        .await
        .map_err(|err| PipelineError::from_io(PHASE, "inventory", err))?;
    let inventory: SiteInventory = serde_json::from_str(&raw)
        .map_err(|err| PipelineError::fatal(PHASE, "inventory", err.to_string()))?;
    let unchanged = match tokio::fs::read_to_string(ctx.paths.unchanged_pages_path(&ctx.build.id))
        .await
    {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|err| PipelineError::fatal(PHASE, "unchanged", err.to_string()))?,
        Err(_) => HashSet::new(),
    };
    Ok(CrawlOutput {
        inventory,
        unchanged,
    })
}

async fn persist(ctx: &BuildContext, output: &CrawlOutput) -> PipelineResult<()> {
    let inventory = serde_json::to_vec_pretty(&output.inventory)
        .map_err(|err| PipelineError::fatal(PHASE, "inventory", err.to_string()))?;
    tokio::fs::write(ctx.paths.inventory_path(&ctx.build.id), inventory)
        .await
        .map_err(|err| PipelineError::from_io(PHASE, "inventory", err))?;
    let unchanged = serde_json::to_vec(&output.unchanged)
        .map_err(|err| PipelineError::fatal(PHASE, "unchanged", err.to_string()))?;
    tokio::fs::write(ctx.paths.unchanged_pages_path(&ctx.build.id), unchanged)
        .await
        .map_err(|err| PipelineError::from_io(PHASE, "unchanged", err))?;
    Ok(())
}

/// Baseline screenshots per viewport; failures are logged and skipped.
async fn capture_baselines(ctx: &mut BuildContext, url: &str, output_path: &str) {
    let slug = page_slug(output_path);
    for viewport in ViewportKind::ALL {
        match ctx.services.browser.screenshot(url, viewport).await {
            Ok(bytes) => {
                let file = ctx
                    .paths
                    .build_screenshots_dir(&ctx.build.id)
                    .join(format!("{slug}.{}.png", viewport.as_str()));
                if let Err(err) = tokio::fs::write(&file, &bytes).await {
                    ctx.log("warn", format!("baseline write failed for {url}: {err}"));
                }
            }
            Err(err) => {
                ctx.log(
                    "warn",
                    format!("baseline screenshot failed for {url} ({}): {err}", viewport.as_str()),
                );
            }
        }
    }
}

fn normalize_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    without_query.to_string()
}

async fn sitemap_urls(ctx: &mut BuildContext, source_url: &str) -> Vec<String> {
    let Some(sitemap) = resolve_url(source_url, "/sitemap.xml") else {
        return Vec::new();
    };
    match ctx.fetcher.get_text(&sitemap).await {
        Ok(body) => {
            let loc = Regex::new(r"<loc>\s*([^<]+?)\s*</loc>");
            match loc {
                Ok(loc) => loc
                    .captures_iter(&body)
                    .map(|c| c[1].to_string())
                    .collect(),
                Err(_) => Vec::new(),
            }
        }
        Err(err) => {
            ctx.log("info", format!("no sitemap at {sitemap}: {err}"));
            Vec::new()
        }
    }
}

fn content_hash(html: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(html.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn attr_values(html: &str, pattern: &str) -> Vec<String> {
    Regex::new(pattern)
        .map(|re| re.captures_iter(html).map(|c| c[1].to_string()).collect())
        .unwrap_or_default()
}

pub(crate) fn extract_page(url: &str, html: &str) -> PageEntry {
    let links = attr_values(html, r#"<a[^>]+href\s*=\s*["']([^"'#]+)["']"#);
    let script_srcs = attr_values(html, r#"<script[^>]+src\s*=\s*["']([^"']+)["']"#);
    let stylesheet_hrefs = attr_values(
        html,
        r#"<link[^>]+rel\s*=\s*["']stylesheet["'][^>]*href\s*=\s*["']([^"']+)["']"#,
    )
    .into_iter()
    .chain(attr_values(
        html,
        r#"<link[^>]+href\s*=\s*["']([^"']+\.css[^"']*)["'][^>]*rel\s*=\s*["']stylesheet["']"#,
    ))
    .collect::<Vec<_>>();
    let image_srcs = attr_values(html, r#"<img[^>]+src\s*=\s*["']([^"']+)["']"#);
    let font_urls = attr_values(
        html,
        r#"<link[^>]+href\s*=\s*["']([^"']*fonts\.googleapis\.com[^"']*)["']"#,
    );

    let has_jquery = html.contains("jquery");

    let mut interactive = detect_interactive(html, has_jquery);
    interactive.dedup_by(|a, b| a.selector == b.selector && a.kind == b.kind);

    // LCP heuristic: the first sizable image reference in document order.
    let images: Vec<ImageRef> = image_srcs
        .into_iter()
        .enumerate()
        .map(|(index, src)| ImageRef {
            src,
            bytes: 0,
            lcp_candidate: index == 0,
        })
        .collect();

    PageEntry {
        url: url.to_string(),
        output_path: output_path_for(url),
        content_hash: content_hash(html),
        html_bytes: html.len() as u64,
        scripts: script_srcs
            .into_iter()
            .map(|src| ScriptRef {
                src,
                inline: false,
                bytes: 0,
            })
            .collect(),
        stylesheets: stylesheet_hrefs
            .into_iter()
            .map(|href| StylesheetRef { href, bytes: 0 })
            .collect(),
        images,
        fonts: font_urls
            .into_iter()
            .map(|url| FontRef { url, family: None })
            .collect(),
        interactive,
        links,
    }
}

fn detect_interactive(html: &str, has_jquery: bool) -> Vec<InteractiveElement> {
    let mut out = Vec::new();
    let class_re = match Regex::new(r#"class\s*=\s*["']([^"']*)["']"#) {
        Ok(re) => re,
        Err(_) => return out,
    };
    for caps in class_re.captures_iter(html) {
        let classes = &caps[1];
        for class in classes.split_whitespace() {
            let lowered = class.to_ascii_lowercase();
            let detection = if ["swiper", "slick", "carousel", "slider"]
                .iter()
                .any(|t| lowered.contains(t))
            {
                Some((InteractiveKind::Slider, "click", has_jquery))
            } else if ["accordion", "collapse", "toggle"]
                .iter()
                .any(|t| lowered.contains(t))
            {
                Some((InteractiveKind::Accordion, "click", has_jquery))
            } else if lowered.contains("dropdown") || lowered.contains("menu-item-has-children") {
                Some((InteractiveKind::Dropdown, "hover", false))
            } else {
                None
            };
            if let Some((kind, action, jquery_dependent)) = detection {
                out.push(InteractiveElement {
                    kind,
                    selector: format!(".{class}"),
                    action: action.to_string(),
                    jquery_dependent,
                });
                break;
            }
        }
    }
    if html.contains("<form") {
        out.push(InteractiveElement {
            kind: InteractiveKind::Form,
            selector: "form".to_string(),
            action: "focus".to_string(),
            jquery_dependent: false,
        });
    }
    if html.contains("<video") || html.contains("youtube.com/embed") {
        out.push(InteractiveElement {
            kind: InteractiveKind::Video,
            selector: "video, iframe[src*='youtube']".to_string(),
            action: "click".to_string(),
            jquery_dependent: false,
        });
    }
    out
}

const FINGERPRINT_TOKENS: [(&str, &str); 7] = [
    ("elementor", "plugin:elementor"),
    ("et_pb_", "theme:divi"),
    ("vc_row", "plugin:wpbakery"),
    ("fl-builder", "plugin:beaver-builder"),
    ("astra", "theme:astra"),
    ("oceanwp", "theme:oceanwp"),
    ("woocommerce", "plugin:woocommerce"),
];

fn detect_fingerprint(pages: &[PageEntry]) -> Vec<String> {
    // Class-name scanning happened during extraction; here we only need the
    // page URLs and stored selectors, so reuse the interactive selectors and
    // stylesheet hrefs as the token corpus.
    let mut tokens: HashSet<String> = HashSet::new();
    for page in pages {
        let corpus = page
            .stylesheets
            .iter()
            .map(|s| s.href.as_str())
            .chain(page.scripts.iter().map(|s| s.src.as_str()))
            .chain(page.interactive.iter().map(|i| i.selector.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        for (needle, tag) in FINGERPRINT_TOKENS {
            if corpus.contains(needle) {
                tokens.insert(tag.to_string());
            }
        }
    }
    let mut out: Vec<String> = tokens.into_iter().collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <html><head>
            <link rel="stylesheet" href="/wp-content/themes/astra/style.css">
            <script src="/wp-includes/js/jquery/jquery.min.js"></script>
        </head><body>
            <a href="/about/">About</a>
            <a href="https://other.test/external">External</a>
            <img src="/wp-content/uploads/hero.jpg">
            <img src="/wp-content/uploads/small.png">
            <div class="swiper-container"></div>
            <form action="/contact"></form>
        </body></html>"#;

    #[test]
    fn extraction_collects_assets_links_and_interactions() {
        let entry = extract_page("https://acme.test/", SAMPLE);
        assert_eq!(entry.output_path, "index.html");
        assert_eq!(entry.links.len(), 2);
        assert_eq!(entry.stylesheets.len(), 1);
        assert_eq!(entry.scripts.len(), 1);
        assert_eq!(entry.images.len(), 2);
        assert!(entry.images[0].lcp_candidate);
        assert!(!entry.images[1].lcp_candidate);
        let kinds: Vec<InteractiveKind> = entry.interactive.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&InteractiveKind::Slider));
        assert!(kinds.contains(&InteractiveKind::Form));
        // jQuery present, so the slider replay must protect jquery scripts.
        assert!(entry
            .interactive
            .iter()
            .any(|i| i.kind == InteractiveKind::Slider && i.jquery_dependent));
    }

    #[test]
    fn hash_is_stable_for_identical_content() {
        let a = extract_page("https://acme.test/", SAMPLE);
        let b = extract_page("https://acme.test/", SAMPLE);
        assert_eq!(a.content_hash, b.content_hash);
        let c = extract_page("https://acme.test/", "<html>changed</html>");
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn fingerprint_detects_theme_tokens() {
        let entry = extract_page("https://acme.test/", SAMPLE);
        let tokens = detect_fingerprint(std::slice::from_ref(&entry));
        assert!(tokens.contains(&"theme:astra".to_string()));
    }
}
