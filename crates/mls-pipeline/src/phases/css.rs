use std::collections::{HashMap, HashSet};

use regex::Regex;

use mls_adapters::Safelist;
use mls_types::{BuildPhase, PurgeAggressiveness};

use crate::context::BuildContext;
use crate::error::PipelineResult;
use crate::fetch::resolve_url;
use crate::phases::crawl::CrawlOutput;
use crate::phases::images::ImageRewrite;

const PHASE: BuildPhase = BuildPhase::Css;

/// Critical-CSS budget: the leading slice of the purged sheet inlined into
/// the head.
const CRITICAL_BUDGET_BYTES: usize = 14 * 1024;

/// Theme and plugin prefixes preserved whenever the fingerprint names them.
const FINGERPRINT_SAFELIST: [(&str, &[&str]); 5] = [
    ("plugin:elementor", &["elementor-", "e-con"]),
    ("theme:divi", &["et_pb_", "et-"]),
    ("plugin:wpbakery", &["vc_", "wpb_"]),
    ("plugin:beaver-builder", &["fl-"]),
    ("plugin:woocommerce", &["woocommerce", "wc-"]),
];

pub fn safelist_for(settings: &mls_types::CssSettings, fingerprint: &[String]) -> Safelist {
    let mut safelist = Safelist {
        exact: settings.purge_safelist.standard.iter().cloned().collect(),
        prefixes: settings.purge_safelist.prefixes.clone(),
    };
    for (token, prefixes) in FINGERPRINT_SAFELIST {
        if fingerprint.iter().any(|f| f == token) {
            safelist
                .prefixes
                .extend(prefixes.iter().map(|p| p.to_string()));
        }
    }
    // Interaction state classes toggled at runtime never show up in static
    // HTML, so they are always preserved.
    for runtime_class in ["active", "open", "show", "visible", "is-", "has-"] {
        safelist.prefixes.push(runtime_class.to_string());
    }
    safelist
}

fn local_css_path(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or("style.css");
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    format!("assets/css/{safe}")
}

pub async fn run(ctx: &mut BuildContext, crawl: &CrawlOutput) -> PipelineResult<()> {
    ctx.step_start(PHASE, "tree-shaking and minifying stylesheets");

    let aggressiveness = effective_aggressiveness(ctx, crawl);
    let safelist = safelist_for(&ctx.settings.css, &crawl.inventory.fingerprint);
    let image_rewrites = crate::phases::images::load_rewrites(ctx).await;

    // Combined HTML corpus from every changed page.
    let mut corpus: Vec<String> = Vec::new();
    for page in &crawl.inventory.pages {
        if crawl.unchanged.contains(&page.output_path) {
            continue;
        }
        corpus.push(ctx.read_output(&page.output_path, PHASE).await?);
    }
    let corpus_refs: Vec<&str> = corpus.iter().map(String::as_str).collect();

    // Unique stylesheets across changed pages.
    let mut seen: HashSet<String> = HashSet::new();
    let mut sheets: Vec<String> = Vec::new();
    for page in &crawl.inventory.pages {
        if crawl.unchanged.contains(&page.output_path) {
            continue;
        }
        for sheet in &page.stylesheets {
            if let Some(absolute) = resolve_url(&page.url, &sheet.href) {
                if seen.insert(absolute.clone()) {
                    sheets.push(absolute);
                }
            }
        }
    }

    let mut rewrites: HashMap<String, (String, String)> = HashMap::new();
    let mut original_total = 0u64;
    let mut optimized_total = 0u64;

    for url in sheets {
        ctx.check_cancelled()?;
        let raw = match ctx.fetcher.get_text(&url).await {
            Ok(raw) => raw,
            Err(err) => {
                ctx.log("warn", format!("stylesheet fetch failed for {url}: {err}"));
                continue;
            }
        };
        original_total += raw.len() as u64;

        let purged = ctx
            .services
            .css
            .purge(&raw, &corpus_refs, &safelist, aggressiveness);
        let minified = if ctx.settings.css.minify {
            ctx.services.css.minify(&purged)
        } else {
            purged
        };
        // Background images point at the optimized copies, same map the
        // html rewrite used.
        let minified = rewrite_css_image_urls(&minified, &url, &image_rewrites);
        optimized_total += minified.len() as u64;

        let local = local_css_path(&url);
        ctx.write_output(&local, minified.as_bytes(), PHASE).await?;
        ctx.log(
            "info",
            format!("stylesheet {url}: {} -> {} bytes", raw.len(), minified.len()),
        );

        let critical = if ctx.settings.css.inline_critical {
            critical_slice(&minified)
        } else {
            String::new()
        };
        rewrites.insert(url, (local, critical));
    }

    rewrite_pages(ctx, crawl, &rewrites).await?;

    ctx.build.original_size.css = original_total;
    ctx.build.optimized_size.css = optimized_total;
    ctx.step_complete(
        PHASE,
        serde_json::json!({
            "stylesheets": rewrites.len(),
            "aggressiveness": aggressiveness,
            "originalBytes": original_total,
            "optimizedBytes": optimized_total,
        }),
    );
    Ok(())
}

/// Rewrites `url(...)` references (background images and friends) whose
/// resolved target was optimized by the images phase. Local paths are
/// root-absolute so they work from any stylesheet location on the edge.
fn rewrite_css_image_urls(
    css: &str,
    sheet_url: &str,
    rewrites: &HashMap<String, ImageRewrite>,
) -> String {
    if rewrites.is_empty() {
        return css.to_string();
    }
    let Ok(url_re) = Regex::new(r#"url\(\s*["']?([^"')]+)["']?\s*\)"#) else {
        return css.to_string();
    };
    url_re
        .replace_all(css, |caps: &regex::Captures<'_>| {
            let reference = &caps[1];
            if reference.starts_with("data:") {
                return caps[0].to_string();
            }
            match resolve_url(sheet_url, reference)
                .and_then(|absolute| rewrites.get(&absolute))
            {
                Some(rewrite) => format!("url(/{})", rewrite.primary_local()),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// The resolver's safe floor for page-builder sites.
fn effective_aggressiveness(ctx: &BuildContext, crawl: &CrawlOutput) -> PurgeAggressiveness {
    let mut settings = ctx.settings.clone();
    mls_settings::enforce_page_builder_floor(&mut settings, crawl.inventory.is_page_builder());
    settings.css.purge_aggressiveness
}

fn critical_slice(css: &str) -> String {
    if css.len() <= CRITICAL_BUDGET_BYTES {
        return css.to_string();
    }
    // Cut at a rule boundary inside the budget.
    match css[..CRITICAL_BUDGET_BYTES].rfind('}') {
        Some(end) => css[..=end].to_string(),
        None => String::new(),
    }
}

async fn rewrite_pages(
    ctx: &mut BuildContext,
    crawl: &CrawlOutput,
    rewrites: &HashMap<String, (String, String)>,
) -> PipelineResult<()> {
    for page in &crawl.inventory.pages {
        if crawl.unchanged.contains(&page.output_path) {
            continue;
        }
        let mut html = ctx.read_output(&page.output_path, PHASE).await?;
        let depth = page.output_path.matches('/').count();
        let prefix = "../".repeat(depth);
        let mut inlined = String::new();

        for sheet in &page.stylesheets {
            let Some(absolute) = resolve_url(&page.url, &sheet.href) else {
                continue;
            };
            let Some((local, critical)) = rewrites.get(&absolute) else {
                continue;
            };
            let local_href = format!("{prefix}{local}");
            if ctx.settings.css.defer_non_critical && !critical.is_empty() {
                // Deferred stylesheet swap-in; critical rules go inline.
                let deferred = format!(
                    "<link rel=\"preload\" href=\"{local_href}\" as=\"style\" onload=\"this.onload=null;this.rel='stylesheet'\"><noscript><link rel=\"stylesheet\" href=\"{local_href}\"></noscript>"
                );
                html = replace_stylesheet_link(&html, &sheet.href, &deferred);
                if inlined.len() < CRITICAL_BUDGET_BYTES {
                    inlined.push_str(critical);
                }
            } else {
                let direct = format!("<link rel=\"stylesheet\" href=\"{local_href}\">");
                html = replace_stylesheet_link(&html, &sheet.href, &direct);
            }
        }

        if !inlined.is_empty() {
            let style_block = format!("<style id=\"critical-css\">{inlined}</style>");
            if let Some(head_end) = html.find("</head>") {
                html.insert_str(head_end, &style_block);
            }
        }
        ctx.write_output(&page.output_path, html.as_bytes(), PHASE)
            .await?;
    }
    Ok(())
}

/// Replaces the whole `<link …href="target"…>` tag with `replacement`.
fn replace_stylesheet_link(html: &str, href: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(pos) = rest.find(href) {
        let tag_start = rest[..pos].rfind('<').unwrap_or(0);
        let tag_end = rest[pos..]
            .find('>')
            .map(|e| pos + e + 1)
            .unwrap_or(rest.len());
        if rest[tag_start..].starts_with("<link") {
            out.push_str(&rest[..tag_start]);
            out.push_str(replacement);
        } else {
            out.push_str(&rest[..tag_end]);
        }
        rest = &rest[tag_end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_extends_the_safelist() {
        let settings = mls_types::CssSettings::default();
        let safelist = safelist_for(&settings, &["plugin:elementor".to_string()]);
        assert!(safelist.prefixes.iter().any(|p| p == "elementor-"));
        assert!(safelist.prefixes.iter().any(|p| p == "active"));
    }

    #[test]
    fn critical_slice_cuts_on_rule_boundaries() {
        let css = ".a{color:red}".repeat(2000);
        let slice = critical_slice(&css);
        assert!(slice.len() <= CRITICAL_BUDGET_BYTES);
        assert!(slice.ends_with('}'));

        let small = ".a{color:red}";
        assert_eq!(critical_slice(small), small);
    }

    #[test]
    fn background_image_urls_point_at_optimized_copies() {
        let mut rewrites = HashMap::new();
        rewrites.insert(
            "https://acme.test/uploads/hero.jpg".to_string(),
            ImageRewrite::Variants {
                modern: "assets/img/hero.webp".to_string(),
                fallback: "assets/img/hero.jpeg".to_string(),
                thumbnail: "assets/img/hero.thumb.webp".to_string(),
                modern_format: "webp".to_string(),
            },
        );
        let css = ".hero{background-image:url('../uploads/hero.jpg')}\
                   .badge{background:url(data:image/png;base64,AAAA)}\
                   .other{background:url(/uploads/untouched.png)}";
        let out = rewrite_css_image_urls(css, "https://acme.test/themes/style.css", &rewrites);
        assert!(out.contains("url(/assets/img/hero.webp)"));
        // Data URIs and unknown targets are left alone.
        assert!(out.contains("url(data:image/png;base64,AAAA)"));
        assert!(out.contains("url(/uploads/untouched.png)"));
    }

    #[test]
    fn link_replacement_swaps_the_whole_tag() {
        let html = r#"<head><link rel="stylesheet" href="/style.css"><script src="x.js"></script></head>"#;
        let out = replace_stylesheet_link(html, "/style.css", "<link rel=\"stylesheet\" href=\"assets/css/style.css\">");
        assert!(!out.contains("/style.css\">\n"));
        assert!(out.contains("assets/css/style.css"));
        assert!(out.contains("x.js"));
    }
}
