use std::collections::{HashMap, HashSet};

use regex::Regex;

use mls_types::BuildPhase;

use crate::context::BuildContext;
use crate::error::PipelineResult;
use crate::fetch::resolve_url;
use crate::phases::crawl::CrawlOutput;
use crate::phases::images::ImageRewrite;

const PHASE: BuildPhase = BuildPhase::Html;

/// Platform metadata tags WordPress injects that serve no purpose on a
/// static edge copy.
const METADATA_PATTERNS: [&str; 6] = [
    r#"<link[^>]+rel\s*=\s*["']EditURI["'][^>]*>"#,
    r#"<link[^>]+rel\s*=\s*["']wlwmanifest["'][^>]*>"#,
    r#"<link[^>]+rel\s*=\s*["']shortlink["'][^>]*>"#,
    r#"<link[^>]+rel\s*=\s*["']https://api\.w\.org/["'][^>]*>"#,
    r#"<link[^>]+rel\s*=\s*["']pingback["'][^>]*>"#,
    r#"<meta[^>]+name\s*=\s*["']generator["'][^>]*>"#,
];

/// Embed hosts replaced by click-to-load facades.
const FACADE_HOSTS: [&str; 4] = [
    "youtube.com/embed",
    "youtube-nocookie.com/embed",
    "player.vimeo.com",
    "fast.wistia.net",
];

pub async fn run(ctx: &mut BuildContext, crawl: &CrawlOutput) -> PipelineResult<()> {
    ctx.step_start(PHASE, "stripping metadata and injecting resource hints");

    let mut facades_total = 0u64;
    let mut original_total = 0u64;
    let mut optimized_total = 0u64;
    let image_rewrites = crate::phases::images::load_rewrites(ctx).await;

    for page in &crawl.inventory.pages {
        if crawl.unchanged.contains(&page.output_path) {
            continue;
        }
        ctx.check_cancelled()?;
        let mut html = ctx.read_output(&page.output_path, PHASE).await?;
        original_total += page.html_bytes;

        if ctx.settings.html.strip_platform_metadata {
            html = strip_platform_metadata(&html);
        }
        if ctx.settings.html.embed_facades {
            let (rewritten, count) = apply_embed_facades(&html);
            html = rewritten;
            facades_total += count;
        }
        if ctx.settings.html.resource_hints {
            html = inject_resource_hints(&html, page, &crawl.inventory.source_url, &image_rewrites);
        }

        optimized_total += html.len() as u64;
        ctx.write_output(&page.output_path, html.as_bytes(), PHASE)
            .await?;
        ctx.log("info", format!("rewrote {}", page.output_path));
    }

    ctx.build.iframe_facades_applied += facades_total;
    ctx.build.original_size.html = original_total;
    ctx.build.optimized_size.html = optimized_total;
    ctx.step_complete(
        PHASE,
        serde_json::json!({
            "facades": facades_total,
            "originalBytes": original_total,
            "optimizedBytes": optimized_total,
        }),
    );
    Ok(())
}

fn strip_platform_metadata(html: &str) -> String {
    let mut out = html.to_string();
    for pattern in METADATA_PATTERNS {
        if let Ok(re) = Regex::new(pattern) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    out
}

/// Swaps heavy third-party iframes for a click-to-load facade that keeps the
/// original source in a data attribute.
fn apply_embed_facades(html: &str) -> (String, u64) {
    let Ok(iframe_re) = Regex::new(r#"<iframe[^>]+src\s*=\s*["']([^"']+)["'][^>]*>\s*</iframe>"#)
    else {
        return (html.to_string(), 0);
    };
    let mut count = 0u64;
    let out = iframe_re
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let src = &caps[1];
            if FACADE_HOSTS.iter().any(|host| src.contains(host)) {
                count += 1;
                format!(
                    "<div class=\"embed-facade\" data-embed-src=\"{src}\" role=\"button\" tabindex=\"0\">\
                     <span class=\"embed-facade-play\">▶</span></div>"
                )
            } else {
                caps[0].to_string()
            }
        })
        .into_owned();
    if count == 0 {
        return (out, 0);
    }
    // One loader script per page turns a facade into the real iframe on click.
    let loader = "<script>document.addEventListener('click',function(e){var f=e.target.closest('.embed-facade');if(!f)return;var i=document.createElement('iframe');i.src=f.dataset.embedSrc;i.allowFullscreen=true;f.replaceWith(i);});</script>";
    let out = match out.find("</body>") {
        Some(pos) => {
            let mut s = out.clone();
            s.insert_str(pos, loader);
            s
        }
        None => out,
    };
    (out, count)
}

/// Preload for the LCP image (pointing at its optimized copy when the
/// images phase produced one), preconnect for the first few third-party
/// origins, dns-prefetch for the rest.
fn inject_resource_hints(
    html: &str,
    page: &mls_types::PageEntry,
    source_url: &str,
    image_rewrites: &HashMap<String, ImageRewrite>,
) -> String {
    let mut hints = String::new();

    if let Some(lcp) = page.images.iter().find(|i| i.lcp_candidate) {
        let prefix = "../".repeat(page.output_path.matches('/').count());
        let href = resolve_url(&page.url, &lcp.src)
            .and_then(|absolute| image_rewrites.get(&absolute))
            .map(|rewrite| format!("{prefix}{}", rewrite.primary_local()))
            .unwrap_or_else(|| lcp.src.clone());
        hints.push_str(&format!(
            "<link rel=\"preload\" as=\"image\" href=\"{href}\">"
        ));
    }

    let mut origins: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for reference in page
        .scripts
        .iter()
        .map(|s| s.src.as_str())
        .chain(page.stylesheets.iter().map(|s| s.href.as_str()))
        .chain(page.fonts.iter().map(|f| f.url.as_str()))
    {
        let Some(absolute) = resolve_url(&page.url, reference) else {
            continue;
        };
        if crate::fetch::same_origin(source_url, &absolute) {
            continue;
        }
        if let Ok(parsed) = reqwest::Url::parse(&absolute) {
            if let Some(host) = parsed.host_str() {
                let origin = format!("{}://{}", parsed.scheme(), host);
                if seen.insert(origin.clone()) {
                    origins.push(origin);
                }
            }
        }
    }
    for (index, origin) in origins.iter().enumerate() {
        if index < 3 {
            hints.push_str(&format!(
                "<link rel=\"preconnect\" href=\"{origin}\" crossorigin>"
            ));
        } else {
            hints.push_str(&format!("<link rel=\"dns-prefetch\" href=\"{origin}\">"));
        }
    }

    if hints.is_empty() {
        return html.to_string();
    }
    match html.find("</head>") {
        Some(pos) => {
            let mut out = html.to_string();
            out.insert_str(pos, &hints);
            out
        }
        None => html.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::{ImageRef, PageEntry, ScriptRef};

    fn page_with(images: Vec<ImageRef>, scripts: Vec<ScriptRef>) -> PageEntry {
        PageEntry {
            url: "https://acme.test/".into(),
            output_path: "index.html".into(),
            content_hash: "h".into(),
            html_bytes: 0,
            scripts,
            stylesheets: Vec::new(),
            images,
            fonts: Vec::new(),
            interactive: Vec::new(),
            links: Vec::new(),
        }
    }

    #[test]
    fn platform_metadata_is_stripped() {
        let html = r#"<head><link rel="EditURI" href="/xmlrpc.php?rsd"><link rel="shortlink" href="/?p=1"><meta name="generator" content="WordPress 6.4"><title>x</title></head>"#;
        let out = strip_platform_metadata(html);
        assert!(!out.contains("EditURI"));
        assert!(!out.contains("shortlink"));
        assert!(!out.contains("generator"));
        assert!(out.contains("<title>x</title>"));
    }

    #[test]
    fn youtube_iframes_become_facades() {
        let html = r#"<body><iframe src="https://www.youtube.com/embed/abc123"></iframe><iframe src="https://maps.example/embed"></iframe></body>"#;
        let (out, count) = apply_embed_facades(html);
        assert_eq!(count, 1);
        assert!(out.contains("embed-facade"));
        assert!(out.contains("data-embed-src=\"https://www.youtube.com/embed/abc123\""));
        // Unrelated iframes survive.
        assert!(out.contains("maps.example/embed"));
        assert!(out.contains("</body>"));
    }

    #[test]
    fn resource_hints_cover_lcp_and_third_parties() {
        let page = page_with(
            vec![ImageRef {
                src: "/hero.webp".into(),
                bytes: 0,
                lcp_candidate: true,
            }],
            vec![ScriptRef {
                src: "https://cdn.example/app.js".into(),
                inline: false,
                bytes: 0,
            }],
        );
        let html = "<head><title>x</title></head>";
        let out = inject_resource_hints(html, &page, "https://acme.test/", &HashMap::new());
        assert!(out.contains(r#"rel="preload" as="image" href="/hero.webp""#));
        assert!(out.contains(r#"rel="preconnect" href="https://cdn.example""#));
    }

    #[test]
    fn lcp_preload_uses_optimized_copy_when_available() {
        let page = page_with(
            vec![ImageRef {
                src: "/uploads/hero.jpg".into(),
                bytes: 0,
                lcp_candidate: true,
            }],
            Vec::new(),
        );
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
        let out = inject_resource_hints("<head></head>", &page, "https://acme.test/", &rewrites);
        assert!(out.contains(r#"rel="preload" as="image" href="assets/img/hero.webp""#));
    }
}
