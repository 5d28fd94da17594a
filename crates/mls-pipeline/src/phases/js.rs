use std::collections::{HashMap, HashSet};

use mls_types::BuildPhase;

use crate::context::BuildContext;
use crate::error::PipelineResult;
use crate::fetch::resolve_url;
use crate::phases::crawl::CrawlOutput;

const PHASE: BuildPhase = BuildPhase::Js;

/// Script classes the settings flags can remove outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptClass {
    Emoji,
    BlockLibrary,
    Analytics,
    JQuery,
    Other,
}

pub fn classify_script(src: &str) -> ScriptClass {
    let lowered = src.to_ascii_lowercase();
    if lowered.contains("wp-emoji") {
        ScriptClass::Emoji
    } else if lowered.contains("wp-includes/blocks") || lowered.contains("block-library") {
        ScriptClass::BlockLibrary
    } else if ["googletagmanager", "google-analytics", "gtag/js", "connect.facebook", "hotjar", "clarity.ms"]
        .iter()
        .any(|beacon| lowered.contains(beacon))
    {
        ScriptClass::Analytics
    } else if lowered.contains("jquery") {
        ScriptClass::JQuery
    } else {
        ScriptClass::Other
    }
}

fn local_js_path(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or("script.js");
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    format!("assets/js/{safe}")
}

pub async fn run(ctx: &mut BuildContext, crawl: &CrawlOutput) -> PipelineResult<()> {
    ctx.step_start(PHASE, "removing bloat scripts and minifying the rest");

    let mut removed_total = 0u64;
    let mut original_total = 0u64;
    let mut optimized_total = 0u64;
    // url -> local path for scripts kept and rehosted.
    let mut kept: HashMap<String, String> = HashMap::new();

    for page_index in 0..crawl.inventory.pages.len() {
        let page = &crawl.inventory.pages[page_index];
        if crawl.unchanged.contains(&page.output_path) {
            continue;
        }
        let page_url = page.url.clone();
        let output_path = page.output_path.clone();
        // jQuery-dependent interactions pin every jquery script on the page.
        let jquery_protected = page.interactive.iter().any(|i| i.jquery_dependent);
        let scripts = page.scripts.clone();

        ctx.check_cancelled()?;
        let mut html = ctx.read_output(&output_path, PHASE).await?;
        let depth = output_path.matches('/').count();
        let prefix = "../".repeat(depth);

        for script in &scripts {
            let class = classify_script(&script.src);
            let removable = match class {
                ScriptClass::Emoji => ctx.settings.js.remove_emoji,
                ScriptClass::BlockLibrary => ctx.settings.js.remove_block_library,
                ScriptClass::Analytics => ctx.settings.js.remove_analytics,
                ScriptClass::JQuery => false,
                ScriptClass::Other => false,
            };
            let protected = jquery_protected && class == ScriptClass::JQuery;

            if removable && !protected {
                let before = html.len();
                html = remove_script_tag(&html, &script.src);
                if html.len() != before {
                    removed_total += 1;
                    ctx.log("info", format!("removed script {}", script.src));
                }
                continue;
            }

            let Some(absolute) = resolve_url(&page_url, &script.src) else {
                continue;
            };
            // Third-party scripts stay referenced as-is; same-origin ones are
            // minified and rehosted.
            if !crate::fetch::same_origin(&crawl.inventory.source_url, &absolute) {
                continue;
            }
            let local = if let Some(local) = kept.get(&absolute) {
                local.clone()
            } else {
                let raw = match ctx.fetcher.get_text(&absolute).await {
                    Ok(raw) => raw,
                    Err(err) => {
                        ctx.log("warn", format!("script fetch failed for {absolute}: {err}"));
                        continue;
                    }
                };
                original_total += raw.len() as u64;
                let minified = if ctx.settings.js.minify {
                    ctx.services.js.minify(&raw)
                } else {
                    raw
                };
                optimized_total += minified.len() as u64;
                let local = local_js_path(&absolute);
                ctx.write_output(&local, minified.as_bytes(), PHASE).await?;
                kept.insert(absolute.clone(), local.clone());
                local
            };
            let local_src = format!("{prefix}{local}");
            html = html.replace(&script.src, &local_src);
        }

        if ctx.settings.js.defer {
            html = add_defer_attributes(&html);
        }
        ctx.write_output(&output_path, html.as_bytes(), PHASE).await?;
    }

    ctx.build.scripts_removed += removed_total;
    ctx.build.original_size.js = original_total;
    ctx.build.optimized_size.js = optimized_total;
    ctx.step_complete(
        PHASE,
        serde_json::json!({
            "removed": removed_total,
            "rehosted": kept.len(),
            "originalBytes": original_total,
            "optimizedBytes": optimized_total,
        }),
    );
    Ok(())
}

/// Drops the whole `<script …src="target"…></script>` element.
fn remove_script_tag(html: &str, src: &str) -> String {
    let Some(pos) = html.find(src) else {
        return html.to_string();
    };
    let Some(tag_start) = html[..pos].rfind("<script") else {
        return html.to_string();
    };
    let close = "</script>";
    let tag_end = html[pos..]
        .find(close)
        .map(|e| pos + e + close.len())
        .unwrap_or(html.len());
    let mut out = String::with_capacity(html.len());
    out.push_str(&html[..tag_start]);
    out.push_str(&html[tag_end..]);
    out
}

/// `defer` on external scripts that declare neither `defer` nor `async`.
/// Inline scripts may rely on execution order and are left alone.
fn add_defer_attributes(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find("<script") {
        let tag_end = match rest[start..].find('>') {
            Some(end) => start + end,
            None => break,
        };
        let tag = &rest[start..tag_end];
        out.push_str(&rest[..start]);
        if tag.contains("src=") && !tag.contains("defer") && !tag.contains("async") {
            out.push_str(tag);
            out.push_str(" defer");
        } else {
            out.push_str(tag);
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
    fn classification_matches_known_bloat() {
        assert_eq!(
            classify_script("/wp-includes/js/wp-emoji-release.min.js"),
            ScriptClass::Emoji
        );
        assert_eq!(
            classify_script("https://www.googletagmanager.com/gtag/js?id=G-1"),
            ScriptClass::Analytics
        );
        assert_eq!(
            classify_script("/wp-includes/js/jquery/jquery.min.js"),
            ScriptClass::JQuery
        );
        assert_eq!(classify_script("/themes/acme/app.js"), ScriptClass::Other);
    }

    #[test]
    fn script_removal_takes_the_whole_element() {
        let html = r#"<head><script src="/wp-emoji.js"></script><script src="/keep.js"></script></head>"#;
        let out = remove_script_tag(html, "/wp-emoji.js");
        assert!(!out.contains("wp-emoji"));
        assert!(out.contains("/keep.js"));
    }

    #[test]
    fn defer_added_only_where_safe() {
        let html = r#"<script src="/a.js"></script><script src="/b.js" async></script><script>inline()</script>"#;
        let out = add_defer_attributes(html);
        assert!(out.contains(r#"<script src="/a.js" defer>"#));
        assert!(out.contains(r#"<script src="/b.js" async>"#));
        assert!(!out.contains("inline() defer"));
    }
}
