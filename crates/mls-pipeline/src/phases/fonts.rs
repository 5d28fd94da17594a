use std::collections::{HashMap, HashSet};

use regex::Regex;

use mls_types::BuildPhase;

use crate::context::BuildContext;
use crate::error::PipelineResult;
use crate::phases::crawl::CrawlOutput;

const PHASE: BuildPhase = BuildPhase::Fonts;

pub async fn run(ctx: &mut BuildContext, crawl: &CrawlOutput) -> PipelineResult<()> {
    ctx.step_start(PHASE, "self-hosting external fonts");
    if !ctx.settings.fonts.self_host {
        ctx.log("info", "font self-hosting disabled by settings");
        ctx.step_complete(PHASE, serde_json::json!({"skipped": true}));
        return Ok(());
    }

    // Unique provider stylesheet URLs across changed pages.
    let mut seen: HashSet<String> = HashSet::new();
    let mut provider_sheets: Vec<String> = Vec::new();
    for page in &crawl.inventory.pages {
        if crawl.unchanged.contains(&page.output_path) {
            continue;
        }
        for font in &page.fonts {
            if let Some(absolute) = crate::fetch::resolve_url(&page.url, &font.url) {
                if seen.insert(absolute.clone()) {
                    provider_sheets.push(absolute);
                }
            }
        }
    }

    let display = ctx.settings.fonts.display.as_css();
    let mut rewrites: HashMap<String, String> = HashMap::new();
    let mut first_font_file: Option<String> = None;
    let mut total_bytes = 0u64;

    for (index, sheet_url) in provider_sheets.iter().enumerate() {
        ctx.check_cancelled()?;
        let css = match ctx.fetcher.get_text(sheet_url).await {
            Ok(css) => css,
            Err(err) => {
                ctx.log("warn", format!("font stylesheet fetch failed for {sheet_url}: {err}"));
                continue;
            }
        };

        let (localized_css, files) = localize_font_css(&css, index, display);
        for (file_name, remote_url) in files {
            match ctx.fetcher.get_bytes(&remote_url).await {
                Ok(bytes) => {
                    total_bytes += bytes.len() as u64;
                    let relative = format!("fonts/{file_name}");
                    ctx.write_output(&relative, &bytes, PHASE).await?;
                    if first_font_file.is_none() {
                        first_font_file = Some(relative.clone());
                    }
                    ctx.log("info", format!("downloaded font {remote_url} -> {relative}"));
                }
                Err(err) => {
                    ctx.log("warn", format!("font download failed for {remote_url}: {err}"));
                }
            }
        }

        let local_sheet = format!("fonts/provider-{index}.css");
        ctx.write_output(&local_sheet, localized_css.as_bytes(), PHASE)
            .await?;
        rewrites.insert(sheet_url.clone(), local_sheet);
    }

    rewrite_pages(ctx, crawl, &rewrites, first_font_file.as_deref()).await?;

    ctx.build.original_size.fonts = total_bytes;
    ctx.build.optimized_size.fonts = total_bytes;
    ctx.step_complete(
        PHASE,
        serde_json::json!({
            "providerSheets": rewrites.len(),
            "fontBytes": total_bytes,
        }),
    );
    Ok(())
}

/// Rewrites `url(...)` references in a provider stylesheet to local `/fonts/`
/// paths and forces the configured `font-display`. Returns the rewritten CSS
/// plus `(local file name, remote URL)` downloads.
fn localize_font_css(css: &str, sheet_index: usize, display: &str) -> (String, Vec<(String, String)>) {
    let Ok(url_re) = Regex::new(r#"url\(\s*["']?([^"')]+)["']?\s*\)"#) else {
        return (css.to_string(), Vec::new());
    };
    let mut files = Vec::new();
    let mut counter = 0usize;
    let rewritten = url_re
        .replace_all(css, |caps: &regex::Captures<'_>| {
            let remote = caps[1].to_string();
            let extension = remote
                .rsplit('.')
                .next()
                .filter(|e| e.len() <= 5)
                .unwrap_or("woff2");
            let file_name = format!("font-{sheet_index}-{counter}.{extension}");
            counter += 1;
            let local = format!("url(./{file_name})");
            files.push((file_name, remote));
            local
        })
        .into_owned();

    // Force font-display on every @font-face block.
    let with_display = if rewritten.contains("font-display") {
        let Ok(display_re) = Regex::new(r"font-display\s*:\s*[a-z]+") else {
            return (rewritten, files);
        };
        display_re
            .replace_all(&rewritten, format!("font-display:{display}").as_str())
            .into_owned()
    } else {
        rewritten.replace(
            "@font-face{",
            &format!("@font-face{{font-display:{display};"),
        )
        .replace(
            "@font-face {",
            &format!("@font-face {{font-display:{display};"),
        )
    };
    (with_display, files)
}

async fn rewrite_pages(
    ctx: &mut BuildContext,
    crawl: &CrawlOutput,
    rewrites: &HashMap<String, String>,
    preload_font: Option<&str>,
) -> PipelineResult<()> {
    if rewrites.is_empty() {
        return Ok(());
    }
    for page in &crawl.inventory.pages {
        if crawl.unchanged.contains(&page.output_path) {
            continue;
        }
        let mut html = ctx.read_output(&page.output_path, PHASE).await?;
        let depth = page.output_path.matches('/').count();
        let prefix = "../".repeat(depth);

        for font in &page.fonts {
            let Some(absolute) = crate::fetch::resolve_url(&page.url, &font.url) else {
                continue;
            };
            if let Some(local) = rewrites.get(&absolute) {
                html = html.replace(&font.url, &format!("{prefix}{local}"));
            }
        }

        if ctx.settings.fonts.preload_above_fold {
            if let Some(font_path) = preload_font {
                let preload = format!(
                    "<link rel=\"preload\" as=\"font\" type=\"font/woff2\" href=\"{prefix}{font_path}\" crossorigin>"
                );
                if let Some(pos) = html.find("</head>") {
                    html.insert_str(pos, &preload);
                }
            }
        }
        ctx.write_output(&page.output_path, html.as_bytes(), PHASE)
            .await?;
    }
    Ok(())
}
