use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use mls_adapters::TranscodeRequest;
use mls_types::{AssetClass, BuildPhase, ImageRef};

use crate::context::BuildContext;
use crate::error::PipelineResult;
use crate::fetch::resolve_url;
use crate::phases::crawl::CrawlOutput;

const PHASE: BuildPhase = BuildPhase::Images;

const BITMAP_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Width descriptors advertised in the generated `srcset`; the thumbnail is
/// resized to 320 px, the full variant keeps the source width.
const THUMB_WIDTH: u32 = 320;
const FULL_WIDTH: u32 = 1280;

/// How one source image ended up on disk. Persisted beside the inventory so
/// the css phase (and a resumed build) can rewrite references from the same
/// map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRewrite {
    /// Below threshold or not a bitmap: copied through under one local name.
    Copy { local: String },
    /// Transcoded into modern + legacy fallback + thumbnail variants.
    Variants {
        modern: String,
        fallback: String,
        thumbnail: String,
        modern_format: String,
    },
}

impl ImageRewrite {
    /// The path CSS `url()` references point at; HTML gets the full
    /// `<picture>` treatment instead.
    pub fn primary_local(&self) -> &str {
        match self {
            ImageRewrite::Copy { local } => local,
            ImageRewrite::Variants { modern, .. } => modern,
        }
    }
}

struct ImageOutcome {
    original_bytes: u64,
    optimized_bytes: u64,
    rewrite: Option<(String, ImageRewrite)>,
    note: Option<String>,
}

pub async fn run(ctx: &mut BuildContext, crawl: &CrawlOutput) -> PipelineResult<()> {
    ctx.step_start(PHASE, "transcoding images to modern formats");
    if !ctx.settings.images.enabled {
        ctx.log("info", "image optimization disabled by settings");
        ctx.step_complete(PHASE, serde_json::json!({"skipped": true}));
        return Ok(());
    }

    // Unique images across changed pages only.
    let mut seen: HashSet<String> = HashSet::new();
    let mut work: Vec<(String, ImageRef)> = Vec::new();
    for page in &crawl.inventory.pages {
        if crawl.unchanged.contains(&page.output_path) {
            continue;
        }
        for image in &page.images {
            if let Some(absolute) = resolve_url(&page.url, &image.src) {
                if seen.insert(absolute.clone()) {
                    work.push((absolute, image.clone()));
                }
            }
        }
    }

    let pool = Arc::new(Semaphore::new(ctx.limits.asset_pool_size));
    let mut futures = FuturesUnordered::new();
    for (absolute, image) in work {
        ctx.check_cancelled()?;
        let pool = pool.clone();
        let fetcher = ctx.fetcher.clone();
        let codec = ctx.services.codec.clone();
        let resolver = ctx.resolver.clone();
        let site_id = ctx.site.id.clone();
        futures.push(async move {
            let _permit = pool.acquire().await;
            process_image(fetcher, codec, resolver, site_id, absolute, image).await
        });
    }

    let mut rewrites: HashMap<String, ImageRewrite> = HashMap::new();
    let mut original_total = 0u64;
    let mut optimized_total = 0u64;
    let mut produced: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(outcome) = futures.next().await {
        match outcome {
            Ok((result, files)) => {
                original_total += result.original_bytes;
                optimized_total += result.optimized_bytes;
                if let Some((from, to)) = result.rewrite {
                    rewrites.insert(from, to);
                }
                if let Some(note) = result.note {
                    ctx.log("info", note);
                }
                produced.extend(files);
            }
            Err(warning) => ctx.log("warn", warning),
        }
    }
    drop(futures);

    for (relative, bytes) in produced {
        ctx.write_output(&relative, &bytes, PHASE).await?;
    }

    persist_rewrites(ctx, &rewrites).await?;
    rewrite_references(ctx, crawl, &rewrites).await?;

    ctx.build.original_size.images = original_total;
    ctx.build.optimized_size.images = optimized_total;
    ctx.step_complete(
        PHASE,
        serde_json::json!({
            "images": rewrites.len(),
            "originalBytes": original_total,
            "optimizedBytes": optimized_total,
        }),
    );
    Ok(())
}

async fn persist_rewrites(
    ctx: &BuildContext,
    rewrites: &HashMap<String, ImageRewrite>,
) -> PipelineResult<()> {
    let raw = serde_json::to_vec_pretty(rewrites)
        .map_err(|err| crate::error::PipelineError::fatal(PHASE, "rewrites", err.to_string()))?;
    tokio::fs::write(ctx.paths.image_rewrites_path(&ctx.build.id), raw)
        .await
        .map_err(|err| crate::error::PipelineError::from_io(PHASE, "rewrites", err))
}

/// The persisted rewrite map, for the css phase and for resumed builds. A
/// missing file (images disabled, or nothing rewritten) is an empty map.
pub async fn load_rewrites(ctx: &BuildContext) -> HashMap<String, ImageRewrite> {
    match tokio::fs::read_to_string(ctx.paths.image_rewrites_path(&ctx.build.id)).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('.')
        .next()
        .filter(|ext| ext.len() <= 4)
        .map(|ext| ext.to_ascii_lowercase())
}

fn local_image_path(url: &str, extension: &str, suffix: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let stem = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.').map(|(stem, _)| stem))
        .unwrap_or("image");
    let safe: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("assets/img/{safe}{suffix}.{extension}")
}

fn mime_for_format(format: &str) -> String {
    match format {
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        other => format!("image/{other}"),
    }
}

type ProducedFiles = Vec<(String, Vec<u8>)>;

/// Fetches and transcodes one image. Per-image failures return `Err(log
/// line)`: the caller logs at warn and the original is used untouched.
async fn process_image(
    fetcher: crate::fetch::Fetcher,
    codec: Arc<dyn mls_adapters::ImageCodec>,
    resolver: mls_settings::SettingsResolver,
    site_id: String,
    url: String,
    image: ImageRef,
) -> Result<(ImageOutcome, ProducedFiles), String> {
    let bytes = fetcher
        .get_bytes(&url)
        .await
        .map_err(|err| format!("image fetch failed for {url}: {err}"))?;
    let original_bytes = bytes.len() as u64;

    // Per-URL override settings decide thresholds and qualities.
    let settings = resolver
        .resolve_for_asset(&site_id, &url, Some(AssetClass::Images))
        .await
        .map_err(|err| format!("settings resolution failed for {url}: {err}"))?;

    let extension = extension_of(&url).unwrap_or_default();
    let is_bitmap = BITMAP_EXTENSIONS.contains(&extension.as_str());
    if !is_bitmap || original_bytes <= settings.images.min_bytes {
        // Below threshold or not a bitmap: copy through unchanged.
        let local = local_image_path(&url, &extension, "");
        return Ok((
            ImageOutcome {
                original_bytes,
                optimized_bytes: original_bytes,
                rewrite: Some((url, ImageRewrite::Copy { local: local.clone() })),
                note: None,
            },
            vec![(local, bytes)],
        ));
    }

    let quality = if image.lcp_candidate {
        settings.images.lcp_quality
    } else {
        settings.images.standard_quality
    };

    let modern = codec
        .transcode(
            &bytes,
            &TranscodeRequest {
                format: settings.images.modern_format.clone(),
                quality,
                max_width: None,
            },
        )
        .await
        .map_err(|err| format!("transcode failed for {url}: {err}"))?;
    let fallback = codec
        .transcode(
            &bytes,
            &TranscodeRequest {
                format: settings.images.fallback_format.clone(),
                quality,
                max_width: None,
            },
        )
        .await
        .map_err(|err| format!("fallback transcode failed for {url}: {err}"))?;
    let thumbnail = codec
        .transcode(
            &bytes,
            &TranscodeRequest {
                format: settings.images.modern_format.clone(),
                quality: settings.images.thumbnail_quality,
                max_width: Some(THUMB_WIDTH),
            },
        )
        .await
        .map_err(|err| format!("thumbnail transcode failed for {url}: {err}"))?;

    let modern_path = local_image_path(&url, &settings.images.modern_format, "");
    let fallback_path = local_image_path(&url, &settings.images.fallback_format, "");
    let thumb_path = local_image_path(&url, &settings.images.modern_format, ".thumb");

    let optimized_bytes = modern.len() as u64;
    let note = format!(
        "image {url}: {original_bytes} -> {optimized_bytes} bytes ({}%)",
        if original_bytes > 0 {
            optimized_bytes * 100 / original_bytes
        } else {
            0
        }
    );
    Ok((
        ImageOutcome {
            original_bytes,
            optimized_bytes,
            rewrite: Some((
                url,
                ImageRewrite::Variants {
                    modern: modern_path.clone(),
                    fallback: fallback_path.clone(),
                    thumbnail: thumb_path.clone(),
                    modern_format: settings.images.modern_format.clone(),
                },
            )),
            note: Some(note),
        },
        vec![
            (modern_path, modern),
            (fallback_path, fallback),
            (thumb_path, thumbnail),
        ],
    ))
}

/// Points HTML references at the local optimized filenames. Transcoded
/// images become `<picture>` elements with the modern variant in a
/// `<source>` and the legacy fallback plus a width `srcset` on the inner
/// `<img>`; pass-through copies keep a plain `src` swap.
async fn rewrite_references(
    ctx: &mut BuildContext,
    crawl: &CrawlOutput,
    rewrites: &HashMap<String, ImageRewrite>,
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
        for image in &page.images {
            let Some(absolute) = resolve_url(&page.url, &image.src) else {
                continue;
            };
            match rewrites.get(&absolute) {
                Some(ImageRewrite::Copy { local }) => {
                    let replacement = format!("{prefix}{local}");
                    html = html.replace(&image.src, &replacement);
                }
                Some(ImageRewrite::Variants {
                    modern,
                    fallback,
                    thumbnail,
                    modern_format,
                }) => {
                    html = wrap_in_picture(
                        &html,
                        &image.src,
                        &format!("{prefix}{modern}"),
                        &format!("{prefix}{fallback}"),
                        &format!("{prefix}{thumbnail}"),
                        modern_format,
                    );
                }
                None => {}
            }
        }
        ctx.write_output(&page.output_path, html.as_bytes(), PHASE)
            .await?;
    }
    Ok(())
}

/// Rewrites every `<img ...src="original"...>` into a `<picture>` with the
/// modern variant as a typed `<source>` and the legacy fallback as the
/// `src`, keeping the original attributes and adding a width `srcset`.
fn wrap_in_picture(
    html: &str,
    original_src: &str,
    modern: &str,
    fallback: &str,
    thumbnail: &str,
    modern_format: &str,
) -> String {
    let mime = mime_for_format(modern_format);
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(pos) = rest.find(original_src) {
        let tag_start = rest[..pos].rfind('<').unwrap_or(0);
        let tag_end = rest[pos..]
            .find('>')
            .map(|e| pos + e + 1)
            .unwrap_or(rest.len());
        if !rest[tag_start..].starts_with("<img") {
            out.push_str(&rest[..tag_end]);
            rest = &rest[tag_end..];
            continue;
        }
        let tag = &rest[tag_start..tag_end];
        let mut img = tag.replace(original_src, fallback);
        let srcset =
            format!(" srcset=\"{thumbnail} {THUMB_WIDTH}w, {modern} {FULL_WIDTH}w\" sizes=\"100vw\"");
        let insert_at = if img.ends_with("/>") {
            img.len() - 2
        } else {
            img.len() - 1
        };
        img.insert_str(insert_at, &srcset);
        out.push_str(&rest[..tag_start]);
        out.push_str(&format!(
            "<picture><source type=\"{mime}\" srcset=\"{modern}\">{img}</picture>"
        ));
        rest = &rest[tag_end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_and_local_paths() {
        assert_eq!(extension_of("https://a.test/x/hero.JPG?v=2").as_deref(), Some("jpg"));
        assert_eq!(extension_of("https://a.test/x/noext").as_deref(), None);
        assert_eq!(
            local_image_path("https://a.test/uploads/hero image.jpg", "webp", ""),
            "assets/img/hero-image.webp"
        );
        assert_eq!(
            local_image_path("https://a.test/uploads/hero.jpg", "webp", ".thumb"),
            "assets/img/hero.thumb.webp"
        );
    }

    #[test]
    fn picture_markup_carries_modern_source_and_fallback_src() {
        let html = r#"<div><img src="/uploads/hero.jpg" alt="Hero" class="lcp"></div>"#;
        let out = wrap_in_picture(
            html,
            "/uploads/hero.jpg",
            "assets/img/hero.webp",
            "assets/img/hero.jpeg",
            "assets/img/hero.thumb.webp",
            "webp",
        );
        assert!(out.contains(r#"<picture><source type="image/webp" srcset="assets/img/hero.webp">"#));
        assert!(out.contains(r#"src="assets/img/hero.jpeg""#));
        assert!(out.contains(r#"srcset="assets/img/hero.thumb.webp 320w, assets/img/hero.webp 1280w""#));
        // Original attributes survive on the inner img.
        assert!(out.contains(r#"alt="Hero""#));
        assert!(out.contains(r#"class="lcp""#));
        assert!(out.ends_with("</picture></div>"));
    }

    #[test]
    fn self_closing_img_tags_keep_their_slash() {
        let html = r#"<img src="/a.jpg"/>"#;
        let out = wrap_in_picture(
            html,
            "/a.jpg",
            "assets/img/a.webp",
            "assets/img/a.jpeg",
            "assets/img/a.thumb.webp",
            "webp",
        );
        assert!(out.contains("sizes=\"100vw\"/></picture>"));
    }

    #[test]
    fn non_img_occurrences_are_left_alone() {
        let html = r#"<a href="/uploads/hero.jpg">link</a><img src="/uploads/hero.jpg">"#;
        let out = wrap_in_picture(
            html,
            "/uploads/hero.jpg",
            "assets/img/hero.webp",
            "assets/img/hero.jpeg",
            "assets/img/hero.thumb.webp",
            "webp",
        );
        assert!(out.contains(r#"<a href="/uploads/hero.jpg">"#));
        assert_eq!(out.matches("<picture>").count(), 1);
    }

    #[test]
    fn mime_types_map_common_formats() {
        assert_eq!(mime_for_format("webp"), "image/webp");
        assert_eq!(mime_for_format("avif"), "image/avif");
        assert_eq!(mime_for_format("jpeg"), "image/jpeg");
        assert_eq!(mime_for_format("jpg"), "image/jpeg");
    }
}
