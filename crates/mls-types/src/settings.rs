use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    100
}

fn default_max_depth() -> u32 {
    3
}

fn default_crawl_concurrency() -> u32 {
    4
}

fn default_min_image_bytes() -> u64 {
    10 * 1024
}

fn default_lcp_quality() -> u8 {
    82
}

fn default_standard_quality() -> u8 {
    70
}

fn default_thumbnail_quality() -> u8 {
    50
}

fn default_modern_format() -> String {
    "webp".to_string()
}

fn default_fallback_format() -> String {
    "jpeg".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CrawlSettings {
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_crawl_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_true")]
    pub use_sitemap: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
            concurrency: default_crawl_concurrency(),
            use_sitemap: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Images below this size are copied through untouched.
    #[serde(default = "default_min_image_bytes")]
    pub min_bytes: u64,
    #[serde(default = "default_modern_format")]
    pub modern_format: String,
    #[serde(default = "default_fallback_format")]
    pub fallback_format: String,
    #[serde(default = "default_lcp_quality")]
    pub lcp_quality: u8,
    #[serde(default = "default_standard_quality")]
    pub standard_quality: u8,
    #[serde(default = "default_thumbnail_quality")]
    pub thumbnail_quality: u8,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_bytes: default_min_image_bytes(),
            modern_format: default_modern_format(),
            fallback_format: default_fallback_format(),
            lcp_quality: default_lcp_quality(),
            standard_quality: default_standard_quality(),
            thumbnail_quality: default_thumbnail_quality(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PurgeAggressiveness {
    Off,
    Safe,
    Standard,
    Aggressive,
}

impl Default for PurgeAggressiveness {
    fn default() -> Self {
        PurgeAggressiveness::Standard
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PurgeSafelist {
    /// Exact selectors always preserved.
    #[serde(default)]
    pub standard: Vec<String>,
    /// Class prefixes always preserved (theme/plugin fingerprint adds more).
    #[serde(default)]
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CssSettings {
    #[serde(default)]
    pub purge_aggressiveness: PurgeAggressiveness,
    #[serde(default)]
    pub purge_safelist: PurgeSafelist,
    #[serde(default = "default_true")]
    pub minify: bool,
    #[serde(default = "default_true")]
    pub inline_critical: bool,
    #[serde(default = "default_true")]
    pub defer_non_critical: bool,
}

impl Default for CssSettings {
    fn default() -> Self {
        Self {
            purge_aggressiveness: PurgeAggressiveness::default(),
            purge_safelist: PurgeSafelist::default(),
            minify: true,
            inline_critical: true,
            defer_non_critical: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JsSettings {
    #[serde(default = "default_true")]
    pub remove_emoji: bool,
    #[serde(default = "default_true")]
    pub remove_block_library: bool,
    #[serde(default)]
    pub remove_analytics: bool,
    #[serde(default = "default_true")]
    pub minify: bool,
    #[serde(default = "default_true")]
    pub defer: bool,
}

impl Default for JsSettings {
    fn default() -> Self {
        Self {
            remove_emoji: true,
            remove_block_library: true,
            remove_analytics: false,
            minify: true,
            defer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HtmlSettings {
    #[serde(default = "default_true")]
    pub strip_platform_metadata: bool,
    #[serde(default = "default_true")]
    pub resource_hints: bool,
    #[serde(default = "default_true")]
    pub embed_facades: bool,
}

impl Default for HtmlSettings {
    fn default() -> Self {
        Self {
            strip_platform_metadata: true,
            resource_hints: true,
            embed_facades: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FontDisplay {
    Swap,
    Optional,
}

impl Default for FontDisplay {
    fn default() -> Self {
        FontDisplay::Swap
    }
}

impl FontDisplay {
    pub fn as_css(self) -> &'static str {
        match self {
            FontDisplay::Swap => "swap",
            FontDisplay::Optional => "optional",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FontSettings {
    #[serde(default = "default_true")]
    pub self_host: bool,
    #[serde(default)]
    pub display: FontDisplay,
    #[serde(default = "default_true")]
    pub preload_above_fold: bool,
}

impl Default for FontSettings {
    fn default() -> Self {
        Self {
            self_host: true,
            display: FontDisplay::default(),
            preload_above_fold: true,
        }
    }
}

/// The full, validated configuration a build runs with. Serde defaults are
/// the schema: a sparse override merged over the default document must
/// deserialize cleanly or the build may not start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SiteSettings {
    #[serde(default)]
    pub crawl: CrawlSettings,
    #[serde(default)]
    pub images: ImageSettings,
    #[serde(default)]
    pub css: CssSettings,
    #[serde(default)]
    pub js: JsSettings,
    #[serde(default)]
    pub html: HtmlSettings,
    #[serde(default)]
    pub fonts: FontSettings,
}

impl SiteSettings {
    /// Range checks serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        for (label, quality) in [
            ("images.lcpQuality", self.images.lcp_quality),
            ("images.standardQuality", self.images.standard_quality),
            ("images.thumbnailQuality", self.images.thumbnail_quality),
        ] {
            if quality == 0 || quality > 100 {
                return Err(format!("{label} must be within 1..=100, got {quality}"));
            }
        }
        if self.crawl.max_pages == 0 {
            return Err("crawl.maxPages must be at least 1".to_string());
        }
        if self.crawl.concurrency == 0 {
            return Err("crawl.concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SiteSettings::default().validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<SiteSettings, _> = serde_json::from_value(serde_json::json!({
            "css": {"purgeAgressiveness": "safe"}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn sparse_document_fills_defaults() {
        let settings: SiteSettings = serde_json::from_value(serde_json::json!({
            "css": {"purgeAggressiveness": "aggressive"}
        }))
        .unwrap();
        assert_eq!(
            settings.css.purge_aggressiveness,
            PurgeAggressiveness::Aggressive
        );
        assert!(settings.css.minify);
        assert_eq!(settings.images.standard_quality, 70);
    }
}
