use reqwest::{Client, Url};

use mls_adapters::{AdapterResult, UpstreamError};

const SERVICE: &str = "fetch";

/// Plain HTTP fetches for site assets (images, stylesheets, scripts, font
/// files). Rendering goes through the browser adapter; raw bytes come from
/// here.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub async fn get_bytes(&self, url: &str) -> AdapterResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| UpstreamError::transient(SERVICE, err.to_string()))?;
        Ok(bytes.to_vec())
    }

    pub async fn get_text(&self, url: &str) -> AdapterResult<String> {
        let bytes = self.get_bytes(url).await?;
        String::from_utf8(bytes)
            .map_err(|err| UpstreamError::fatal(SERVICE, format!("{url} is not UTF-8: {err}")))
    }

    pub async fn head_status(&self, url: &str) -> AdapterResult<u16> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
        Ok(response.status().as_u16())
    }
}

/// Resolves `href` against `base`, returning an absolute URL string.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// True when `candidate` shares scheme+host with `origin`.
pub fn same_origin(origin: &str, candidate: &str) -> bool {
    match (Url::parse(origin), Url::parse(candidate)) {
        (Ok(a), Ok(b)) => a.scheme() == b.scheme() && a.host_str() == b.host_str(),
        _ => false,
    }
}

/// Maps a page URL to its output path: `/` → `index.html`,
/// `/about/` → `about/index.html`, `/feed.xml` stays as-is.
pub fn output_path_for(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string());
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "index.html".to_string();
    }
    if trimmed.rsplit('/').next().is_some_and(|seg| seg.contains('.')) {
        return trimmed.to_string();
    }
    format!("{trimmed}/index.html")
}

/// Filesystem-safe slug for screenshots: `about/index.html` → `about-index`.
pub fn page_slug(output_path: &str) -> String {
    let stem = output_path.trim_end_matches(".html").trim_end_matches('/');
    let slug: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "index".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_resolution_handles_relative_and_absolute() {
        assert_eq!(
            resolve_url("https://acme.test/blog/", "../about").as_deref(),
            Some("https://acme.test/about")
        );
        assert_eq!(
            resolve_url("https://acme.test/", "https://cdn.test/a.js").as_deref(),
            Some("https://cdn.test/a.js")
        );
    }

    #[test]
    fn origin_comparison_ignores_path() {
        assert!(same_origin("https://acme.test/", "https://acme.test/about"));
        assert!(!same_origin("https://acme.test/", "https://evil.test/"));
    }

    #[test]
    fn output_paths_follow_directory_convention() {
        assert_eq!(output_path_for("https://acme.test/"), "index.html");
        assert_eq!(output_path_for("https://acme.test/about/"), "about/index.html");
        assert_eq!(output_path_for("https://acme.test/about"), "about/index.html");
        assert_eq!(output_path_for("https://acme.test/feed.xml"), "feed.xml");
    }

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(page_slug("index.html"), "index");
        assert_eq!(page_slug("blog/2024/post/index.html"), "blog-2024-post-index");
    }
}
