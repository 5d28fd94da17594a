use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AdapterResult, UpstreamError};

const SERVICE: &str = "edge";

#[derive(Debug, Clone, Deserialize)]
pub struct DeployResult {
    pub url: String,
}

/// Uploads an artifact tree to the edge provider and returns the public URL.
#[async_trait]
pub trait EdgeDeployer: Send + Sync {
    async fn deploy(
        &self,
        project_name: &str,
        directory: &Path,
        source_url: &str,
    ) -> AdapterResult<DeployResult>;
}

/// File-by-file upload client: PUT each file under the project, then create
/// a deploy. Failed deploys are fatal to the build; only transport-level
/// errors retry.
pub struct EdgeApiClient {
    base_url: String,
    token: String,
    client: Client,
}

impl EdgeApiClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: Client::new(),
        }
    }

    fn collect_files(directory: &Path) -> Vec<(PathBuf, String)> {
        let mut files = Vec::new();
        for entry in WalkBuilder::new(directory)
            .standard_filters(false)
            .hidden(false)
            .build()
            .flatten()
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(directory) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push((path.to_path_buf(), relative));
        }
        files.sort_by(|a, b| a.1.cmp(&b.1));
        files
    }
}

#[async_trait]
impl EdgeDeployer for EdgeApiClient {
    async fn deploy(
        &self,
        project_name: &str,
        directory: &Path,
        source_url: &str,
    ) -> AdapterResult<DeployResult> {
        let files = Self::collect_files(directory);
        if files.is_empty() {
            return Err(UpstreamError::fatal(SERVICE, "nothing to deploy"));
        }

        for (path, relative) in &files {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|err| UpstreamError::fatal(SERVICE, format!("read {relative}: {err}")))?;
            let response = self
                .client
                .put(format!(
                    "{}/projects/{}/files/{}",
                    self.base_url, project_name, relative
                ))
                .bearer_auth(&self.token)
                .body(bytes)
                .send()
                .await
                .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(UpstreamError::from_status(SERVICE, status, &body));
            }
        }

        let response = self
            .client
            .post(format!("{}/projects/{}/deploys", self.base_url, project_name))
            .bearer_auth(&self.token)
            .json(&json!({"sourceUrl": source_url, "fileCount": files.len()}))
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        response
            .json()
            .await
            .map_err(|err| UpstreamError::transient(SERVICE, err.to_string()))
    }
}
