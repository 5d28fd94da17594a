use std::path::{Path, PathBuf};

use mls_store::Store;

/// On-disk layout under the data root:
/// `builds/{buildId}/{output,logs,screenshots}`, `sites/{siteId}`,
/// `workspaces/{siteId}`.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    data_root: PathBuf,
}

impl ArtifactPaths {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn build_dir(&self, build_id: &str) -> PathBuf {
        self.data_root.join("builds").join(build_id)
    }

    pub fn build_output_dir(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("output")
    }

    pub fn build_logs_dir(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("logs")
    }

    pub fn build_screenshots_dir(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("screenshots")
    }

    pub fn inventory_path(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("inventory.json")
    }

    pub fn unchanged_pages_path(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("unchanged.json")
    }

    pub fn image_rewrites_path(&self, build_id: &str) -> PathBuf {
        self.build_dir(build_id).join("image-rewrites.json")
    }

    pub fn site_dir(&self, site_id: &str) -> PathBuf {
        self.data_root.join("sites").join(site_id)
    }

    pub fn workspace_dir(&self, site_id: &str) -> PathBuf {
        self.data_root.join("workspaces").join(site_id)
    }

    pub async fn ensure_build_dirs(&self, build_id: &str) -> std::io::Result<()> {
        for dir in [
            self.build_output_dir(build_id),
            self.build_logs_dir(build_id),
            self.build_screenshots_dir(build_id),
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Background sweep: removes artifact trees for builds of this site that are
/// not among the last `keep` successful ones (and not the build in flight).
pub async fn prune_build_artifacts(
    paths: &ArtifactPaths,
    store: &Store,
    site_id: &str,
    keep: usize,
    in_flight: Option<&str>,
) -> anyhow::Result<usize> {
    let keep_ids = store.recent_successful_build_ids(site_id, keep).await?;
    let builds = store.list_builds(site_id, 1000, 0).await?;
    let mut removed = 0usize;
    for build in builds {
        if keep_ids.contains(&build.id) || Some(build.id.as_str()) == in_flight {
            continue;
        }
        if !build.status.is_terminal() {
            continue;
        }
        let dir = paths.build_dir(&build.id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
            removed += 1;
            tracing::info!(build_id = %build.id, "pruned build artifacts");
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::{Build, BuildScope, BuildStatus, BuildTrigger, Site};

    #[test]
    fn layout_matches_contract() {
        let paths = ArtifactPaths::new("/data");
        assert_eq!(
            paths.build_output_dir("build_a"),
            PathBuf::from("/data/builds/build_a/output")
        );
        assert_eq!(
            paths.workspace_dir("site_a"),
            PathBuf::from("/data/workspaces/site_a")
        );
        assert_eq!(
            paths.site_dir("site_a"),
            PathBuf::from("/data/sites/site_a")
        );
    }

    #[tokio::test]
    async fn sweep_keeps_recent_successes_and_live_builds() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(tmp.path());
        let store = Store::open_in_memory().await.unwrap();
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let build = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
            store.insert_build(&build).await.unwrap();
            store
                .write_build_status(&build.id, BuildStatus::Success, None)
                .await
                .unwrap();
            tokio::fs::create_dir_all(paths.build_dir(&build.id))
                .await
                .unwrap();
            ids.push(build.id);
        }

        let removed = prune_build_artifacts(&paths, &store, &site.id, 2, None)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        // Newest two survive.
        let keep = store
            .recent_successful_build_ids(&site.id, 2)
            .await
            .unwrap();
        for id in &keep {
            assert!(paths.build_dir(id).exists());
        }
    }
}
