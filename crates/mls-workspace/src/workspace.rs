use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use mls_adapters::Services;
use mls_events::{EventBus, TopicPublisher};
use mls_pipeline::ArtifactPaths;
use mls_store::Store;
use mls_types::{ProgressEvent, Topic, TopicKind};

use crate::error::{WorkspaceError, WorkspaceResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileEdit {
    pub path: String,
    pub new_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub applied: usize,
    pub errors: Vec<EditError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EditError {
    pub path: String,
    pub message: String,
}

/// Per-site mutable copy of the last successful build's artifact tree.
#[derive(Clone)]
pub struct LiveEditWorkspace {
    store: Arc<Store>,
    paths: ArtifactPaths,
    events: EventBus,
    services: Services,
}

impl LiveEditWorkspace {
    pub fn new(
        store: Arc<Store>,
        paths: ArtifactPaths,
        events: EventBus,
        services: Services,
    ) -> Self {
        Self {
            store,
            paths,
            events,
            services,
        }
    }

    fn publisher(&self, site_id: &str) -> TopicPublisher {
        TopicPublisher::new(
            self.events.clone(),
            Topic::new(TopicKind::LiveEdit, site_id),
        )
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn root(&self, site_id: &str) -> PathBuf {
        self.paths.workspace_dir(site_id)
    }

    pub fn exists(&self, site_id: &str) -> bool {
        self.root(site_id).is_dir()
    }

    /// Idempotently creates the workspace from the most recent successful
    /// build's output.
    pub async fn ensure(&self, site_id: &str) -> WorkspaceResult<PathBuf> {
        let root = self.root(site_id);
        if root.is_dir() {
            return Ok(root);
        }
        let build = self
            .store
            .latest_successful_build(site_id)
            .await?
            .ok_or_else(|| WorkspaceError::NotFound {
                site_id: site_id.to_string(),
            })?;
        let source = self.paths.build_output_dir(&build.id);
        if !source.is_dir() {
            return Err(WorkspaceError::NotFound {
                site_id: site_id.to_string(),
            });
        }
        copy_tree(&source, &root).await?;
        tracing::info!(site_id, build_id = %build.id, "workspace created");
        Ok(root)
    }

    pub async fn list_files(&self, site_id: &str) -> WorkspaceResult<Vec<String>> {
        let root = self.ensure(site_id).await?;
        let mut files = Vec::new();
        for entry in WalkBuilder::new(&root)
            .standard_filters(false)
            .hidden(false)
            .build()
            .flatten()
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(&root) {
                files.push(
                    relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                );
            }
        }
        files.sort();
        Ok(files)
    }

    /// Resolves a relative path inside the workspace, rejecting traversal.
    fn resolve(&self, root: &Path, relative: &str) -> WorkspaceResult<PathBuf> {
        if relative.starts_with('/') || relative.split('/').any(|seg| seg == "..") {
            return Err(WorkspaceError::PathEscape {
                path: relative.to_string(),
            });
        }
        let joined = root.join(relative);
        // Canonicalize the deepest existing ancestor so symlinks cannot
        // escape either.
        let check = if joined.exists() {
            joined
                .canonicalize()
                .map_err(|err| WorkspaceError::io(relative, err))?
        } else {
            joined.clone()
        };
        let root_canonical = root
            .canonicalize()
            .unwrap_or_else(|_| root.to_path_buf());
        if !check.starts_with(&root_canonical) && !check.starts_with(root) {
            return Err(WorkspaceError::PathEscape {
                path: relative.to_string(),
            });
        }
        Ok(joined)
    }

    pub async fn read_file(&self, site_id: &str, relative: &str) -> WorkspaceResult<String> {
        let root = self.ensure(site_id).await?;
        let path = self.resolve(&root, relative)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| WorkspaceError::io(relative, err))
    }

    /// Applies edits atomically per file (write-then-rename) and emits one
    /// `patch` event per applied file. Per-edit failures are collected, not
    /// fatal.
    pub async fn apply_edits(
        &self,
        site_id: &str,
        edits: &[FileEdit],
    ) -> WorkspaceResult<ApplyOutcome> {
        let root = self.ensure(site_id).await?;
        let publisher = self.publisher(site_id);
        let mut outcome = ApplyOutcome::default();

        for edit in edits {
            let result = self.apply_one(&root, edit).await;
            match result {
                Ok(()) => {
                    outcome.applied += 1;
                    publisher.publish(ProgressEvent::Patch {
                        path: edit.path.clone(),
                    });
                }
                Err(err) => outcome.errors.push(EditError {
                    path: edit.path.clone(),
                    message: err.to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    async fn apply_one(&self, root: &Path, edit: &FileEdit) -> WorkspaceResult<()> {
        let target = self.resolve(root, &edit.path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| WorkspaceError::io(&edit.path, err))?;
        }
        let temp = target.with_extension("tmp-edit");
        tokio::fs::write(&temp, edit.new_content.as_bytes())
            .await
            .map_err(|err| WorkspaceError::io(&edit.path, err))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|err| WorkspaceError::io(&edit.path, err))?;
        Ok(())
    }

    /// Uploads the workspace under the site's existing project and updates
    /// the edge URL.
    pub async fn deploy(&self, site_id: &str) -> WorkspaceResult<String> {
        let root = self.ensure(site_id).await?;
        let site = self.store.get_site(site_id).await?;
        let project = site
            .edge_project
            .clone()
            .unwrap_or_else(|| site.edge_project_name());
        let result = self
            .services
            .edge
            .deploy(&project, &root, &site.source_url)
            .await?;
        self.store
            .update_site_after_build(
                site_id,
                Some(&result.url),
                Some(&project),
                site.page_count,
                site.total_bytes,
            )
            .await?;
        let publisher = self.publisher(site_id);
        publisher.publish(ProgressEvent::Deploy {
            message: format!("workspace live at {}", result.url),
        });
        Ok(result.url)
    }
}

async fn copy_tree(source: &Path, target: &Path) -> WorkspaceResult<()> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|err| WorkspaceError::io(target.display().to_string(), err))?;
    let entries: Vec<(PathBuf, PathBuf)> = WalkBuilder::new(source)
        .standard_filters(false)
        .hidden(false)
        .build()
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(source)
                .ok()
                .map(|rel| (entry.path().to_path_buf(), target.join(rel)))
        })
        .collect();
    for (from, to) in entries {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| WorkspaceError::io(parent.display().to_string(), err))?;
        }
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|err| WorkspaceError::io(from.display().to_string(), err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_pipeline::testing::mock_services;
    use mls_types::{Build, BuildScope, BuildStatus, BuildTrigger, Site};
    use std::collections::HashMap;

    struct Fixture {
        workspace: LiveEditWorkspace,
        site: Site,
        _tmp: tempfile::TempDir,
    }

    async fn fixture_with_build() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();

        let build = Build::new(&site.id, BuildScope::Full, BuildTrigger::User);
        store.insert_build(&build).await.unwrap();
        store
            .write_build_status(&build.id, BuildStatus::Success, None)
            .await
            .unwrap();

        let paths = ArtifactPaths::new(tmp.path());
        let output = paths.build_output_dir(&build.id);
        std::fs::create_dir_all(output.join("about")).unwrap();
        std::fs::write(output.join("index.html"), "<html>home</html>").unwrap();
        std::fs::write(output.join("about/index.html"), "<html>about</html>").unwrap();

        let workspace = LiveEditWorkspace::new(
            store,
            paths,
            EventBus::new(),
            mock_services(HashMap::new(), Vec::new()),
        );
        Fixture {
            workspace,
            site,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn ensure_copies_last_successful_build_and_is_idempotent() {
        let f = fixture_with_build().await;
        let root = f.workspace.ensure(&f.site.id).await.unwrap();
        assert!(root.join("index.html").is_file());

        // A second ensure leaves local modifications alone.
        std::fs::write(root.join("index.html"), "<html>edited</html>").unwrap();
        f.workspace.ensure(&f.site.id).await.unwrap();
        let content = f.workspace.read_file(&f.site.id, "index.html").await.unwrap();
        assert_eq!(content, "<html>edited</html>");

        let files = f.workspace.list_files(&f.site.id).await.unwrap();
        assert_eq!(files, vec!["about/index.html", "index.html"]);
    }

    #[tokio::test]
    async fn ensure_without_successful_build_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let site = Site::new("Acme", "https://acme.test");
        store.insert_site(&site).await.unwrap();
        let workspace = LiveEditWorkspace::new(
            store,
            ArtifactPaths::new(tmp.path()),
            EventBus::new(),
            mock_services(HashMap::new(), Vec::new()),
        );
        assert!(matches!(
            workspace.ensure(&site.id).await,
            Err(WorkspaceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let f = fixture_with_build().await;
        for bad in ["../outside.txt", "a/../../b", "/etc/passwd"] {
            assert!(matches!(
                f.workspace.read_file(&f.site.id, bad).await,
                Err(WorkspaceError::PathEscape { .. })
            ));
        }
    }

    #[tokio::test]
    async fn apply_edits_is_atomic_per_file_and_reports_errors() {
        let f = fixture_with_build().await;
        let topic = Topic::new(TopicKind::LiveEdit, &f.site.id);
        f.workspace.ensure(&f.site.id).await.unwrap();
        let mut rx = f.workspace.events.subscribe(&topic);

        let outcome = f
            .workspace
            .apply_edits(
                &f.site.id,
                &[
                    FileEdit {
                        path: "index.html".into(),
                        new_content: "<html>v2</html>".into(),
                    },
                    FileEdit {
                        path: "../escape.html".into(),
                        new_content: "nope".into(),
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].message.contains("escapes"));

        let content = f.workspace.read_file(&f.site.id, "index.html").await.unwrap();
        assert_eq!(content, "<html>v2</html>");
        assert!(matches!(
            rx.try_recv().unwrap(),
            ProgressEvent::Patch { path } if path == "index.html"
        ));
    }

    #[tokio::test]
    async fn deploy_updates_edge_url() {
        let f = fixture_with_build().await;
        let url = f.workspace.deploy(&f.site.id).await.unwrap();
        assert!(url.contains(".edge.test"));
        let site = f.workspace.store.get_site(&f.site.id).await.unwrap();
        assert_eq!(site.edge_url.as_deref(), Some(url.as_str()));
    }
}
