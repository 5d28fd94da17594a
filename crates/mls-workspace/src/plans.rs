use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use mls_adapters::{extract_json, UpstreamError};
use mls_events::{EventBus, TopicPublisher};
use mls_types::{ProgressEvent, Topic, TopicKind};

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::workspace::{ApplyOutcome, FileEdit, LiveEditWorkspace};

const PLAN_SYSTEM: &str = "You are editing the static HTML/CSS/JS of an optimized website copy. \
Given a set of workspace files and an instruction, answer with a single JSON object: `edits` \
(array of {path, newContent} replacing whole files), `issues` (array of strings), \
`improvements` (array of strings), `rationale` (string). Edit only the provided files; emit \
complete file contents, never fragments. Only emit JSON.";

const AUDIT_SYSTEM: &str = "You are auditing the static copy of a website. Given workspace files \
and an audit type (speed, bugs or visual), answer with a single JSON object: `findings` (array \
of {path, severity, detail}), `summary` (string). Only emit JSON.";

/// Most HTML context shipped to the oracle per request.
const MAX_CONTEXT_FILES: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutput {
    pub plan_id: String,
    pub edits: Vec<FileEdit>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOutcome {
    pub plan_id: String,
    pub apply: ApplyOutcome,
    pub edge_url: String,
}

/// Plan → approve → execute protocol over a site's workspace. Plans live in
/// memory keyed by site; a newer plan supersedes the previous one.
#[derive(Clone)]
pub struct ChatPlanner {
    workspace: LiveEditWorkspace,
    events: EventBus,
    plans: Arc<RwLock<HashMap<String, PlanOutput>>>,
}

impl ChatPlanner {
    pub fn new(workspace: LiveEditWorkspace, events: EventBus) -> Self {
        Self {
            workspace,
            events,
            plans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn publisher(&self, site_id: &str) -> TopicPublisher {
        TopicPublisher::new(
            self.events.clone(),
            Topic::new(TopicKind::LiveEdit, site_id),
        )
    }

    /// HTML files for the oracle context, honoring an optional scope list.
    async fn context_files(
        &self,
        site_id: &str,
        scope: &[String],
    ) -> WorkspaceResult<Vec<(String, String)>> {
        let all = self.workspace.list_files(site_id).await?;
        let selected: Vec<String> = if scope.is_empty() {
            all.into_iter()
                .filter(|f| f.ends_with(".html"))
                .take(MAX_CONTEXT_FILES)
                .collect()
        } else {
            all.into_iter()
                .filter(|f| scope.iter().any(|s| f == s || f.starts_with(s.as_str())))
                .take(MAX_CONTEXT_FILES)
                .collect()
        };
        let mut out = Vec::with_capacity(selected.len());
        for file in selected {
            let content = self.workspace.read_file(site_id, &file).await?;
            out.push((file, content));
        }
        Ok(out)
    }

    /// `mode=plan`: asks the oracle for edits, stores and announces the plan.
    pub async fn plan(
        &self,
        site_id: &str,
        message: &str,
        scope: &[String],
    ) -> WorkspaceResult<PlanOutput> {
        let files = self.context_files(site_id, scope).await?;
        let user = json!({
            "instruction": message,
            "files": files.iter().map(|(path, content)| json!({
                "path": path,
                "content": content,
            })).collect::<Vec<_>>(),
        })
        .to_string();

        let reply = self
            .workspace
            .services()
            .oracle
            .complete(PLAN_SYSTEM, &user)
            .await?;
        let value = extract_json(&reply.text)?;
        let edits: Vec<FileEdit> = serde_json::from_value(value["edits"].clone())
            .map_err(|err| UpstreamError::transient("oracle", format!("plan edits: {err}")))?;
        let plan = PlanOutput {
            plan_id: format!("plan_{}", uuid::Uuid::new_v4().simple()),
            edits,
            issues: string_array(&value["issues"]),
            improvements: string_array(&value["improvements"]),
            rationale: value["rationale"].as_str().unwrap_or_default().to_string(),
            created_at: Utc::now(),
        };

        self.plans
            .write()
            .await
            .insert(site_id.to_string(), plan.clone());
        let publisher = self.publisher(site_id);
        publisher.publish(ProgressEvent::Plan {
            plan_id: plan.plan_id.clone(),
            edits: plan
                .edits
                .iter()
                .map(|e| json!({"path": e.path}))
                .collect(),
            rationale: plan.rationale.clone(),
        });
        Ok(plan)
    }

    pub async fn current_plan(&self, site_id: &str) -> Option<PlanOutput> {
        self.plans.read().await.get(site_id).cloned()
    }

    /// `mode=execute`: applies the stored plan's edits and redeploys. A
    /// stale or unknown plan id is rejected without touching the workspace.
    pub async fn execute(&self, site_id: &str, plan_id: &str) -> WorkspaceResult<ExecuteOutcome> {
        let plan = {
            let plans = self.plans.read().await;
            plans
                .get(site_id)
                .filter(|plan| plan.plan_id == plan_id)
                .cloned()
        }
        .ok_or_else(|| WorkspaceError::UnknownPlan {
            plan_id: plan_id.to_string(),
        })?;

        let apply = self.workspace.apply_edits(site_id, &plan.edits).await?;
        let edge_url = self.workspace.deploy(site_id).await?;
        self.plans.write().await.remove(site_id);
        Ok(ExecuteOutcome {
            plan_id: plan.plan_id,
            apply,
            edge_url,
        })
    }

    /// `speed | bugs | visual` audit over the workspace context.
    pub async fn audit(&self, site_id: &str, kind: &str, scope: &[String]) -> WorkspaceResult<Value> {
        let files = self.context_files(site_id, scope).await?;
        let user = json!({
            "auditType": kind,
            "files": files.iter().map(|(path, content)| json!({
                "path": path,
                "content": content,
            })).collect::<Vec<_>>(),
        })
        .to_string();
        let publisher = self.publisher(site_id);
        publisher.log("info", format!("running {kind} audit"));
        let reply = self
            .workspace
            .services()
            .oracle
            .complete(AUDIT_SYSTEM, &user)
            .await?;
        let value = extract_json(&reply.text)?;
        publisher.publish(ProgressEvent::step_complete("audit", value.clone()));
        Ok(value)
    }
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_pipeline::testing::mock_services;
    use mls_pipeline::ArtifactPaths;
    use mls_store::Store;
    use mls_types::{Build, BuildScope, BuildStatus, BuildTrigger, Site};

    async fn planner(replies: Vec<String>) -> (ChatPlanner, Site, tempfile::TempDir) {
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
        std::fs::create_dir_all(paths.build_output_dir(&build.id)).unwrap();
        std::fs::write(
            paths.build_output_dir(&build.id).join("index.html"),
            "<html><h1 style=\"color:#777\">Hero</h1></html>",
        )
        .unwrap();

        let events = EventBus::new();
        let workspace = LiveEditWorkspace::new(
            store,
            paths,
            events.clone(),
            mock_services(HashMap::new(), replies),
        );
        (ChatPlanner::new(workspace, events), site, tmp)
    }

    fn plan_reply() -> String {
        serde_json::json!({
            "edits": [{"path": "index.html", "newContent": "<html><h1 style=\"color:#111\">Hero</h1></html>"}],
            "issues": ["low contrast hero"],
            "improvements": ["darker heading"],
            "rationale": "WCAG contrast"
        })
        .to_string()
    }

    #[tokio::test]
    async fn plan_then_execute_applies_edits_and_deploys() {
        let (planner, site, _tmp) = planner(vec![plan_reply()]).await;
        let plan = planner
            .plan(&site.id, "Improve hero contrast", &[])
            .await
            .unwrap();
        assert_eq!(plan.edits.len(), 1);
        assert_eq!(plan.issues, vec!["low contrast hero"]);

        let outcome = planner.execute(&site.id, &plan.plan_id).await.unwrap();
        assert_eq!(outcome.apply.applied, 1);
        assert!(outcome.edge_url.contains(".edge.test"));

        // The plan is consumed by execution.
        assert!(planner.current_plan(&site.id).await.is_none());
    }

    #[tokio::test]
    async fn stale_plan_id_is_rejected() {
        let (planner, site, _tmp) = planner(vec![plan_reply(), plan_reply()]).await;
        let first = planner.plan(&site.id, "one", &[]).await.unwrap();
        let second = planner.plan(&site.id, "two", &[]).await.unwrap();
        assert_ne!(first.plan_id, second.plan_id);

        // The first plan was superseded.
        let err = planner.execute(&site.id, &first.plan_id).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::UnknownPlan { .. }));
        planner.execute(&site.id, &second.plan_id).await.unwrap();
    }
}
