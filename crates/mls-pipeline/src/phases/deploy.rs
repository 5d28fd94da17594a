use mls_types::{BuildPhase, ProgressEvent};

use crate::context::BuildContext;
use crate::error::{PipelineError, PipelineResult};

const PHASE: BuildPhase = BuildPhase::Deploy;

/// Uploads the optimized tree under `mls-{siteId}` and records the edge URL
/// on the site row.
pub async fn run(ctx: &mut BuildContext) -> PipelineResult<String> {
    ctx.step_start(PHASE, "uploading optimized output to the edge");
    ctx.check_cancelled()?;

    let project = ctx.site.edge_project_name();
    let output_dir = ctx.output_dir();
    let result = ctx
        .services
        .edge
        .deploy(&project, &output_dir, &ctx.site.source_url)
        .await
        .map_err(|err| PipelineError::from_upstream(PHASE, "upload", err))?;

    ctx.check_cancelled()?;
    ctx.store
        .update_site_after_build(
            &ctx.site.id,
            Some(&result.url),
            Some(&project),
            ctx.build.pages_total,
            ctx.build.optimized_size.total(),
        )
        .await
        .map_err(|err| PipelineError::from_store(PHASE, "site-update", err))?;
    ctx.site.edge_url = Some(result.url.clone());
    ctx.site.edge_project = Some(project);

    ctx.log("info", format!("deployed to {}", result.url));
    ctx.emit(ProgressEvent::Deploy {
        message: format!("live at {}", result.url),
    });
    ctx.step_complete(PHASE, serde_json::json!({"edgeUrl": result.url}));
    Ok(result.url)
}
