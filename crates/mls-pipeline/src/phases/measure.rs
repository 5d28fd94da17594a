use chrono::Utc;

use mls_types::{AlertFired, BuildPhase, MeasureStrategy, MeasurementComparison};

use crate::context::BuildContext;
use crate::error::{PipelineError, PipelineResult};

const PHASE: BuildPhase = BuildPhase::Measure;

/// Measures source and edge for both strategies, persists the comparisons
/// and evaluates alert rules against the optimized scores.
pub async fn run(ctx: &mut BuildContext, edge_url: &str) -> PipelineResult<()> {
    ctx.step_start(PHASE, "measuring source and edge endpoints");

    for strategy in MeasureStrategy::ALL {
        ctx.check_cancelled()?;
        let original = ctx
            .services
            .measurement
            .measure(&ctx.site.source_url, strategy)
            .await
            .map_err(|err| PipelineError::from_upstream(PHASE, "source", err))?;
        ctx.check_cancelled()?;
        let optimized = ctx
            .services
            .measurement
            .measure(edge_url, strategy)
            .await
            .map_err(|err| PipelineError::from_upstream(PHASE, "edge", err))?;

        if strategy == MeasureStrategy::Mobile {
            ctx.build.score_before = Some(original.performance);
            ctx.build.score_after = Some(optimized.performance);
        }

        let comparison = MeasurementComparison::compare(
            &ctx.site.id,
            Some(&ctx.build.id),
            strategy,
            original,
            optimized,
        );
        ctx.store
            .insert_measurement(&comparison)
            .await
            .map_err(|err| PipelineError::from_store(PHASE, "persist", err))?;
        ctx.log(
            "info",
            format!(
                "{}: {:.0} -> {:.0}, payload savings {} bytes",
                strategy.as_str(),
                comparison.original.performance,
                comparison.optimized.performance,
                comparison.payload_savings_bytes
            ),
        );

        evaluate_alerts(ctx, &comparison).await?;
    }

    ctx.step_complete(
        PHASE,
        serde_json::json!({
            "scoreBefore": ctx.build.score_before,
            "scoreAfter": ctx.build.score_after,
        }),
    );
    Ok(())
}

async fn evaluate_alerts(
    ctx: &mut BuildContext,
    comparison: &MeasurementComparison,
) -> PipelineResult<()> {
    let rules = ctx
        .store
        .list_alert_rules(&ctx.site.id)
        .await
        .map_err(|err| PipelineError::from_store(PHASE, "alerts", err))?;
    for rule in rules {
        let observed = match rule.metric.as_str() {
            "performance" => comparison.optimized.performance,
            "lcpMs" => comparison.optimized.vitals.lcp_ms,
            "ttfbMs" => comparison.optimized.vitals.ttfb_ms,
            "cls" => comparison.optimized.vitals.cls,
            _ => continue,
        };
        if rule.breached(observed) {
            let fired = AlertFired {
                id: mls_types::prefixed_id("alrt"),
                rule_id: rule.id.clone(),
                site_id: ctx.site.id.clone(),
                metric: rule.metric.clone(),
                observed,
                threshold: rule.threshold,
                fired_at: Utc::now(),
            };
            ctx.store
                .append_alert_fired(&fired)
                .await
                .map_err(|err| PipelineError::from_store(PHASE, "alerts", err))?;
            ctx.log(
                "warn",
                format!(
                    "alert {}: {} {:.2} breached threshold {:.2}",
                    rule.id, rule.metric, observed, rule.threshold
                ),
            );
        }
    }
    Ok(())
}
