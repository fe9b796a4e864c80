// ABOUTME: Refresh command implementation.
// ABOUTME: Reconciles every deployment and prints a per-deployment summary.

use super::context::Context;
use offspot_demo::deploy::DeployOrchestrator;
use offspot_demo::diagnostics::Diagnostics;
use offspot_demo::error::{Error, Result};

pub async fn refresh(mut ctx: Context) -> Result<()> {
    let clients = ctx.clients("refresh")?;
    let orchestrator =
        DeployOrchestrator::new(&ctx.config, &clients.host, &clients.engine, &clients.imager);

    ctx.output.start(None);
    let count = ctx.registry.len();
    ctx.output.progress(&format!("Refreshing {} deployment(s)", count));
    let mut diag = Diagnostics::default();
    let report = orchestrator.refresh_all(&mut ctx.registry, &mut diag).await;
    ctx.report(&diag);
    let report = report?;

    for (ident, reason) in &report.failed {
        ctx.output.error(&format!("{}: {}", ident, reason));
    }
    let summary = format!(
        "Refreshed: {} deployed, {} up to date, {} undeployed, {} failed",
        report.deployed.len(),
        report.up_to_date.len(),
        report.undeployed.len(),
        report.failed.len()
    );
    ctx.output.record(&summary, &report);

    if report.is_success() {
        Ok(())
    } else {
        Err(Error::RefreshFailed(report.failed.len()))
    }
}
