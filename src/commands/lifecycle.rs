// ABOUTME: Single-deployment commands: deploy, undeploy, toggle and prepare.
// ABOUTME: Each resolves the deployment, then drives the orchestrator under the lock.

use super::context::Context;
use offspot_demo::deploy::{DeployOptions, DeployOrchestrator};
use offspot_demo::diagnostics::Diagnostics;
use offspot_demo::error::{Error, Result};
use offspot_demo::manifest::PrepareOutcome;
use offspot_demo::toggle::Mode;

fn ensure_known(ctx: &Context, ident: &str) -> Result<()> {
    if ctx.registry.contains(ident) {
        Ok(())
    } else {
        Err(Error::UnknownDeployment(ident.to_string()))
    }
}

pub async fn deploy(mut ctx: Context, ident: &str, options: DeployOptions) -> Result<()> {
    ensure_known(&ctx, ident)?;
    let clients = ctx.clients("deploy")?;
    let orchestrator =
        DeployOrchestrator::new(&ctx.config, &clients.host, &clients.engine, &clients.imager);

    ctx.output.start(Some(ident));
    ctx.output.progress(&format!("Deploying {}", ident));
    let mut diag = Diagnostics::default();
    let result = orchestrator
        .deploy(&mut ctx.registry, ident, options, &mut diag)
        .await;
    ctx.report(&diag);
    result?;

    if let Some(deployment) = ctx.registry.get(ident) {
        if let Some(url) = deployment.download_url()
            && let Err(e) = deployment.write_last_image_url(url)
        {
            let message = format!("failed to record image of {}: {}", ident, e);
            ctx.output.warning(&message);
        }
        ctx.output
            .success(&format!("Deployed {} at https://{}", ident, deployment.fqdn));
    }
    Ok(())
}

pub async fn undeploy(mut ctx: Context, ident: &str, keep_image: bool) -> Result<()> {
    ensure_known(&ctx, ident)?;
    let clients = ctx.clients("undeploy")?;
    let orchestrator =
        DeployOrchestrator::new(&ctx.config, &clients.host, &clients.engine, &clients.imager);

    ctx.output.start(Some(ident));
    let deployment = ctx
        .registry
        .get_mut(ident)
        .ok_or_else(|| Error::UnknownDeployment(ident.to_string()))?;
    orchestrator.undeploy(deployment, keep_image).await?;
    ctx.output.success(&format!("Undeployed {}", ident));
    Ok(())
}

pub async fn toggle(mut ctx: Context, ident: &str, mode: Mode) -> Result<()> {
    ensure_known(&ctx, ident)?;
    ctx.output.start(Some(ident));
    let clients = ctx.clients("toggle")?;
    let orchestrator =
        DeployOrchestrator::new(&ctx.config, &clients.host, &clients.engine, &clients.imager);

    let deployment = ctx
        .registry
        .get(ident)
        .ok_or_else(|| Error::UnknownDeployment(ident.to_string()))?;
    orchestrator.toggle(deployment, mode).await?;
    ctx.output.success(&format!("{} is now in {} mode", ident, mode));
    Ok(())
}

pub async fn prepare(mut ctx: Context, ident: &str, force: bool) -> Result<()> {
    ensure_known(&ctx, ident)?;
    ctx.output.start(Some(ident));
    let clients = ctx.clients("prepare")?;
    let orchestrator =
        DeployOrchestrator::new(&ctx.config, &clients.host, &clients.engine, &clients.imager);

    let deployment = ctx
        .registry
        .get(ident)
        .ok_or_else(|| Error::UnknownDeployment(ident.to_string()))?;
    match orchestrator.prepare(deployment, force).await? {
        PrepareOutcome::AlreadyPrepared => {
            ctx.output.success(&format!("{} was already prepared", ident))
        }
        PrepareOutcome::Prepared {
            subdomains,
            pulled,
            pull_failures,
        } => {
            if pull_failures > 0 {
                ctx.output.warning(&format!(
                    "{} image(s) could not be pulled; compose will retry on start",
                    pull_failures
                ));
            }
            ctx.output.success(&format!(
                "Prepared {} ({} image(s) pulled, subdomains: {})",
                ident,
                pulled,
                subdomains.join(",")
            ));
        }
    }
    Ok(())
}
