// ABOUTME: Status command implementation.
// ABOUTME: Reads mode, preparation and health of each deployment without taking the lock.

use super::context::Context;
use offspot_demo::compose::ComposeProject;
use offspot_demo::error::Result;
use offspot_demo::host::LocalHost;
use offspot_demo::toggle::current_mode;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct DeploymentStatus<'a> {
    ident: &'a str,
    fqdn: &'a str,
    http_port: u16,
    mode: String,
    prepared: bool,
    healthy: bool,
    image_url: Option<String>,
}

pub async fn status(ctx: Context) -> Result<()> {
    let host = LocalHost;
    let compose = ComposeProject::new(&host, &ctx.config.docker.compose_program);

    if ctx.registry.is_empty() {
        ctx.output.success("No deployment configured");
        return Ok(());
    }

    for deployment in ctx.registry.iter() {
        let status = DeploymentStatus {
            ident: deployment.ident.as_str(),
            fqdn: &deployment.fqdn,
            http_port: deployment.http_port,
            mode: current_mode(deployment).to_string(),
            prepared: deployment.is_prepared(),
            healthy: compose.is_healthy(&deployment.paths.compose_path()).await,
            image_url: deployment.last_image_url(),
        };
        let line = format!(
            "{:<16} {:<40} port={:<5} mode={:<5} prepared={:<5} healthy={}",
            status.ident,
            status.fqdn,
            status.http_port,
            status.mode,
            status.prepared,
            status.healthy
        );
        ctx.output.record(&line, &status);
    }
    Ok(())
}
