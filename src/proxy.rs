// ABOUTME: Regenerates the shared edge proxy that routes public FQDNs to deployments.
// ABOUTME: Hands the full deployment list to the configured generator command.

use crate::config::ProxyConfig;
use crate::host::{CommandLine, Host, HostError};
use crate::registry::DeploymentRegistry;

/// Run the proxy generator with every deployment's `ident:alias:name:subs` entry.
///
/// Does nothing when no generator command is configured.
pub async fn reconfigure_proxy<H: Host>(
    host: &H,
    settings: &ProxyConfig,
    registry: &DeploymentRegistry,
) -> Result<(), HostError> {
    let Some((program, args)) = settings.command.split_first() else {
        tracing::debug!("No proxy command configured, skipping reconfiguration");
        return Ok(());
    };

    let entries = registry.proxy_entries();
    tracing::info!("Reconfiguring edge proxy for {} deployment(s)", registry.len());
    host.run(&CommandLine::new(program).args(args.iter().cloned()).arg(entries))
        .await?;
    Ok(())
}
