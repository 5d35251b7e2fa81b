mod cli;

use anyhow::Context;
use clap::Parser;
use token_keeper::config::AppConfig;
use token_keeper::logging::{self, LogOptions};
use token_keeper::services::CredentialServices;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::{Args, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let _guard = logging::init_logging(&LogOptions {
        json: args.json_logs || config.log_json,
        log_dir: config.log_dir.clone(),
    })?;

    let services = CredentialServices::from_config(&config)
        .await
        .context("failed to initialize credential services")?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&services, &config).await?,
        Commands::RunJob { name } => {
            let run = services.run_job(&name).await;
            services.shutdown().await;
            let run = run?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            if !run.success {
                anyhow::bail!("job {} failed", run.job);
            }
        }
        Commands::Health => {
            let vault_ok = services.vault_health_check().await;
            let report = serde_json::json!({
                "vault": vault_ok,
                "backend": services.vault.backend_name(),
                "scheduler": services.scheduler_status(),
                "metrics": services.get_metrics().await,
            });
            services.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !vault_ok {
                anyhow::bail!("vault health check failed");
            }
        }
    }

    Ok(())
}

async fn serve(services: &CredentialServices, config: &AppConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    if let Some(dir) = &config.log_dir {
        logging::start_retention_cleanup(dir.clone(), cancel.child_token());
    }

    services.start()?;
    info!(
        next_runs = ?services.scheduler_status().next_runs,
        "token-keeper running, press Ctrl-C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }

    info!("Shutdown requested");
    cancel.cancel();
    services.shutdown().await;
    Ok(())
}
