use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use faids::cli::DaemonOpts;
use faids::{config, logging, server, Config};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let config_path = opts.config.clone().unwrap_or_else(config::default_path);
    let mut cfg = Config::load(&config_path)?;
    cfg.override_with(opts.bind.as_deref(), opts.port, opts.debug);
    cfg.validate().context("invalid settings")?;

    logging::init(cfg.debug_mode, opts.log_file.as_deref())?;
    info!(
        config = %config_path.display(),
        addr = %cfg.listen_addr(),
        debug = cfg.debug_mode,
        "starting FaIDS relay"
    );
    if cfg.bind_address == "0.0.0.0" {
        warn!("binding to 0.0.0.0 exposes the relay on every network interface");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for Ctrl-C; stop the process to shut down");
                std::future::pending::<()>().await;
            }
        };
        server::serve(&cfg, shutdown).await
    })?;

    info!("relay stopped");
    Ok(())
}
