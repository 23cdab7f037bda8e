use std::process;
use std::sync::Arc;
use tracing::{error, info};

use crossplay_gateway::config::GatewayConfig;
use crossplay_gateway::core::types::Version;
use crossplay_gateway::error::Result;
use crossplay_gateway::items::table::ItemDefinitionTable;
use crossplay_gateway::service::daemon::GameServer;
use crossplay_gateway::utils::logging::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(&path)?,
        None => GatewayConfig::from_env()?,
    };

    let log_config = LogConfig {
        app_name: config.logging.app_name.clone(),
        log_level: config.logging.log_level,
        json_format: config.logging.json_format,
        log_dir: config.logging.log_file_path.clone(),
        log_to_stdout: config.logging.log_to_console,
    };
    init_logging(&log_config);

    info!(address = %config.server.address, "starting gateway");
    let server = GameServer::new(Arc::new(config), Arc::new(ItemDefinitionTable::default()));
    match server.run(Version::V4).await {
        Ok(()) => {
            info!("server shutdown successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "server error encountered");
            process::exit(1);
        }
    }
}
