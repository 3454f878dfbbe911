use std::env;
use std::path::PathBuf;

use erp::app;
use erp::config::ErpConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Optional first argument: path to the TOML config file
    let config_path = env::args().nth(1).map(PathBuf::from);
    let config = ErpConfig::load(config_path.as_deref())?;

    log::info!(
        "starting with database {} and uploads in {}",
        config.database_path.display(),
        config.upload_dir.display()
    );

    // Start the web application
    app::run(config).await?;

    Ok(())
}
