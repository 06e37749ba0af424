use admission::{config::AppConfig, init_admission, init_tracing};
use anyhow::Context;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    // Config file path from the command line, defaults otherwise
    let mut config = match env::args().nth(1) {
        Some(path) => AppConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => AppConfig::default_config(),
    };

    // Store credentials only ever come from the environment
    config.apply_env();
    config.validate().context("Invalid configuration")?;

    init_admission(config)
        .await
        .context("Admission service error")?;

    Ok(())
}
