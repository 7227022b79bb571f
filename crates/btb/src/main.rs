use std::sync::Arc;

use btb_core::{config::Config, store::Store};

#[tokio::main]
async fn main() -> Result<(), btb_core::Error> {
    btb_core::logging::init("btb")?;

    let cfg = Arc::new(Config::load()?);
    let store = Arc::new(Store::open(&cfg.database_file)?);
    tracing::info!(
        broadcasting = cfg.broadcasting_enabled(),
        "configuration loaded"
    );

    btb_telegram::router::run(cfg, store)
        .await
        .map_err(|e| btb_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
