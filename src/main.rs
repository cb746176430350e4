//! Entry point for the bonus allocation service binary.
//!
//! Running this binary starts the HTTP server.  Configuration comes from
//! the environment (`BONUS_BIND_ADDR`, `BONUS_CREDENTIALS_PATH` and
//! friends, see [`bonus_engine::config::AppConfig::from_env`]); anything
//! unset falls back to the portal defaults.

use bonus_engine::config::AppConfig;
use bonus_engine::{api, logging};

#[tokio::main]
async fn main() {
    logging::init();
    let config = AppConfig::from_env();
    if let Err(err) = api::serve(config).await {
        tracing::error!("server error: {err:#}");
        std::process::exit(1);
    }
}
