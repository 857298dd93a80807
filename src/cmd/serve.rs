//! Long-running service: `shipwright serve`.

use anyhow::Result;
use shipwright::config::ShipwrightConfig;
use shipwright::server;
use tokio_util::sync::CancellationToken;

use super::{build_scheduler, open_db};

pub async fn cmd_serve(config: &ShipwrightConfig, bind: Option<&str>) -> Result<()> {
    let db = open_db(config)?;
    let scheduler = build_scheduler(config, db)?;
    let bind = bind.unwrap_or(config.server.bind.as_str());

    let shutdown = CancellationToken::new();
    tokio::spawn(server::cancel_on_ctrl_c(shutdown.clone()));
    server::serve(scheduler, bind, shutdown).await
}
