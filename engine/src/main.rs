use anyhow::Context;
use mercato_engine::{init_tracing, Engine, EngineConfig};
use mercato_messaging::UserId;
use std::env;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = EngineConfig::from_env()?;
    let user = env::var("MERCATO_USER_ID").context("MERCATO_USER_ID is not set")?;
    let engine = Engine::connect_http(UserId::new(user), &config)?;
    info!(api = %config.api_base_url, push = %config.push_url, "starting Mercato engine");
    engine.start()?;

    let notifications = engine.notifications();
    if let Err(error) = notifications.refresh_all().await {
        warn!(%error, "initial counter refresh failed");
    }
    let mut counters = notifications.watch_counters();
    loop {
        let current = *counters.borrow_and_update();
        info!(
            messages = current.messages,
            activity = current.activity,
            total = current.total(),
            "unread counters"
        );
        tokio::select! {
            changed = counters.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown();
    Ok(())
}
