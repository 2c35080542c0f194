pub mod config;
pub mod conversation;
pub mod gateway;
pub mod messaging;
pub mod notifications;
pub mod state;
pub mod transport;

pub use config::EngineConfig;
pub use conversation::{ConversationStore, ConversationView, StoreError};
pub use messaging::{Draft, PipelineError, SendPipeline};
pub use notifications::{CounterSnapshot, NotificationCenter, NotificationError};
pub use state::Engine;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // A subscriber installed by the embedding application wins.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
