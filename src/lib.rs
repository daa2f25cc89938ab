use config::Config;
use consumer::Handler;
use message::Message;
use registry::Registry;
use service::Outbox;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod registry;
pub mod service;
pub mod store;
pub mod table;

pub use consumer::{consume, Batch, LogHandler};
pub use error::Error;
pub use message::MessageState;
pub use table::{Schema, Table};

/// Returns a builder for the outbox consumer process.
///
/// Installs logging, prepares the outbox table (retrying until the store is
/// reachable), then delivers pending messages through `handler` until Ctrl-C.
#[bon::builder(finish_fn = start)]
pub async fn run<H>(handler: H, config: Option<Config>) -> eyre::Result<()>
where
    H: Handler<Message>,
{
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("OUTBOXMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("OUTBOXMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let registry = Registry::new();

    let outbox = loop {
        match Outbox::open(&registry, &config).await {
            Ok(outbox) => break outbox,
            Err(e) if !e.is_retryable() => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Failed to open outbox store: {e}");
                tokio::time::sleep(config.init_retry()).await;
            }
        }
    };

    let schema = outbox.schema();
    let statements = if config.reset_on_start {
        schema.reset_statements()
    } else {
        schema.create_statements()
    };

    outbox
        .initialize_with_retry(&statements, config.init_retry())
        .await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
            shutdown.cancel();
        }
    });

    outbox
        .run_consumer::<Message, H>(
            &handler,
            config.batch_size(),
            config.poll_interval(),
            shutdown,
        )
        .await?;

    outbox.store().close().await;

    Ok(())
}
