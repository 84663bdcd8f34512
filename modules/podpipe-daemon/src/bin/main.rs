use std::sync::Arc;

use podpipe_ai::OpenAiProvider;
use podpipe_common::config::AppConfig;
use podpipe_common::security::UrlValidator;
use podpipe_daemon::{Daemon, Deps};
use podpipe_eventbus::{ControlListener, EventBus};
use podpipe_gpulock::GpuLock;
use podpipe_status::StatusAggregator;
use podpipe_store::EpisodeStore;
use podpipe_substrate::SubstrateClient;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("podpipe=info".parse()?))
        .init();

    info!("podpipe transcription daemon starting");

    let config = AppConfig::from_env()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let store = EpisodeStore::new(pool);
    store.migrate().await?;

    let substrate = SubstrateClient::connect(&config.redis_url).await?;
    let bus = EventBus::new(substrate.connection());
    let gpu_lock = GpuLock::new(substrate.clone(), config.gpu_lock_timeout_secs);
    let status = StatusAggregator::new(substrate.clone(), config.status_ttl_secs);
    let control = ControlListener::new(&config.redis_url)?;

    let provider = Arc::new(OpenAiProvider::new(&config.openai_api_key));

    let deps = Deps {
        bus,
        gpu_lock,
        status,
        store,
        transcriber: provider.clone(),
        diarizer: Arc::new(podpipe_ai::NullDiarizer),
        http: reqwest::Client::new(),
        url_validator: UrlValidator::new(),
        temp_audio_dir: config.temp_audio_dir.clone(),
    };

    let consumer_name = format!("daemon-{}", uuid::Uuid::new_v4());
    let mut daemon = Daemon::new(deps, consumer_name);
    daemon.recover().await?;

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
        ctrl_c_token.cancel();
    });

    daemon.run(shutdown, &control).await?;

    info!("podpipe transcription daemon stopped");
    Ok(())
}
