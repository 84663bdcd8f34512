use podpipe_ai::OpenAiProvider;
use podpipe_common::config::AppConfig;
use podpipe_eventbus::{ControlListener, EventBus};
use podpipe_gpulock::GpuLock;
use podpipe_idempotency::IdempotencyRegister;
use podpipe_status::StatusAggregator;
use podpipe_store::EpisodeStore;
use podpipe_substrate::SubstrateClient;
use podpipe_summarize::{Deps, SummarizeSubscriber};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("podpipe=info".parse()?))
        .init();

    info!("podpipe summarization subscriber starting");

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
    let idempotency = IdempotencyRegister::new(substrate.clone());
    let status = StatusAggregator::new(substrate.clone(), config.status_ttl_secs);
    let control = ControlListener::new(&config.redis_url)?;

    let chat = OpenAiProvider::new(&config.openai_api_key);

    let deps = Deps {
        bus,
        idempotency,
        gpu_lock,
        status,
        store,
        chat,
    };

    let consumer_name = format!("summarize-{}", uuid::Uuid::new_v4());
    let subscriber = SummarizeSubscriber::new(deps, consumer_name);

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
        ctrl_c_token.cancel();
    });

    subscriber.run(shutdown, &control).await?;

    info!("podpipe summarization subscriber stopped");
    Ok(())
}
