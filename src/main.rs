//! Entrypoint. Each stage in `SPEC_FULL.md` §4 is independently
//! deployable; `Stage` selects which one this process instance runs, so
//! the same binary image serves every role in production while `all`
//! keeps a single-process mode for local development (grounded on
//! `other_examples/manifests/miketigerblue-rust-feed-ingestor`'s
//! tracing-init + migrations + metrics-server + work-loop shape, and
//! `sideseat-sideseat`/`lvzzzx-chronicle-rs` for the `clap` subcommand
//! layer the teacher itself doesn't have).

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rss_pipeline::broker::Broker;
use rss_pipeline::config::Config;
use rss_pipeline::delivery::{DeliveryRouter, DeliverySink};
use rss_pipeline::domain::ReadyPost;
use rss_pipeline::feed_poller::{FeedPoller, NEW_POSTS_SUBJECT};
use rss_pipeline::model_client::ChatModelClient;
use rss_pipeline::repository::{PgRepository, Repository};
use rss_pipeline::repository_rpc::RepositoryRpc;
use rss_pipeline::scorer::{Scorer, RELEVANT_POSTS_SUBJECT};
use rss_pipeline::text_extractor::HtmlTextExtractor;
use rss_pipeline::writer::{Writer, READY_POSTS_SUBJECT};

#[derive(Parser)]
#[command(name = "rss-pipeline", about = "Personalized news delivery pipeline")]
struct Cli {
    #[command(subcommand)]
    stage: Stage,
}

#[derive(Subcommand)]
enum Stage {
    /// Feed Poller: discover new entries and emit NewPost.
    Poll,
    /// Relevance Scorer: consume NewPost, emit RelevantPost.
    Score,
    /// Summary Writer: consume RelevantPost, emit ReadyPost.
    Write,
    /// Delivery Router: consume ReadyPost and deliver with per-user pacing.
    Deliver,
    /// Repository RPC: serve the broker-mediated CRUD surface.
    Repository,
    /// Run every stage in this one process (local development).
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let cancellation = CancellationToken::new();
    {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancellation.cancel();
            }
        });
    }

    {
        let bind = config.metrics_bind.clone();
        tokio::spawn(async move {
            if let Err(e) = rss_pipeline::metrics::serve(&bind).await {
                error!(error = %e, "metrics server exited");
            }
        });
    }

    match cli.stage {
        Stage::Poll => run_poll(&config, cancellation).await,
        Stage::Score => run_score(&config, cancellation).await,
        Stage::Write => run_write(&config, cancellation).await,
        Stage::Deliver => run_deliver(&config, cancellation).await,
        Stage::Repository => run_repository(&config, cancellation).await,
        Stage::All => run_all(&config, cancellation).await,
    }
}

async fn connect_repository(config: &Config) -> anyhow::Result<Arc<dyn Repository>> {
    Ok(Arc::new(PgRepository::connect(&config.database_url).await?))
}

async fn run_poll(config: &Config, cancellation: CancellationToken) -> anyhow::Result<()> {
    let repository = connect_repository(config).await?;
    let broker = Broker::connect(&config.nats_url).await?;
    broker.declare_queue(NEW_POSTS_SUBJECT).await?;
    let extractor = Arc::new(HtmlTextExtractor::new(reqwest::Client::new(), config.extractor_timeout));
    let poller = FeedPoller::new(repository, broker, extractor, config);

    let mut ticker = tokio::time::interval(config.poll_interval);
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = ticker.tick() => poller.poll_once().await,
        }
    }
    info!("feed poller shut down");
    Ok(())
}

async fn run_score(config: &Config, cancellation: CancellationToken) -> anyhow::Result<()> {
    let repository = connect_repository(config).await?;
    let broker = Broker::connect(&config.nats_url).await?;
    broker.declare_queue(NEW_POSTS_SUBJECT).await?;
    broker.declare_queue(RELEVANT_POSTS_SUBJECT).await?;

    let model = Arc::new(ChatModelClient::new(
        reqwest::Client::new(),
        config.scoring_model_key.clone(),
        config.scoring_model_url.clone(),
        "scoring-model".into(),
    ));
    let scorer = Arc::new(Scorer::new(repository, broker.clone(), model, config));

    let consumer = broker.consumer(NEW_POSTS_SUBJECT, "scorer").await?;
    let mut messages = consumer.messages().await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            m = messages.next() => m,
        };
        let Some(message) = next else { break };
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "consumer error");
                continue;
            }
        };

        let event = match serde_json::from_slice(&message.payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed NewPost, acking to drop");
                let _ = message.ack().await;
                continue;
            }
        };

        match scorer.handle(event).await {
            Ok(()) => {
                let _ = message.ack().await;
            }
            Err(e) if e.should_ack() => {
                let _ = message.ack().await;
            }
            Err(e) => warn!(error = %e, "leaving NewPost unacked for redelivery"),
        }
    }
    info!("relevance scorer shut down");
    Ok(())
}

async fn run_write(config: &Config, cancellation: CancellationToken) -> anyhow::Result<()> {
    let broker = Broker::connect(&config.nats_url).await?;
    broker.declare_queue(RELEVANT_POSTS_SUBJECT).await?;
    broker.declare_queue(READY_POSTS_SUBJECT).await?;

    let model = Arc::new(ChatModelClient::new(
        reqwest::Client::new(),
        config.writing_model_key.clone(),
        config.writing_model_url.clone(),
        "writing-model".into(),
    ));
    let writer = Arc::new(Writer::new(broker.clone(), model, config));

    let consumer = broker.consumer(RELEVANT_POSTS_SUBJECT, "writer").await?;
    let mut messages = consumer.messages().await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            m = messages.next() => m,
        };
        let Some(message) = next else { break };
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "consumer error");
                continue;
            }
        };

        let event = match serde_json::from_slice(&message.payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed RelevantPost, acking to drop");
                let _ = message.ack().await;
                continue;
            }
        };

        // Writer::handle always acks (spec.md §5 broker discipline table).
        let _ = writer.handle(event).await;
        let _ = message.ack().await;
    }
    info!("summary writer shut down");
    Ok(())
}

struct LoggingDeliverySink;

#[async_trait::async_trait]
impl DeliverySink for LoggingDeliverySink {
    async fn send(&self, post: &ReadyPost) -> anyhow::Result<()> {
        // The outbound front-end integration is out of scope (spec.md §1
        // Non-goals); this sink stands in for it.
        info!(user_id = post.user_id, news = %post.news, "would deliver post");
        Ok(())
    }
}

async fn run_deliver(config: &Config, cancellation: CancellationToken) -> anyhow::Result<()> {
    let broker = Broker::connect(&config.nats_url).await?;
    broker.declare_queue(READY_POSTS_SUBJECT).await?;

    let router = Arc::new(DeliveryRouter::new(Arc::new(LoggingDeliverySink), config.pacing_interval));

    let consumer = broker.consumer(READY_POSTS_SUBJECT, "delivery-router").await?;
    let mut messages = consumer.messages().await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            m = messages.next() => m,
        };
        let Some(message) = next else { break };
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "consumer error");
                continue;
            }
        };

        // Auto-ack: this is a hot path where replay is harmless
        // (spec.md §5 broker discipline table).
        let _ = message.ack().await;

        match serde_json::from_slice(&message.payload) {
            Ok(post) => router.dispatch(post).await,
            Err(e) => warn!(error = %e, "malformed ReadyPost, dropping"),
        }
    }
    router.shutdown();
    info!("delivery router shut down");
    Ok(())
}

async fn run_repository(config: &Config, cancellation: CancellationToken) -> anyhow::Result<()> {
    let repository = connect_repository(config).await?;
    let broker = Broker::connect(&config.nats_url).await?;
    let rpc = Arc::new(RepositoryRpc::new(repository, broker));
    let handles = rpc.spawn_all(cancellation.clone());

    cancellation.cancelled().await;
    for handle in handles {
        let _ = handle.await;
    }
    info!("repository rpc shut down");
    Ok(())
}

/// Local development convenience: every stage in one process, sharing
/// nothing but the cancellation token (each stage owns its own repository
/// and broker connections, matching how they'd run as separate processes).
async fn run_all(config: &Config, cancellation: CancellationToken) -> anyhow::Result<()> {
    tokio::try_join!(
        run_poll(config, cancellation.clone()),
        run_score(config, cancellation.clone()),
        run_write(config, cancellation.clone()),
        run_deliver(config, cancellation.clone()),
        run_repository(config, cancellation.clone()),
    )?;
    Ok(())
}
