//! Consume the initial-sync and fetch-content queues.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chrono::Duration;
use envconfig::Envconfig;

use sift_common::accounts::AccountStore;
use sift_common::crypto::TokenCipher;
use sift_common::database::build_pool;
use sift_common::health::HealthRegistry;
use sift_common::lockslots::{RedisSlotStore, UserSlots};
use sift_common::metrics::{serve, setup_metrics_routes};
use sift_common::pgqueue::PgQueue;
use sift_common::staging::StagingStore;
use sift_common::tasks::TaskKind;

use config::Config;
use dispatcher::{DispatchWorker, DispatcherContext};
use fetcher::{FetchWorker, FetcherContext};

mod config;
mod dispatcher;
mod error;
mod fetcher;
mod gmail;
mod parse;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let pool = build_pool(&config.database_url, config.max_pg_connections)
        .expect("failed to create database pool");

    let cipher = TokenCipher::from_keys(&config.encryption_keys).expect("invalid encryption keys");
    let slot_store = RedisSlotStore::new(config.redis_url.clone()).expect("invalid redis url");
    let slots = UserSlots::new(
        Arc::new(slot_store),
        config.max_slots_per_user,
        config.slot_ttl.0,
    );

    let gmail = || {
        gmail::GmailClient::new(
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
            config.google_token_url.clone(),
            config.gmail_api_base.clone(),
            config.request_timeout.0,
        )
    };

    let dispatcher_context = Arc::new(DispatcherContext {
        accounts: AccountStore::new_from_pool(pool.clone()),
        cipher: cipher.clone(),
        gmail: gmail(),
        fetch_queue: PgQueue::new_from_pool(TaskKind::FetchContent.queue_name(), pool.clone()),
        emails_per_batch: config.emails_per_batch,
        max_retries: config.max_retries,
    });

    let fetcher_context = Arc::new(FetcherContext {
        accounts: AccountStore::new_from_pool(pool.clone()),
        staging: StagingStore::new_from_pool(pool.clone()),
        cipher,
        gmail: gmail(),
        slots,
        fetch_queue: PgQueue::new_from_pool(TaskKind::FetchContent.queue_name(), pool.clone()),
        relevance_queue: PgQueue::new_from_pool(TaskKind::Relevance.queue_name(), pool.clone()),
        max_retries: config.max_retries,
        post_batch_sleep: config.post_batch_sleep.0,
    });

    let liveness = HealthRegistry::new("liveness");
    let dispatcher_liveness = liveness.register("dispatcher", Duration::seconds(60));
    let fetcher_liveness = liveness.register("fetcher", Duration::seconds(60));
    let retry_policy = config.retry_policy.provide();

    let dispatch_worker = DispatchWorker::new(
        &config.worker_name,
        PgQueue::new_from_pool(TaskKind::InitialSync.queue_name(), pool.clone()),
        dispatcher_context,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        retry_policy,
        dispatcher_liveness,
    );
    let fetch_worker = FetchWorker::new(
        &config.worker_name,
        PgQueue::new_from_pool(TaskKind::FetchContent.queue_name(), pool),
        fetcher_context,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        retry_policy,
        fetcher_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    tokio::select! {
        result = dispatch_worker.run() => {
            tracing::error!("dispatch worker exited: {:?}", result);
        }
        result = fetch_worker.run() => {
            tracing::error!("fetch worker exited: {:?}", result);
        }
    }
}

pub async fn index() -> &'static str {
    "mailsift sync worker"
}
