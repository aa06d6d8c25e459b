//! Consume the staging-to-applications transfer queue.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chrono::Duration;
use envconfig::Envconfig;

use sift_common::applications::ApplicationStore;
use sift_common::crypto::TokenCipher;
use sift_common::database::build_pool;
use sift_common::health::HealthRegistry;
use sift_common::metrics::{serve, setup_metrics_routes};
use sift_common::pgqueue::PgQueue;
use sift_common::staging::StagingStore;
use sift_common::tasks::TaskKind;

use config::Config;
use worker::{TransferContext, TransferWorker};

mod config;
mod error;
mod worker;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");

    let pool = build_pool(&config.database_url, config.max_pg_connections)
        .expect("failed to create database pool");

    let cipher = TokenCipher::from_keys(&config.encryption_keys).expect("invalid encryption keys");

    let context = Arc::new(TransferContext {
        staging: StagingStore::new_from_pool(pool.clone()),
        applications: ApplicationStore::new_from_pool(pool.clone()),
        cipher,
    });

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker", Duration::seconds(60));

    let worker = TransferWorker::new(
        &config.worker_name,
        PgQueue::new_from_pool(TaskKind::Transfer.queue_name(), pool),
        context,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        config.retry_policy.provide(),
        worker_liveness,
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

    if let Err(error) = worker.run().await {
        tracing::error!("transfer worker exited: {}", error);
    }
}

pub async fn index() -> &'static str {
    "mailsift transfer worker"
}
