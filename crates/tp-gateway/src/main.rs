// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tp_broker::InProcessBroker;
use tp_config::load_settings;
use tp_gateway::{build_app, AppState};
use tp_object_store::S3Storage;
use tp_sender::Sender;
use tp_store::PgStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tp-gateway", version, about = "Terraplane API gateway")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind: String,

    /// Path to the platform settings file.
    #[arg(long, default_value = "terraplane.toml")]
    config: PathBuf,

    /// Skip the database schema-revision assertion.
    #[arg(long)]
    no_assert_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = load_settings(&args.config).context("load settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tp={}", settings.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let user_agent = format!("tp-gateway/{}", tp_core::LIBRARY_VERSION);
    let store = Arc::new(
        PgStore::connect(
            &settings.database.connection_url(),
            &user_agent,
            !args.no_assert_schema,
        )
        .await
        .context("connect relational store")?,
    );

    let storage = S3Storage::new(
        &settings.object_store.endpoint,
        &settings.object_store.region,
        &settings.object_store.access_key,
        &settings.object_store.secret_key,
        settings.object_store.bucket.clone(),
    );
    storage.ensure_bucket().await.context("prepare bucket")?;
    let storage = Arc::new(storage);

    let broker = Arc::new(InProcessBroker::new(store.clone()));
    let sender = Sender::new(store.clone(), broker.clone(), settings.sender.clone());

    let state = Arc::new(AppState {
        sender,
        broker,
        store,
        storage,
    });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "tp-gateway listening");

    axum::serve(listener, app).await.context("serve")
}
