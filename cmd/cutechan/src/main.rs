//! # cutechan
//!
//! The server binary. Assembles the adapters selected by configuration and
//! compile-time features, starts the upkeep task and serves the API until
//! interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use api_adapters::{build_router, AppState, Metrics};
use chrono::Utc;
use configs::{LogFormat, LogSettings, Settings, StorageSettings};
use domains::BlobStore;
use services::{BanCache, IngestService, PostingService, Schedule, TokenManager, Upkeep, WorkerPool};
use storage_adapters::{LocalStore, ProcessThumbnailer, SqliteStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn blob_store(storage: &StorageSettings) -> anyhow::Result<Arc<dyn BlobStore>> {
    match storage {
        StorageSettings::Local { root } => {
            tokio::fs::create_dir_all(root)
                .await
                .with_context(|| format!("creating {}", root.display()))?;
            info!(root = %root.display(), "local blob store");
            Ok(Arc::new(LocalStore::new(root.clone())))
        }

        #[cfg(feature = "media-sftp")]
        StorageSettings::Sftp {
            host,
            port,
            user,
            private_key,
            passphrase,
            root,
        } => {
            use secrecy::ExposeSecret;
            use storage_adapters::media::sftp::{Ssh2Connector, Ssh2Settings};
            use storage_adapters::SftpStore;

            let connector = Ssh2Connector::new(Ssh2Settings {
                host: host.clone(),
                port: *port,
                user: user.clone(),
                private_key: private_key.clone(),
                passphrase: passphrase.as_ref().map(|p| p.expose_secret().to_string()),
            });
            info!(host = %host, root = %root, "sftp blob store");
            Ok(Arc::new(SftpStore::spawn(Arc::new(connector), root.clone())))
        }

        #[cfg(feature = "media-s3")]
        StorageSettings::S3 {
            bucket,
            prefix,
            endpoint,
            region,
            access_key_id,
            secret_access_key,
        } => {
            use secrecy::ExposeSecret;
            use storage_adapters::media::object::{S3Client, S3Options};
            use storage_adapters::ObjectStore;

            let credentials = match (access_key_id, secret_access_key) {
                (Some(id), Some(secret)) => Some((
                    id.expose_secret().to_string(),
                    secret.expose_secret().to_string(),
                )),
                (None, None) => None,
                _ => anyhow::bail!("storage.access_key_id and storage.secret_access_key must be set together"),
            };
            let opts = S3Options {
                endpoint: endpoint.clone(),
                region: region.clone(),
                credentials,
            };
            let client = S3Client::from_env(bucket.clone(), opts).await;
            info!(bucket = %bucket, prefix = %prefix, "object blob store");
            Ok(Arc::new(ObjectStore::new(Arc::new(client), prefix.clone())))
        }

        #[allow(unreachable_patterns)]
        other => anyhow::bail!("storage backend not compiled into this binary: {other:?}"),
    }
}

async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading configuration")?;
    init_tracing(&settings.log);

    // 1. Adapters
    let db = Arc::new(
        SqliteStore::connect(&settings.database.url, settings.database.max_connections)
            .await
            .context("opening database")?,
    );
    let store = blob_store(&settings.storage).await?;
    let backend = Arc::new(ProcessThumbnailer::new(
        settings.thumbnailer.program.clone(),
        settings.thumbnailer.isolation_user.clone(),
    ));
    let thumbnailer = Arc::new(WorkerPool::spawn(backend, settings.thumbnailer.workers));

    // 2. Services
    let tokens = Arc::new(TokenManager::new(db.clone(), settings.sessions.ttl_days));
    let bans = Arc::new(BanCache::new(db.clone()));
    let banned = bans.refresh(Utc::now()).await.context("loading bans")?;
    info!(banned, "ban cache loaded");
    let ingest = Arc::new(IngestService::new(
        db.clone(),
        db.clone(),
        store.clone(),
        thumbnailer,
        tokens.clone(),
        settings.uploads.max_size,
    ));
    let posting = Arc::new(PostingService::new(
        db.clone(),
        bans.clone(),
        settings.uploads.max_files,
    ));

    // 3. Upkeep
    let shutdown = CancellationToken::new();
    let upkeep = Upkeep::new(
        tokens.clone(),
        db.clone(),
        db.clone(),
        store.clone(),
        bans.clone(),
        Schedule::default(),
    );
    let upkeep_task = tokio::spawn(upkeep.run(shutdown.clone()));

    // 4. HTTP
    let body_limit = settings.body_limit().context("upload limits overflow")?;
    let state = AppState {
        ingest,
        tokens,
        posting,
        bans,
        metrics: Arc::new(Metrics::new()),
        reverse_proxied: settings.server.reverse_proxied,
    };
    let app = build_router(state, store.serve_root(), body_limit);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("binding {}", settings.server.bind))?;
    info!(addr = %listener.local_addr()?, "cutechan listening");

    let stop = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutting down");
            stop.cancel();
        })
        .await
        .context("serving HTTP")?;

    shutdown.cancel();
    if let Err(e) = upkeep_task.await {
        warn!(error = %e, "upkeep task failed");
    }
    Ok(())
}
