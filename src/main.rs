use anyhow::{Context, Result};
use axum::Router;
use shadow_object_store::{
    config::{AppConfig, DataBackend, KmsBackendKind, MetadataBackend},
    kms::{
        EnvelopeEncryption, KmsBackend,
        file::FileKms,
        memory::{MemoryAccountKeys, MemoryKms},
    },
    routes,
    services::StorageService,
    store::{
        DataStore, MetadataStore,
        disk::DiskDataStore,
        memory::{MemoryDataStore, MemoryMetadataStore},
        sqlite::SqliteMetadataStore,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;
    tracing::info!(?cfg, "starting shadow-object-store");

    // --- Metadata store ---
    let metadata: Arc<dyn MetadataStore> = match cfg.metadata_backend {
        MetadataBackend::Sqlite => {
            let store = open_sqlite(&cfg.database_url).await?;
            if migrate {
                store.migrate().await.context("applying SQLite schema")?;
                tracing::info!("database migration complete");
                return Ok(());
            }
            Arc::new(store)
        }
        MetadataBackend::Mem => {
            if migrate {
                anyhow::bail!("--migrate needs the sqlite metadata backend");
            }
            Arc::new(MemoryMetadataStore::new())
        }
    };

    // --- Data store ---
    let data: Arc<dyn DataStore> = match cfg.data_backend {
        DataBackend::Disk => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir).await?;
                tracing::info!(dir = %cfg.storage_dir, "created storage directory");
            }
            Arc::new(DiskDataStore::new(&cfg.storage_dir))
        }
        DataBackend::Mem => Arc::new(MemoryDataStore::new()),
    };

    // --- Envelope encryption ---
    let kms: Arc<dyn KmsBackend> = match cfg.kms_backend {
        KmsBackendKind::Mem => Arc::new(MemoryKms::new().with_default_key_per_account(cfg.account_keys)),
        KmsBackendKind::File => Arc::new(
            FileKms::open(&cfg.kms_key_file, cfg.account_keys)
                .await
                .with_context(|| format!("opening KMS key file {}", cfg.kms_key_file))?,
        ),
    };
    let mut encryption = EnvelopeEncryption::new(kms.clone());
    if cfg.account_keys {
        encryption = encryption.with_account_keys(Arc::new(MemoryAccountKeys::new(kms)));
    }
    tracing::info!(backend = encryption.backend_name(), "KMS ready");

    let storage = StorageService::new(metadata, data, encryption, cfg.service_options());

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Connect to SQLite, creating the database file and its directory on demand.
async fn open_sqlite(url: &str) -> Result<SqliteMetadataStore> {
    let db_path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
            tracing::info!(dir = ?parent, "created database directory");
        }
    }

    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("parsing database URL {url}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    tracing::debug!(url, "connected to SQLite");
    Ok(SqliteMetadataStore::new(Arc::new(pool)))
}
