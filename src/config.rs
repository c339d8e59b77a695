use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr};

use crate::services::{DEFAULT_DELETE_CONCURRENCY, DEFAULT_MAX_PART_SIZE, ServiceOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MetadataBackend {
    Sqlite,
    Mem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DataBackend {
    Disk,
    Mem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KmsBackendKind {
    Mem,
    File,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub metadata_backend: MetadataBackend,
    pub data_backend: DataBackend,
    pub kms_backend: KmsBackendKind,
    pub kms_key_file: String,
    pub max_part_size: u64,
    pub delete_concurrency: usize,
    pub default_bucket_sse: Option<String>,
    pub account_keys: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "S3-compatible object store with shadow-bucket multipart uploads")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root of the disk data store (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// SQLite database URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Metadata engine (overrides OBJECT_STORE_METADATA_BACKEND)
    #[arg(long, value_enum)]
    pub metadata_backend: Option<MetadataBackend>,

    /// Data engine (overrides OBJECT_STORE_DATA_BACKEND)
    #[arg(long, value_enum)]
    pub data_backend: Option<DataBackend>,

    /// KMS engine (overrides OBJECT_STORE_KMS_BACKEND)
    #[arg(long, value_enum)]
    pub kms_backend: Option<KmsBackendKind>,

    /// Master key file used by the file KMS (overrides OBJECT_STORE_KMS_KEY_FILE)
    #[arg(long)]
    pub kms_key_file: Option<String>,

    /// Largest part a copy may produce, in bytes (overrides OBJECT_STORE_MAX_PART_SIZE)
    #[arg(long)]
    pub max_part_size: Option<u64>,

    /// Multi-object delete entries processed at once (overrides OBJECT_STORE_DELETE_CONCURRENCY)
    #[arg(long)]
    pub delete_concurrency: Option<usize>,

    /// Encryption for buckets created without any, e.g. AES256 (overrides OBJECT_STORE_DEFAULT_SSE)
    #[arg(long)]
    pub default_sse: Option<String>,

    /// Mint one master key per account instead of per bucket (overrides OBJECT_STORE_ACCOUNT_KEYS)
    #[arg(long)]
    pub account_keys: bool,

    /// Apply the SQLite schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, &|name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// CLI values win over the environment, which wins over defaults.
    fn merge(args: Args, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = env("OBJECT_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_storage =
            env("OBJECT_STORE_STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_db = env("OBJECT_STORE_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/object_store.db".into());
        let env_key_file =
            env("OBJECT_STORE_KMS_KEY_FILE").unwrap_or_else(|| "./data/kms/keys.json".into());

        let default_bucket_sse = args
            .default_sse
            .or_else(|| env("OBJECT_STORE_DEFAULT_SSE"))
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("none"));
        if let Some(algorithm) = &default_bucket_sse {
            if algorithm != "AES256" && algorithm != "aws:kms" {
                bail!("unsupported default SSE algorithm `{algorithm}`");
            }
        }

        let delete_concurrency = match args.delete_concurrency {
            Some(v) => v,
            None => parsed(env, "OBJECT_STORE_DELETE_CONCURRENCY")?
                .unwrap_or(DEFAULT_DELETE_CONCURRENCY),
        };
        if delete_concurrency == 0 {
            bail!("delete concurrency must be at least 1");
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: match args.port {
                Some(v) => v,
                None => parsed(env, "OBJECT_STORE_PORT")?.unwrap_or(3000),
            },
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            metadata_backend: match args.metadata_backend {
                Some(v) => v,
                None => enum_var(env, "OBJECT_STORE_METADATA_BACKEND")?
                    .unwrap_or(MetadataBackend::Sqlite),
            },
            data_backend: match args.data_backend {
                Some(v) => v,
                None => enum_var(env, "OBJECT_STORE_DATA_BACKEND")?.unwrap_or(DataBackend::Disk),
            },
            kms_backend: match args.kms_backend {
                Some(v) => v,
                None => enum_var(env, "OBJECT_STORE_KMS_BACKEND")?.unwrap_or(KmsBackendKind::Mem),
            },
            kms_key_file: args.kms_key_file.unwrap_or(env_key_file),
            max_part_size: match args.max_part_size {
                Some(v) => v,
                None => parsed(env, "OBJECT_STORE_MAX_PART_SIZE")?.unwrap_or(DEFAULT_MAX_PART_SIZE),
            },
            delete_concurrency,
            default_bucket_sse,
            account_keys: args.account_keys
                || parsed::<bool>(env, "OBJECT_STORE_ACCOUNT_KEYS")?.unwrap_or(false),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            max_part_size: self.max_part_size,
            delete_concurrency: self.delete_concurrency,
            default_bucket_sse: self.default_bucket_sse.clone(),
        }
    }
}

fn parsed<T>(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(name)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {name} value `{value}`"))
        })
        .transpose()
}

fn enum_var<T: ValueEnum>(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    env(name)
        .map(|value| {
            <T as ValueEnum>::from_str(&value, true).map_err(|err| anyhow::anyhow!("parsing {name}: {err}"))
        })
        .transpose()
}
