use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,

    /// Object-store endpoint, bucket, and credentials.
    pub storage_base_url: String,
    pub storage_bucket: String,
    pub storage_access_key: String,
    pub storage_secret_key: String,

    /// OpenAI-compatible inference endpoint.
    pub inference_base_url: String,
    pub inference_api_key: Option<String>,
    pub inference_model: String,

    /// Public base URL used to derive share links.
    pub public_base_url: String,

    /// Directory the `upload-local` endpoint may import from.
    pub local_import_dir: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Image-to-poetry REST API")]
pub struct Args {
    /// Host to bind to (overrides POETRY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides POETRY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides POETRY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object-store base URL (overrides POETRY_STORAGE_URL)
    #[arg(long)]
    pub storage_url: Option<String>,

    /// Object-store bucket (overrides POETRY_STORAGE_BUCKET)
    #[arg(long)]
    pub storage_bucket: Option<String>,

    /// Inference base URL (overrides POETRY_INFERENCE_URL)
    #[arg(long)]
    pub inference_url: Option<String>,

    /// Inference model name (overrides POETRY_INFERENCE_MODEL)
    #[arg(long)]
    pub inference_model: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("POETRY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("POETRY_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing POETRY_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading POETRY_PORT"),
        };
        let env_db =
            env::var("POETRY_DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/poetry.db".into());
        let env_storage_url =
            env::var("POETRY_STORAGE_URL").unwrap_or_else(|_| "http://localhost:9000".into());
        let env_storage_bucket =
            env::var("POETRY_STORAGE_BUCKET").unwrap_or_else(|_| "poetry-images".into());
        let env_inference_url = env::var("POETRY_INFERENCE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let env_inference_model =
            env::var("POETRY_INFERENCE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            storage_base_url: args.storage_url.unwrap_or(env_storage_url),
            storage_bucket: args.storage_bucket.unwrap_or(env_storage_bucket),
            storage_access_key: env::var("POETRY_STORAGE_ACCESS_KEY").unwrap_or_default(),
            storage_secret_key: env::var("POETRY_STORAGE_SECRET_KEY").unwrap_or_default(),
            inference_base_url: args.inference_url.unwrap_or(env_inference_url),
            inference_api_key: env::var("POETRY_INFERENCE_API_KEY").ok(),
            inference_model: args.inference_model.unwrap_or(env_inference_model),
            public_base_url: env::var("POETRY_PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            local_import_dir: env::var("POETRY_LOCAL_IMPORT_DIR")
                .unwrap_or_else(|_| "./data/import".into()),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
