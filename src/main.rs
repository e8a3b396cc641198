mod cli;
mod cloud;
mod config;
mod copywriter;
mod daemon;
mod db;
mod debounce;
mod error;
mod fanout;
mod gallery;
mod gemini;
mod models;
mod prompts;
mod server;
mod storage;
mod store;
mod styles;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{load_config, validate_config};
use crate::copywriter::CopyRequest;
use crate::gallery::{CloudGallery, LocalGallery};
use crate::gemini::{GeminiClient, GenerationGateway};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.mumin.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Text {
            hook,
            offer,
            cta,
            instructions,
        }) => {
            let gateway = GeminiClient::from_config(&config).context("creating Gemini client")?;
            let request = CopyRequest {
                hook,
                offer,
                cta,
                instructions,
            };
            request.validate().map_err(anyhow::Error::msg)?;
            let instructions = request
                .instructions()
                .unwrap_or(prompts::DEFAULT_RUSSIAN_INSTRUCTIONS)
                .to_string();

            let variants =
                copywriter::generate_variants(&gateway, &request, &instructions, config.gemini.text_batch_size).await?;
            println!("{}", serde_json::to_string_pretty(&variants)?);
        }
        Some(Commands::Images {
            text,
            styles,
            count,
            instructions,
            output_dir,
        }) => {
            let gateway: Arc<dyn GenerationGateway> =
                Arc::new(GeminiClient::from_config(&config).context("creating Gemini client")?);
            let instructions = instructions
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| prompts::DEFAULT_GLOBAL_IMAGE_INSTRUCTIONS.to_string());

            let limits = &config.generation;
            let plan = fanout::plan(&styles, count, &text, &instructions, limits)?;
            let outcome = fanout::run(gateway, plan, limits.mode, limits.max_concurrency)
                .await
                .into_result()
                .map_err(|e| {
                    if let error::FanoutError::AllFailed { style_errors } = &e {
                        for se in style_errors {
                            eprintln!("  {}: {}", se.style, se.message);
                        }
                    }
                    e
                })?;

            std::fs::create_dir_all(&output_dir).with_context(|| format!("creating {}", output_dir.display()))?;
            for (i, image) in outcome.images.iter().enumerate() {
                let decoded = storage::decode_image_source(&image.url)
                    .await
                    .with_context(|| format!("decoding image {} ({})", i + 1, image.style))?;
                let path = output_dir.join(format!("{}-{}.{}", image.style, i + 1, decoded.extension()));
                std::fs::write(&path, &decoded.bytes).with_context(|| format!("writing {}", path.display()))?;
                println!("{}", path.display());
            }
            for se in &outcome.style_errors {
                warn!(style = %se.style, error = %se.message, "style failed");
                eprintln!("warning: {} failed: {}", se.style, se.message);
            }
        }
        Some(Commands::Gallery { ad }) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let objects = Arc::new(daemon::object_store(&config));
            let cloud = daemon::cloud_for(&config, &pool, &objects);
            let local = LocalGallery::new(config.local_gallery_path());

            let remote = cloud.as_deref().map(|c| c as &dyn CloudGallery);
            let view = gallery::load_gallery(&local, remote, ad.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&view)?);
            pool.close().await;
        }
        None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}
