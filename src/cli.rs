use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mumin", about = "Mumin — Arabic-to-Russian ad copy and branded image generation")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Generate Russian copy variants from Arabic hook/offer/CTA
    Text {
        #[arg(long)]
        hook: String,

        #[arg(long)]
        offer: String,

        #[arg(long)]
        cta: String,

        /// Copywriting instructions (defaults to the built-in ones)
        #[arg(long)]
        instructions: Option<String>,
    },

    /// Render Russian text as images in one or more styles
    Images {
        /// Russian ad text to place on the images
        #[arg(long)]
        text: String,

        /// Style id (repeatable, e.g. --style neon --style flat)
        #[arg(long = "style", required = true)]
        styles: Vec<String>,

        /// Images per style
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Visual instructions (defaults to the built-in ones)
        #[arg(long)]
        instructions: Option<String>,

        /// Write decoded images into this directory
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Reconcile the local gallery with the cloud and print the result
    Gallery {
        /// Only cloud images belonging to this ad
        #[arg(long)]
        ad: Option<String>,
    },
}
