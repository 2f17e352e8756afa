use std::path::PathBuf;

use clap::Parser;

use crate::utils::host_architecture;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Ocitar CLI arguments.
#[derive(Debug, Parser)]
#[command(name = "ocitar", author, about, version, styles=styles::styles())]
pub struct OcitarArgs {
    /// The image references to pull.
    #[arg(required = true, value_name = "IMAGE")]
    pub images: Vec<String>,

    /// Output dir.
    #[arg(short, long, default_value = "output")]
    pub output: PathBuf,

    /// Do not delete the temp folder.
    #[arg(long)]
    pub save_cache: bool,

    /// Registry these credentials apply to.
    #[arg(short, long)]
    pub registry: Option<String>,

    /// Registry login.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Registry password.
    #[arg(short, long, conflicts_with = "stdin_password")]
    pub password: Option<String>,

    /// Registry password (interactive).
    #[arg(short = 'P', long)]
    pub stdin_password: bool,

    /// Set platform for downloaded image.
    #[arg(long, default_value_t = default_platform())]
    pub platform: String,

    /// Silent mode.
    #[arg(short, long, conflicts_with = "verbose")]
    pub silent: bool,

    /// Enable debug output.
    #[arg(short, long)]
    pub verbose: bool,
}

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

fn default_platform() -> String {
    format!("linux/{}", host_architecture())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
