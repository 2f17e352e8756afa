use std::{
    io::{BufRead, IsTerminal, Write},
    sync::Arc,
};

use clap::Parser;
use ocitar::{
    cli::OcitarArgs,
    oci::{BasicCredentials, PullPlatform, Puller, DEFAULT_REGISTRY_HOST},
    progress::{EmptyProgressBar, PullProgress, TermProgressBar},
    OcitarResult,
};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> OcitarResult<()> {
    let args = OcitarArgs::parse();

    let default_level = if args.verbose {
        "debug"
    } else if args.silent {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // both modes disable the bar: silent prints nothing, verbose would
    // interleave the bar with debug lines
    let progress: Arc<dyn PullProgress> = if args.silent || args.verbose {
        Arc::new(EmptyProgressBar)
    } else {
        Arc::new(TermProgressBar::new())
    };

    let platform: PullPlatform = args.platform.parse()?;
    let mut puller = Puller::new(&args.output, platform, args.save_cache, progress);

    if let Some(user) = &args.user {
        let password = if args.stdin_password {
            read_password()?
        } else {
            args.password.clone().unwrap_or_default()
        };

        puller.set_registry(
            args.registry.as_deref().unwrap_or(DEFAULT_REGISTRY_HOST),
            Some(BasicCredentials::new(user, password)),
            true,
        );
    }

    let mut failed = false;
    for image in &args.images {
        if let Err(error) = puller.pull(image).await {
            tracing::error!("failed to pull {}: {}", image, error);
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads one line of password input from stdin, prompting on stderr when
/// stdin is a terminal.
fn read_password() -> OcitarResult<String> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprint!("Password: ");
        std::io::stderr().flush()?;
    }

    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;

    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
