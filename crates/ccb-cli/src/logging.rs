//! Logging initialization for the CLI.

use std::io::IsTerminal;

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over the verbosity flags.
pub fn init_logging(verbosity: u8, quiet: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(verbosity, quiet)))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal());

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(env_filter).with(fmt_layer),
    )?;
    Ok(())
}

fn default_filter(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "ccb=info",
        1 => "ccb=debug",
        2 => "ccb=debug,sqlx=info,reqwest=debug",
        _ => "ccb=trace",
    }
}
