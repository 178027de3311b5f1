//! Log subscriber setup for the binary.

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

/// Installs the global subscriber. `RUST_LOG` directives take precedence
/// over `level`. Fails if a subscriber is already installed.
pub fn init(level: LevelFilter, format: LogFormat) -> Result<(), TryInitError> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(filter)
        .with_ansi(enable_ansi())
        .with_thread_ids(false);

    match format {
        LogFormat::Plaintext => builder.finish().try_init(),
        LogFormat::Json => builder.json().finish().try_init(),
    }
}

/// Colour only when both stdout and stderr are terminals.
pub fn enable_ansi() -> bool {
    use std::io::IsTerminal;
    std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}
