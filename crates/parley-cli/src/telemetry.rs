//! Tracing subscriber setup.

use anyhow::{anyhow, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset, by `-v` count.
fn default_directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info,parley_correlation=info",
        1 => "info,parley_correlation=debug",
        _ => "debug,parley_correlation=trace",
    }
}

/// Install the global subscriber. Logs go to stderr so reports on stdout stay clean.
pub fn init(verbosity: u8, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

    let fmt_layer = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_raises_library_level() {
        assert!(default_directives(0).contains("parley_correlation=info"));
        assert!(default_directives(1).contains("parley_correlation=debug"));
        assert!(default_directives(5).contains("parley_correlation=trace"));
    }

    #[test]
    fn test_directives_parse() {
        for verbosity in 0..3 {
            assert!(EnvFilter::try_new(default_directives(verbosity)).is_ok());
        }
    }
}
