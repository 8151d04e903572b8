use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogSection;

/// Logs go to stderr so command output on stdout stays clean.
/// `TALLY_LOG` takes a full filter directive and wins over `log.level`.
pub fn init_logging(cfg: &LogSection, verbose: bool) {
    let fallback = if verbose { "debug" } else { cfg.level.as_str() };
    let filter = EnvFilter::try_from_env("TALLY_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json {
        let layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_ansi(false);
        registry.with(layer).init();
    } else {
        let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
        registry.with(layer).init();
    }
}
