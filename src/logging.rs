use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "runledger=info";

/// Install the global subscriber. Output goes to stderr so command output on stdout stays
/// clean JSON. `RUST_LOG` overrides the default filter.
pub(crate) fn init_logging(verbose: bool) {
    let fallback = if verbose { "runledger=debug" } else { DEFAULT_FILTER };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
