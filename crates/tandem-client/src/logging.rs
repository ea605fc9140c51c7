use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "tandem=info";

/// Install the global `fmt` subscriber. `RUST_LOG` wins over `fallback`.
///
/// Returns false when a subscriber was already installed (a second call is
/// harmless).
pub fn init_logging(fallback: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let _ = init_logging(DEFAULT_LOG_FILTER);
        assert!(!init_logging("debug"));
    }
}
