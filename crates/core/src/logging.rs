//! Log filter selection.
//!
//! The core only emits `tracing` events; installing a subscriber is the
//! host's job. This helper picks the filter directive the way the CLI
//! expects: an explicit flag beats the verbosity count, which beats the
//! `RUST_LOG` environment, which beats the default.

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Explicit filter directive from a CLI flag.
    pub cli_filter: Option<String>,
    /// `-v` occurrences.
    pub verbose: u8,
    /// Captured `RUST_LOG` value.
    pub rust_log_env: Option<String>,
}

pub fn select_filter(options: &LogOptions) -> String {
    if let Some(filter) = options.cli_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        DEFAULT_LOG_FILTER.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_filter_overrides_everything() {
        let options = LogOptions {
            cli_filter: Some("upres_core=trace".into()),
            verbose: 2,
            rust_log_env: Some("error".into()),
        };
        assert_eq!(select_filter(&options), "upres_core=trace");
    }

    #[test]
    fn verbosity_maps_to_debug_then_trace() {
        let one = LogOptions {
            verbose: 1,
            rust_log_env: Some("warn".into()),
            ..Default::default()
        };
        let two = LogOptions {
            verbose: 2,
            ..Default::default()
        };
        assert_eq!(select_filter(&one), "debug");
        assert_eq!(select_filter(&two), "trace");
    }

    #[test]
    fn env_then_default() {
        let env = LogOptions {
            rust_log_env: Some("warn,upres_core=debug".into()),
            ..Default::default()
        };
        assert_eq!(select_filter(&env), "warn,upres_core=debug");
        assert_eq!(select_filter(&LogOptions::default()), DEFAULT_LOG_FILTER);
    }
}
