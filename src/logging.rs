//! Logging setup
//!
//! The subscriber is process-wide and installed by binaries. Sessions carry
//! their own `verbose` flag and pass it here explicitly.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the fmt subscriber. `RUST_LOG` takes precedence; a second call is a no-op.
pub fn init(verbose: bool) {
    let directive = if verbose {
        "kvcache_client=debug"
    } else {
        "kvcache_client=info"
    };
    let mut filter = EnvFilter::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Forwards llama.cpp's own log output into tracing only when `verbose` is set
pub fn route_engine_logs(verbose: bool) {
    llama_cpp_2::send_logs_to_tracing(llama_cpp_2::LogOptions::default().with_logs_enabled(verbose));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_does_not_panic() {
        init(false);
        init(true);
    }
}
