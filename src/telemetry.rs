use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directives used when `RUST_LOG` is not set. The cycle loop reports each
/// cycle at info; arbitration and the simulator only report warnings.
const DEFAULT_DIRECTIVES: &[&str] = &[
    "warn",
    "ess_power_arbiter=info",
    "ess_power_arbiter::power=warn",
    "ess_power_arbiter::simulation=warn",
];

fn default_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_DIRECTIVES.join(","))
}

/// `RUST_LOG` when set and valid, otherwise the per-module defaults
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter())
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json().with_target(true))
        .init();
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_default_directives_parse() {
        for directive in DEFAULT_DIRECTIVES {
            assert!(
                EnvFilter::try_new(directive).is_ok(),
                "invalid directive {directive}"
            );
        }
    }

    #[test]
    fn test_default_filter_tops_out_at_info() {
        assert_eq!(default_filter().max_level_hint(), Some(LevelFilter::INFO));
    }
}
