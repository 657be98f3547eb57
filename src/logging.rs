//! Tracing setup and forwarding of backend log messages.

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::protocol::{LogLevel, LogMessageParams};

pub const DEFAULT_FILTER: &str = "agentlink=info";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Output goes to stderr so the CLI's
/// stdout stays clean. Calling this twice is harmless.
pub fn init(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Re-emit a backend `log/message` notification through `tracing`.
pub fn forward_backend_log(params: Value) {
    let msg: LogMessageParams = match serde_json::from_value(params) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Malformed log/message params: {}", e);
            return;
        }
    };

    match msg.level {
        LogLevel::Error => error!(target: "agentlink::backend", "{}", msg.message),
        LogLevel::Warn => warn!(target: "agentlink::backend", "{}", msg.message),
        LogLevel::Info | LogLevel::Unknown => {
            info!(target: "agentlink::backend", "{}", msg.message)
        }
        LogLevel::Debug => debug!(target: "agentlink::backend", "{}", msg.message),
        LogLevel::Trace => trace!(target: "agentlink::backend", "{}", msg.message),
    }
}
