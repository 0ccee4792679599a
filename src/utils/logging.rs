//! Tracing subscriber setup driven by [`LoggingConfig`].

use crate::config::LoggingConfig;
use crate::error::{Result, SessionError};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Returns `Ok(false)` when
/// a subscriber was already installed, so calling this twice is harmless.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(SessionError::ConfigError(errors.join("; ")));
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let console = config.log_to_console.then(|| {
        let layer = tracing_subscriber::fmt::layer().with_target(true);
        if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    });

    let file = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => {
            let handle = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(handle));
            Some(if config.json_format {
                layer.json().boxed()
            } else {
                layer.boxed()
            })
        }
        _ => None,
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .is_ok();

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    Ok(installed)
}
