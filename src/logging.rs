use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::Level;
use tracing::{debug, info, metadata::LevelFilter};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{prelude::*, EnvFilter};

// `level` is the default for every target, `RUST_LOG` directives may override it per target.
fn stdout_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default())
        .add_directive(LevelFilter::from(level).into())
}

fn do_init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(stdout_filter(stdout_level));

    let file_dir = file_logging.as_ref().map(|(_, dir)| dir.clone());
    let file_layer = file_logging.map(|(level, dir)| {
        tracing_subscriber::fmt::layer()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, "relay.log"))
            .with_ansi(false)
            .with_filter(LevelFilter::from(level))
    });

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    debug!(?stdout_level, ?file_dir, "Log outputs");
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stdout_level, file_logging);

        *initialized = true;
    }

    info!("Logging initialized");
}
