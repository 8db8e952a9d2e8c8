//! `tracing` subscriber setup for binaries and tests that embed the pool.
//!
//! The pool itself only emits events; it never installs a subscriber.
//!
//! ```no_run
//! use workpool::logging;
//!
//! logging::init(logging::LogConfig {
//!     level: tracing::Level::DEBUG,
//!     ..Default::default()
//! });
//! ```

use std::{
    io::{self, IsTerminal},
    sync::Once,
};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level, applied on top of `RUST_LOG`.
    pub level: Level,
    pub json_format: bool,
    pub show_thread_info: bool,
    /// Extra directives, e.g. `"workpool::worker=trace,workpool::pool=debug"`.
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_thread_info: true,
            target_filters: None,
        }
    }
}

static INIT: Once = Once::new();

/// Installs the global subscriber. Only the first call has an effect.
pub fn init(config: LogConfig) {
    install(config, false);
}

pub fn init_default() {
    init(LogConfig::default());
}

/// Debug-level output captured by the test harness.
pub fn init_for_tests() {
    install(
        LogConfig {
            level: Level::DEBUG,
            ..Default::default()
        },
        true,
    );
}

fn install(config: LogConfig, test_writer: bool) {
    INIT.call_once(|| {
        let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());
        if let Some(filters) = &config.target_filters {
            for filter in filters.split(',') {
                if let Ok(directive) = filter.trim().parse() {
                    env_filter = env_filter.add_directive(directive);
                }
            }
        }

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = if test_writer {
            registry
                .with(fmt::layer().with_test_writer().with_thread_names(true))
                .try_init()
        } else if config.json_format {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_thread_names(config.show_thread_info),
                )
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_ansi(io::stdout().is_terminal())
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                )
                .try_init()
        };

        // Someone else already installed a subscriber; keep theirs.
        let _ = result;
    });
}
