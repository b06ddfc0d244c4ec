//! Target-side log routing for `AttachConfig::log_to`.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Sends target-side tracing output to the file at `path` (appending).
///
/// Returns `Ok(false)` when the embedding program already installed a
/// global subscriber; that subscriber is left alone.
pub fn log_to(path: &Path) -> io::Result<bool> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    let filter = EnvFilter::from_default_env()
        .add_directive(directive("tether_target=debug"))
        .add_directive(directive("tether_protocol=debug"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .is_ok();

    if !installed {
        debug!(path = %path.display(), "Subscriber already installed, log_to not applied");
    }
    Ok(installed)
}

fn directive(s: &str) -> Directive {
    s.parse()
        .unwrap_or_else(|_| Directive::from(tracing::Level::DEBUG))
}
