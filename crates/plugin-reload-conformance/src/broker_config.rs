//! Generated broker configuration files.

use crate::error::{HarnessError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

/// Renders the broker directives in the order the broker expects them:
/// settings flag, listener, plugin, anonymous access.
#[must_use]
pub fn render(per_listener_settings: bool, port: u16, plugin_path: &Path) -> String {
    format!(
        "per_listener_settings {per_listener_settings}\n\
         listener {port}\n\
         plugin {}\n\
         allow_anonymous true\n",
        plugin_path.display()
    )
}

/// A configuration file on disk that is removed exactly once.
///
/// [`remove`](Self::remove) reports removal errors to the caller; dropping a
/// file that was never removed deletes it silently.
#[derive(Debug)]
pub struct BrokerConfigFile {
    path: PathBuf,
    temp: Option<TempPath>,
}

impl BrokerConfigFile {
    /// Writes `contents` to a fresh `plugin-reload-*.conf` file in `dir`, or
    /// in the system temp directory when `dir` is `None`.
    pub fn write(contents: &str, dir: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("plugin-reload-").suffix(".conf");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|source| HarnessError::ConfigWrite { source })?;

        file.write_all(contents.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| HarnessError::ConfigWrite { source })?;

        let temp = file.into_temp_path();
        let path = temp.to_path_buf();
        debug!(path = %path.display(), "broker configuration written");
        Ok(Self {
            path,
            temp: Some(temp),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.temp.is_none()
    }

    /// Deletes the file. Returns `Ok(false)` if it was already removed.
    pub fn remove(&mut self) -> std::io::Result<bool> {
        match self.temp.take() {
            Some(temp) => temp.close().map(|()| true),
            None => Ok(false),
        }
    }
}
