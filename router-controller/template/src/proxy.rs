use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Controls the proxy process that serves the rendered configuration.
#[async_trait::async_trait]
pub trait ProxyControl {
    /// Checks a configuration file without applying it.
    async fn validate_config(&self, path: &Path) -> Result<()>;

    /// Makes the proxy load the configuration file.
    async fn reload(&self, path: &Path) -> Result<()>;
}

/// Controls a proxy through its binary and an optional reload script.
#[derive(Clone, Debug)]
pub struct ProxyCommand {
    haproxy: PathBuf,
    reload_script: Option<PathBuf>,
}

// === impl ProxyCommand ===

impl ProxyCommand {
    pub fn new(haproxy: impl Into<PathBuf>, reload_script: Option<PathBuf>) -> Self {
        Self {
            haproxy: haproxy.into(),
            reload_script,
        }
    }

    async fn run(command: &mut Command, what: &str) -> Result<()> {
        let output = command
            .output()
            .await
            .with_context(|| format!("failed to run {what}"))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed with {}: {}", output.status, stderr.trim());
    }
}

#[async_trait::async_trait]
impl ProxyControl for ProxyCommand {
    async fn validate_config(&self, path: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.haproxy);
        cmd.arg("-c").arg("-f").arg(path);
        Self::run(&mut cmd, "configuration check").await
    }

    async fn reload(&self, path: &Path) -> Result<()> {
        let Some(script) = self.reload_script.as_ref() else {
            tracing::debug!(config = %path.display(), "No reload script configured");
            return Ok(());
        };
        let mut cmd = Command::new(script);
        cmd.env("CONFIG_FILE", path);
        Self::run(&mut cmd, "reload script").await
    }
}
