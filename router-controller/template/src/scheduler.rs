use crate::{config, ProxyControl, RenderOptions};
use anyhow::{Context, Result};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use router_controller_core::status::HAPROXY_CHECK_CONFIG_FAILED;
use router_controller_k8s_index::SharedState;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::watch, time};

/// Writes the proxy configuration when the router state changes.
///
/// Changes are announced on a watch channel carrying the state's generation.
/// Bursts of changes are coalesced: after a change is observed the scheduler
/// waits for the commit interval and then renders the state once.
pub struct CommitScheduler<C> {
    state: SharedState,
    commits: watch::Receiver<u64>,
    proxy: C,
    config_path: PathBuf,
    opts: RenderOptions,
    interval: Duration,
    metrics: CommitMetrics,

    /// The generation of the configuration the proxy is currently running.
    last_committed: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct CommitMetrics {
    commits: Counter,
    commit_failures: Counter,
    commit_skipped: Counter,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Committed(u64),

    /// Not every watch has delivered its initial listing, so the state may
    /// be incomplete.
    NotSynced,

    /// The proxy already runs the configuration for this generation.
    Unchanged(u64),
}

// === impl CommitScheduler ===

impl<C: ProxyControl> CommitScheduler<C> {
    pub fn new(
        state: SharedState,
        commits: watch::Receiver<u64>,
        proxy: C,
        config_path: PathBuf,
        opts: RenderOptions,
        interval: Duration,
        metrics: CommitMetrics,
    ) -> Self {
        Self {
            state,
            commits,
            proxy,
            config_path,
            opts,
            interval,
            metrics,
            last_committed: None,
        }
    }

    /// Commits the configuration on every change until shutdown is signaled
    /// or the state's publisher is dropped.
    pub async fn run(mut self, drain: drain::Watch) {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                res = self.commits.changed() => {
                    if res.is_err() {
                        tracing::debug!("State publisher dropped");
                        return;
                    }
                }
                _ = &mut shutdown => {
                    tracing::debug!("Shutdown signaled");
                    return;
                }
            }

            tokio::select! {
                _ = time::sleep(self.interval) => {}
                _ = &mut shutdown => {
                    tracing::debug!("Shutdown signaled");
                    return;
                }
            }

            // Changes published during the interval are included in this
            // commit.
            let generation = *self.commits.borrow_and_update();
            match self.commit().await {
                Ok(outcome) => tracing::debug!(generation, ?outcome, "Commit complete"),
                Err(error) => {
                    tracing::error!(generation, error = %format!("{error:#}"), "Failed to commit configuration");
                }
            }
        }
    }

    /// Renders the current state and has the proxy load it.
    ///
    /// On failure the previous configuration stays active and the next
    /// commit retries.
    pub async fn commit(&mut self) -> Result<Outcome> {
        let snapshot = {
            let state = self.state.read();
            if !state.synced_at_least_once() {
                self.metrics.commit_skipped.inc();
                return Ok(Outcome::NotSynced);
            }
            let generation = state.generation();
            if self.last_committed == Some(generation) {
                self.metrics.commit_skipped.inc();
                return Ok(Outcome::Unchanged(generation));
            }
            state.snapshot()
        };

        match self.write_and_reload(&snapshot).await {
            Ok(()) => {
                tracing::info!(generation = snapshot.generation, "Committed configuration");
                self.last_committed = Some(snapshot.generation);
                self.metrics.commits.inc();
                Ok(Outcome::Committed(snapshot.generation))
            }
            Err(error) => {
                self.metrics.commit_failures.inc();
                Err(error)
            }
        }
    }

    async fn write_and_reload(&self, snapshot: &router_controller_k8s_index::Snapshot) -> Result<()> {
        let rendered = config::render(snapshot, &self.opts)?;

        for (path, pem) in &rendered.certificates {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            tokio::fs::write(path, pem)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &rendered.config)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;

        if let Err(error) = self.proxy.validate_config(&tmp).await {
            tracing::error!(
                reason = HAPROXY_CHECK_CONFIG_FAILED,
                config = %tmp.display(),
                error = %format!("{error:#}"),
                "Configuration check failed"
            );
            return Err(error.context(HAPROXY_CHECK_CONFIG_FAILED));
        }

        tokio::fs::rename(&tmp, &self.config_path)
            .await
            .with_context(|| format!("failed to replace {}", self.config_path.display()))?;
        self.proxy.reload(&self.config_path).await?;

        // The running configuration no longer refers to other certificates.
        for dir in [&self.opts.cert_dir, &self.opts.cacert_dir] {
            if let Err(error) = self.remove_stale_certificates(dir, &rendered.certificates).await {
                tracing::warn!(
                    dir = %dir.display(),
                    error = %format!("{error:#}"),
                    "Failed to remove stale certificates"
                );
            }
        }
        Ok(())
    }

    /// Removes certificate files in `dir` that are not part of `keep`.
    async fn remove_stale_certificates(
        &self,
        dir: &Path,
        keep: &BTreeMap<PathBuf, String>,
    ) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read {}", dir.display()))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to read {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "pem")
                || keep.contains_key(&path)
                || self.opts.default_certificate.as_ref() == Some(&path)
            {
                continue;
            }
            tracing::debug!(path = %path.display(), "Removing stale certificate");
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut path = self.config_path.clone().into_os_string();
        path.push(".tmp");
        path.into()
    }
}

// === impl CommitMetrics ===

impl CommitMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let commits = Counter::default();
        prom.register(
            "commits",
            "Count of configurations committed to the proxy",
            commits.clone(),
        );

        let commit_failures = Counter::default();
        prom.register(
            "commit_failures",
            "Count of configurations that could not be rendered, checked or loaded",
            commit_failures.clone(),
        );

        let commit_skipped = Counter::default();
        prom.register(
            "commit_skipped",
            "Count of commits skipped because the state was unsynced or unchanged",
            commit_skipped.clone(),
        );

        Self {
            commits,
            commit_failures,
            commit_skipped,
        }
    }
}
