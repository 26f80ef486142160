//! Best-effort warm-instance control for the hosting service.
//!
//! Calls are fire-and-forget: failures are logged and never retried. One
//! worker applies updates in the order they were requested.

use crate::config::ScalingConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CLOUD_RUN_API_BASE: &str = "https://run.googleapis.com/v2";

#[async_trait]
pub trait ScalingControl: Send + Sync {
    async fn set_min_instances(&self, count: u32) -> Result<()>;
}

pub struct NoopScaler;

#[async_trait]
impl ScalingControl for NoopScaler {
    async fn set_min_instances(&self, _count: u32) -> Result<()> {
        Ok(())
    }
}

pub struct CloudRunScaler {
    http: reqwest::Client,
    service_url: String,
    access_token: String,
}

impl CloudRunScaler {
    pub fn new(cfg: &ScalingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            service_url: format!(
                "{CLOUD_RUN_API_BASE}/projects/{}/locations/{}/services/{}",
                cfg.project, cfg.region, cfg.service
            ),
            access_token: cfg.access_token.clone(),
        })
    }
}

#[async_trait]
impl ScalingControl for CloudRunScaler {
    #[tracing::instrument(level = "info", skip_all, fields(count))]
    async fn set_min_instances(&self, count: u32) -> Result<()> {
        let body = serde_json::json!({ "scaling": { "minInstanceCount": count } });
        let resp = self
            .http
            .patch(&self.service_url)
            .query(&[("updateMask", "scaling.minInstanceCount")])
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "scaling update failed: status={status} body={text}"
            ));
        }
        Ok(())
    }
}

/// Maps busy/idle transitions onto warm-instance counts.
///
/// Must be built inside a tokio runtime; it spawns the update worker.
#[derive(Clone)]
pub struct ScalingPolicy {
    updates: mpsc::UnboundedSender<u32>,
    active_min_instances: u32,
    idle_min_instances: u32,
}

impl ScalingPolicy {
    pub fn new(control: Arc<dyn ScalingControl>, cfg: &ScalingConfig) -> Self {
        let (updates, rx) = mpsc::unbounded_channel();
        tokio::spawn(apply_updates(control, rx));
        Self {
            updates,
            active_min_instances: cfg.active_min_instances,
            idle_min_instances: cfg.idle_min_instances,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopScaler), &ScalingConfig::default())
    }

    pub fn on_busy(&self) {
        self.fire(self.active_min_instances);
    }

    pub fn on_idle(&self) {
        self.fire(self.idle_min_instances);
    }

    fn fire(&self, count: u32) {
        if self.updates.send(count).is_err() {
            tracing::warn!(count, "scaling worker is gone; update dropped");
        }
    }
}

async fn apply_updates(control: Arc<dyn ScalingControl>, mut rx: mpsc::UnboundedReceiver<u32>) {
    while let Some(count) = rx.recv().await {
        match control.set_min_instances(count).await {
            Ok(()) => tracing::info!(count, "min instance count updated"),
            Err(error) => tracing::warn!(%error, count, "min instance update failed"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingScaler {
        pub(crate) calls: Mutex<Vec<u32>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl ScalingControl for RecordingScaler {
        async fn set_min_instances(&self, count: u32) -> Result<()> {
            self.calls.lock().expect("calls lock").push(count);
            if self.fail {
                return Err(anyhow::anyhow!("scaling backend down"));
            }
            Ok(())
        }
    }

    pub(crate) async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn cfg() -> ScalingConfig {
        ScalingConfig {
            enabled: true,
            project: "p".to_string(),
            region: "r".to_string(),
            service: "s".to_string(),
            access_token: "t".to_string(),
            active_min_instances: 2,
            idle_min_instances: 0,
        }
    }

    #[tokio::test]
    async fn busy_and_idle_map_to_configured_counts() {
        let scaler = Arc::new(RecordingScaler::default());
        let policy = ScalingPolicy::new(scaler.clone(), &cfg());
        policy.on_busy();
        settle().await;
        policy.on_idle();
        settle().await;
        assert_eq!(*scaler.calls.lock().expect("calls lock"), vec![2, 0]);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let scaler = Arc::new(RecordingScaler {
            fail: true,
            ..RecordingScaler::default()
        });
        let policy = ScalingPolicy::new(scaler.clone(), &cfg());
        policy.on_busy();
        settle().await;
        assert_eq!(scaler.calls.lock().expect("calls lock").len(), 1);
    }

    /// Takes longer to apply the active count than the idle one.
    #[derive(Default)]
    struct SlowScaleUp {
        applied: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ScalingControl for SlowScaleUp {
        async fn set_min_instances(&self, count: u32) -> Result<()> {
            if count > 0 {
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
            self.applied.lock().expect("applied lock").push(count);
            Ok(())
        }
    }

    #[tokio::test]
    async fn rapid_transitions_are_applied_in_order() {
        let scaler = Arc::new(SlowScaleUp::default());
        let policy = ScalingPolicy::new(scaler.clone(), &cfg());
        policy.on_busy();
        policy.on_idle();
        policy.on_busy();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*scaler.applied.lock().expect("applied lock"), vec![2, 0, 2]);
    }

    #[test]
    fn cloud_run_url_targets_the_service() {
        let scaler = CloudRunScaler::new(&cfg()).expect("scaler");
        assert_eq!(
            scaler.service_url,
            "https://run.googleapis.com/v2/projects/p/locations/r/services/s"
        );
    }
}
