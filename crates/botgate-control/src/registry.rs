use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use botgate_model::{BotInstance, InstanceKey};
use chrono::Utc;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

/// Known control-plane instances, keyed by `(host, port)`.
///
/// Clones share the same collection. Readers always get a copy; the lock is
/// never held across network I/O.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RwLock<Vec<BotInstance>>>,
    client: reqwest::Client,
}

impl InstanceRegistry {
    /// Fails only when the HTTP client used for health probes cannot be built.
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("botgate-control")
            .no_proxy()
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
            client,
        }
    }

    /// Inserts a new instance or refreshes the name of an existing one.
    /// Returns `true` when a new entry was created.
    pub fn register(&self, name: &str, host: &str, port: u16) -> bool {
        let key = InstanceKey::new(host, port);
        let mut list = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = list.iter_mut().find(|i| i.matches(&key)) {
            existing.name = name.to_string();
            return false;
        }
        list.push(BotInstance::new(name, key));
        drop(list);

        tracing::info!(instance = name, host, port, "instance registered");
        true
    }

    /// Returns `true` when an entry was removed.
    pub fn remove(&self, host: &str, port: u16) -> bool {
        let key = InstanceKey::new(host, port);
        let mut list = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(pos) = list.iter().position(|i| i.matches(&key)) else {
            return false;
        };
        let removed = list.remove(pos);
        drop(list);

        tracing::info!(instance = %removed.name, host, port, "instance removed");
        true
    }

    pub fn list_all(&self) -> Vec<BotInstance> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, host: &str, port: u16) -> Option<BotInstance> {
        let key = InstanceKey::new(host, port);
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|i| i.matches(&key))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probes every known instance concurrently and records the outcome.
    ///
    /// Each probe is independent: one failure only marks that instance
    /// inactive. Entries removed while probing are not resurrected.
    pub async fn probe_all(&self, timeout: Duration) -> Vec<BotInstance> {
        let keys: Vec<InstanceKey> = self.list_all().iter().map(BotInstance::key).collect();

        let results = join_all(keys.into_iter().map(|key| async move {
            let active = self.probe_one(&key, timeout).await;
            (key, active)
        }))
        .await;

        let checked_at = Utc::now();
        {
            let mut list = self.inner.write().unwrap_or_else(|e| e.into_inner());
            for (key, active) in &results {
                if let Some(entry) = list.iter_mut().find(|i| i.matches(key)) {
                    entry.is_active = *active;
                    entry.last_checked = checked_at;
                }
            }
        }

        let active = results.iter().filter(|(_, ok)| *ok).count();
        tracing::debug!(probed = results.len(), active, "instance probe finished");
        self.list_all()
    }

    async fn probe_one(&self, key: &InstanceKey, timeout: Duration) -> bool {
        let url = key.health_url();
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::debug!(instance = %key, status = %resp.status(), "health probe rejected");
                false
            }
            Err(e) => {
                tracing::debug!(instance = %key, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Periodic driver for [`InstanceRegistry::probe_all`]. The registry itself
/// never schedules probes.
#[derive(Clone)]
pub struct InstanceHealthPoller {
    registry: InstanceRegistry,
    interval: Duration,
    timeout: Duration,
}

impl InstanceHealthPoller {
    pub fn new(registry: InstanceRegistry, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.registry.probe_all(self.timeout).await;
                    }
                }
            }
            tracing::debug!("instance health poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, TcpListener as StdTcpListener};

    use axum::{Json, Router, routing::get};
    use botgate_model::HealthStatus;

    use super::*;

    async fn spawn_health_server() -> u16 {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let app =
            Router::new().route("/api/healthcheck", get(|| async { Json(HealthStatus::ok()) }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn closed_port() -> u16 {
        let l = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    #[test]
    fn reregistration_only_updates_name() {
        let reg = InstanceRegistry::new().unwrap();
        assert!(reg.register("A", "h", 1));
        assert!(!reg.register("B", "h", 1));

        let all = reg.list_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "B");
        assert!(!all[0].is_active);
    }

    #[test]
    fn identity_is_host_and_port() {
        let reg = InstanceRegistry::new().unwrap();
        reg.register("A", "h", 1);
        reg.register("A", "h", 2);
        reg.register("A", "other", 1);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn remove_is_noop_for_unknown() {
        let reg = InstanceRegistry::new().unwrap();
        reg.register("A", "h", 1);
        assert!(!reg.remove("h", 2));
        assert!(reg.remove("h", 1));
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_is_detached() {
        let reg = InstanceRegistry::new().unwrap();
        reg.register("A", "h", 1);
        let mut snap = reg.list_all();
        snap[0].name = "mutated".into();
        reg.register("B", "h", 2);
        assert_eq!(reg.get("h", 1).unwrap().name, "A");
        assert_eq!(snap.len(), 1);
    }

    #[tokio::test]
    async fn probe_updates_each_instance_independently() {
        let live = spawn_health_server().await;
        let dead = closed_port();

        let reg = InstanceRegistry::new().unwrap();
        reg.register("live", "127.0.0.1", live);
        reg.register("dead", "127.0.0.1", dead);
        let before = reg.list_all();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let after = reg.probe_all(Duration::from_millis(500)).await;
        let live_entry = after.iter().find(|i| i.port == live).unwrap();
        let dead_entry = after.iter().find(|i| i.port == dead).unwrap();
        assert!(live_entry.is_active);
        assert!(!dead_entry.is_active);

        for entry in &before {
            let now = after.iter().find(|i| i.port == entry.port).unwrap();
            assert!(now.last_checked > entry.last_checked);
        }
    }

    #[tokio::test]
    async fn probe_marks_non_success_inactive() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, Router::new()).await.unwrap();
        });

        let reg = InstanceRegistry::new().unwrap();
        reg.register("404", "127.0.0.1", port);
        let after = reg.probe_all(Duration::from_millis(500)).await;
        assert!(!after[0].is_active);
    }

    #[tokio::test]
    async fn poller_stops_on_cancel() {
        let reg = InstanceRegistry::new().unwrap();
        reg.register("dead", "127.0.0.1", closed_port());
        let token = CancellationToken::new();
        let handle = InstanceHealthPoller::new(
            reg.clone(),
            Duration::from_millis(20),
            Duration::from_millis(100),
        )
        .spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
