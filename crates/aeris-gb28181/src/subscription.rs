// 订阅管理
// 跟踪平台下发的位置订阅，按有效期自动清理

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::{watch, RwLock};

/// 订阅全部通道的通配过滤符
pub const DEVICE_FILTER_ALL: &str = "*";

/// 清理扫描周期（秒）
const CLEANUP_INTERVAL_SECS: u64 = 60;

/// 平台发起的一条订阅
#[derive(Debug, Clone)]
pub struct Subscription {
    /// 订阅 ID（入站对话的 Call-ID）
    pub id: String,

    /// 订阅目标：具体通道 ID 或通配
    pub device_filter: String,

    /// 上报间隔（秒）
    pub report_interval: u64,

    /// 失效时间
    pub expires_at: DateTime<Utc>,

    /// 事件类型
    pub event_type: String,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        device_filter: impl Into<String>,
        report_interval: u64,
        expires_secs: u32,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device_filter: device_filter.into(),
            report_interval,
            expires_at: Utc::now() + Duration::seconds(expires_secs as i64),
            event_type: event_type.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.expires_at > Utc::now()
    }

    /// 是否覆盖给定通道
    pub fn matches(&self, channel_id: &str) -> bool {
        self.device_filter == DEVICE_FILTER_ALL || self.device_filter == channel_id
    }
}

/// 订阅注册表
pub struct SubscriptionRegistry {
    /// subscription id -> Subscription
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, subscription: Subscription) {
        let id = subscription.id.clone();
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(id.clone(), subscription);

        tracing::info!(target: "gb28181::subscription", %id, "subscription stored");
    }

    pub async fn get(&self, id: &str) -> Option<Subscription> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Subscription> {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.remove(id)
    }

    /// 列出未过期订阅
    pub async fn list_active(&self) -> Vec<Subscription> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    /// 列出覆盖给定通道的有效订阅
    pub async fn list_for_device(&self, channel_id: &str) -> Vec<Subscription> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .values()
            .filter(|s| s.is_active() && s.matches(channel_id))
            .cloned()
            .collect()
    }

    pub async fn count_active(&self) -> usize {
        let subscriptions = self.subscriptions.read().await;
        subscriptions.values().filter(|s| s.is_active()).count()
    }

    /// 移除全部过期订阅，返回移除数量
    pub async fn cleanup(&self) -> usize {
        let mut subscriptions = self.subscriptions.write().await;
        let expired: Vec<String> = subscriptions
            .iter()
            .filter(|(_, s)| !s.is_active())
            .map(|(id, _)| id.clone())
            .collect();

        let count = expired.len();
        for id in expired {
            subscriptions.remove(&id);
            tracing::info!(target: "gb28181::subscription", %id, "subscription expired and removed");
        }

        count
    }

    /// 周期清理循环，收到停机信号后退出
    pub async fn run_cleanup_loop(
        self: std::sync::Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.cleanup().await;
                    if removed > 0 {
                        tracing::debug!(
                            target: "gb28181::subscription",
                            removed,
                            "cleanup sweep finished"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::debug!(target: "gb28181::subscription", "cleanup loop stopped");
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expired(id: &str) -> Subscription {
        let mut sub = Subscription::new(id, DEVICE_FILTER_ALL, 5, 3600, "presence");
        sub.expires_at = Utc::now() - Duration::seconds(1);
        sub
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = SubscriptionRegistry::new();
        registry
            .add(Subscription::new("sub-1", DEVICE_FILTER_ALL, 5, 3600, "presence"))
            .await;

        assert!(registry.get("sub-1").await.is_some());
        assert!(registry.remove("sub-1").await.is_some());
        assert!(registry.get("sub-1").await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let registry = SubscriptionRegistry::new();
        registry
            .add(Subscription::new("live", DEVICE_FILTER_ALL, 5, 3600, "presence"))
            .await;
        registry.add(expired("dead-1")).await;
        registry.add(expired("dead-2")).await;

        let removed = registry.cleanup().await;
        assert_eq!(removed, 2);
        assert!(registry.get("live").await.is_some());
        assert!(registry.get("dead-1").await.is_none());
        assert_eq!(registry.count_active().await, 1);
    }

    #[tokio::test]
    async fn test_list_active_filters_expired() {
        let registry = SubscriptionRegistry::new();
        registry
            .add(Subscription::new("live", DEVICE_FILTER_ALL, 5, 3600, "presence"))
            .await;
        registry.add(expired("dead")).await;

        let active = registry.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "live");
    }

    #[tokio::test]
    async fn test_list_for_device_honors_filter() {
        let registry = SubscriptionRegistry::new();
        registry
            .add(Subscription::new(
                "wildcard",
                DEVICE_FILTER_ALL,
                5,
                3600,
                "presence",
            ))
            .await;
        registry
            .add(Subscription::new(
                "pinned",
                "34020000131000000010",
                5,
                3600,
                "presence",
            ))
            .await;

        let hits = registry.list_for_device("34020000131000000010").await;
        assert_eq!(hits.len(), 2);

        let misses = registry.list_for_device("34020000131000000020").await;
        assert_eq!(misses.len(), 1);
        assert_eq!(misses[0].id, "wildcard");
    }

    #[tokio::test]
    async fn test_subscription_matches() {
        let sub = Subscription::new("s", "34020000131000000010", 5, 60, "presence");
        assert!(sub.matches("34020000131000000010"));
        assert!(!sub.matches("34020000131000000020"));
        assert!(Subscription::new("s", DEVICE_FILTER_ALL, 5, 60, "presence").matches("anything"));
    }
}
