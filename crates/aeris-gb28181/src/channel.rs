// GB28181 通道管理
// 将遥测源设备映射为平台可寻址的 20 位国标通道

use aeris_types::TelemetryRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

/// 通道编码中的设备类型段（3 位）
const CHANNEL_TYPE_CODE: &str = "131";

/// 通道编码中的网络标识段（3 位）
const CHANNEL_NETWORK_CODE: &str = "000";

/// 通道编码末位扩展段（1 位）
const CHANNEL_EXTENSION: &str = "0";

/// 平台视角下的一个遥测通道（一架无人机）
#[derive(Debug, Clone)]
pub struct Channel {
    /// 通道 ID（20 位国标编码）
    pub channel_id: String,

    /// 通道名称
    pub name: String,

    /// 遥测源设备 ID
    pub source_device_id: String,

    /// 是否在线
    pub online: bool,

    /// 最后一次遥测更新时间
    pub last_update: DateTime<Utc>,

    /// 最近一条遥测快照
    pub last_telemetry: TelemetryRecord,
}

impl Channel {
    /// 最后更新距今是否超过给定秒数
    pub fn is_stale(&self, timeout_secs: u64) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_update);
        elapsed.num_seconds() >= timeout_secs as i64
    }
}

/// 通道注册表
/// 进程生命周期内通道 ID 与遥测源一一对应，绝不复用
pub struct ChannelRegistry {
    region_code: String,
    /// source_device_id -> Channel
    channels: RwLock<HashMap<String, Channel>>,
    next_seq: AtomicU32,
}

impl ChannelRegistry {
    pub fn new(region_code: impl Into<String>) -> Self {
        Self {
            region_code: region_code.into(),
            channels: RwLock::new(HashMap::new()),
            next_seq: AtomicU32::new(0),
        }
    }

    /// 按遥测记录更新通道；首次出现的源设备分配新通道
    pub async fn update_from_telemetry(&self, record: &TelemetryRecord) -> Channel {
        let mut channels = self.channels.write().await;

        if let Some(channel) = channels.get_mut(&record.device_id) {
            channel.online = true;
            channel.last_update = Utc::now();
            channel.last_telemetry = record.clone();
            return channel.clone();
        }

        let channel_id = self.allocate_channel_id();
        let channel = Channel {
            channel_id: channel_id.clone(),
            name: record.device_id.clone(),
            source_device_id: record.device_id.clone(),
            online: true,
            last_update: Utc::now(),
            last_telemetry: record.clone(),
        };
        channels.insert(record.device_id.clone(), channel.clone());

        tracing::info!(
            target: "gb28181::channel",
            source = %record.device_id,
            channel_id = %channel_id,
            "channel allocated"
        );

        channel
    }

    /// 按通道 ID 查找
    pub async fn get_by_channel_id(&self, channel_id: &str) -> Option<Channel> {
        let channels = self.channels.read().await;
        channels
            .values()
            .find(|c| c.channel_id == channel_id)
            .cloned()
    }

    /// 列出全部通道
    pub async fn list_all(&self) -> Vec<Channel> {
        let channels = self.channels.read().await;
        channels.values().cloned().collect()
    }

    /// 列出在线通道
    pub async fn list_online(&self) -> Vec<Channel> {
        let channels = self.channels.read().await;
        channels.values().filter(|c| c.online).cloned().collect()
    }

    /// 将超时未更新的通道置为离线，返回本次置离线的数量
    pub async fn mark_stale_offline(&self, timeout_secs: u64) -> usize {
        let mut channels = self.channels.write().await;
        let mut flipped = 0;

        for channel in channels.values_mut() {
            if channel.online && channel.is_stale(timeout_secs) {
                channel.online = false;
                flipped += 1;
                tracing::info!(
                    target: "gb28181::channel",
                    channel_id = %channel.channel_id,
                    "channel went offline"
                );
            }
        }

        flipped
    }

    pub async fn count_online(&self) -> usize {
        let channels = self.channels.read().await;
        channels.values().filter(|c| c.online).count()
    }

    pub async fn count_all(&self) -> usize {
        let channels = self.channels.read().await;
        channels.len()
    }

    /// 生成下一个通道 ID：区划(6) + 类型(3) + 网络(3) + 序号(7) + 扩展(1)
    fn allocate_channel_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!(
            "{}{}{}{:07}{}",
            self.region_code, CHANNEL_TYPE_CODE, CHANNEL_NETWORK_CODE, seq, CHANNEL_EXTENSION
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device_id: &str) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.to_string(),
            timestamp: 1_700_000_000_000,
            latitude: 31.23,
            longitude: 121.47,
            altitude: 100.0,
            vx: 0.0,
            vy: 0.0,
            yaw: 0.0,
        }
    }

    #[tokio::test]
    async fn test_first_telemetry_allocates_channel() {
        let registry = ChannelRegistry::new("340200");

        let channel = registry.update_from_telemetry(&record("UAV-0001")).await;
        assert_eq!(channel.channel_id.len(), 20);
        assert!(channel.channel_id.starts_with("340200131000"));
        assert!(channel.channel_id.bytes().all(|b| b.is_ascii_digit()));
        assert!(channel.online);
        assert_eq!(registry.count_all().await, 1);
    }

    #[tokio::test]
    async fn test_repeat_telemetry_reuses_channel_id() {
        let registry = ChannelRegistry::new("340200");

        let first = registry.update_from_telemetry(&record("UAV-0001")).await;
        let second = registry.update_from_telemetry(&record("UAV-0001")).await;
        assert_eq!(first.channel_id, second.channel_id);
        assert_eq!(registry.count_all().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_sources_get_distinct_ids() {
        let registry = ChannelRegistry::new("340200");

        let a = registry.update_from_telemetry(&record("UAV-0001")).await;
        let b = registry.update_from_telemetry(&record("UAV-0002")).await;
        assert_ne!(a.channel_id, b.channel_id);
        assert_eq!(registry.count_all().await, 2);
    }

    #[tokio::test]
    async fn test_mark_stale_offline_zero_timeout() {
        let registry = ChannelRegistry::new("340200");
        registry.update_from_telemetry(&record("UAV-0001")).await;
        registry.update_from_telemetry(&record("UAV-0002")).await;

        let flipped = registry.mark_stale_offline(0).await;
        assert_eq!(flipped, 2);
        assert_eq!(registry.count_online().await, 0);
        assert_eq!(registry.list_online().await.len(), 0);
        assert_eq!(registry.list_all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_telemetry_revives_offline_channel() {
        let registry = ChannelRegistry::new("340200");
        registry.update_from_telemetry(&record("UAV-0001")).await;
        registry.mark_stale_offline(0).await;
        assert_eq!(registry.count_online().await, 0);

        let channel = registry.update_from_telemetry(&record("UAV-0001")).await;
        assert!(channel.online);
        assert_eq!(registry.count_online().await, 1);
    }

    #[tokio::test]
    async fn test_get_by_channel_id() {
        let registry = ChannelRegistry::new("340200");
        let channel = registry.update_from_telemetry(&record("UAV-0001")).await;

        let found = registry.get_by_channel_id(&channel.channel_id).await;
        assert_eq!(found.unwrap().source_device_id, "UAV-0001");
        assert!(registry.get_by_channel_id("34020000000000000000").await.is_none());
    }
}
