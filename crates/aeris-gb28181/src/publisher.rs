// GB28181 北向发布器
// 负责组件装配、注册生命周期、心跳与单机位置限频

use crate::channel::ChannelRegistry;
use crate::config::Gb28181Config;
use crate::dispatch::QueryDispatcher;
use crate::error::{Error, Result};
use crate::manscdp;
use crate::sip::session::SipSession;
use crate::sip::MANSCDP_CONTENT_TYPE;
use crate::subscription::SubscriptionRegistry;
use aeris_northbound::{NorthboundKind, NorthboundPublisher};
use aeris_types::TelemetryRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// 运行期组件集合，start 时装配、stop 时整体拆除
struct Running {
    session: Arc<SipSession>,
    channels: Arc<ChannelRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// GB28181 北向发布器
pub struct Gb28181Publisher {
    config: Gb28181Config,
    running: RwLock<Option<Running>>,
    /// 单设备最近一次位置上报时间
    last_sent: RwLock<HashMap<String, Instant>>,
}

impl Gb28181Publisher {
    /// 校验配置并创建发布器（未启动）
    pub fn new(mut config: Gb28181Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            running: RwLock::new(None),
            last_sent: RwLock::new(HashMap::new()),
        })
    }

    /// 启动发布器：建立会话、完成首次注册、启动周期任务
    /// 首次注册失败视为致命错误，发布器保持停止状态
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if running.is_some() {
            return Err(Error::Config("publisher already running".to_string()));
        }

        let session = SipSession::start(self.config.clone()).await?;

        let channels = Arc::new(ChannelRegistry::new(self.config.region_code()));
        let subscriptions = Arc::new(SubscriptionRegistry::new());

        let dispatcher = Arc::new(QueryDispatcher::new(
            session.clone(),
            channels.clone(),
            subscriptions.clone(),
            self.config.clone(),
        ));
        session.set_request_handler(dispatcher).await;

        if let Err(e) = session.register().await {
            session.clear_request_handler().await;
            session.close().await;
            return Err(e);
        }

        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(session.clone().run_refresh_loop(shutdown.subscribe())),
            tokio::spawn(subscriptions.clone().run_cleanup_loop(shutdown.subscribe())),
            tokio::spawn(heartbeat_loop(
                session.clone(),
                channels.clone(),
                self.config.clone(),
                shutdown.subscribe(),
            )),
        ];

        *running = Some(Running {
            session,
            channels,
            subscriptions,
            shutdown,
            tasks,
        });

        tracing::info!(
            target: "gb28181::publisher",
            device_id = %self.config.device_id,
            platform = %self.config.platform_id,
            "publisher started"
        );

        Ok(())
    }

    /// 发布一条遥测记录
    /// 间隔内的重复上报静默丢弃（刻意降采样），不算错误
    pub async fn publish(&self, record: &TelemetryRecord) -> Result<()> {
        let running = self.running.read().await;
        let Some(running) = running.as_ref() else {
            return Err(Error::NotRunning);
        };
        if !running.session.is_registered() {
            return Err(Error::NotRegistered);
        }

        let channel = running.channels.update_from_telemetry(record).await;

        let now = Instant::now();
        {
            let last_sent = self.last_sent.read().await;
            if let Some(last) = last_sent.get(&record.device_id) {
                if now.duration_since(*last)
                    < Duration::from_secs(self.config.position_interval)
                {
                    return Ok(());
                }
            }
        }

        let sn = running.session.next_sn();
        let body = manscdp::position_notify(sn, &channel.channel_id, record);

        let matching = running
            .subscriptions
            .list_for_device(&channel.channel_id)
            .await;
        match matching.first() {
            Some(subscription) => {
                running
                    .session
                    .send_notify(&subscription.event_type, MANSCDP_CONTENT_TYPE, body)
                    .await?
            }
            None => {
                running
                    .session
                    .send_message(MANSCDP_CONTENT_TYPE, body)
                    .await?
            }
        }

        self.last_sent
            .write()
            .await
            .insert(record.device_id.clone(), now);

        tracing::debug!(
            target: "gb28181::publisher",
            channel_id = %channel.channel_id,
            "position published"
        );

        Ok(())
    }

    /// 停止发布器；重复调用为空操作
    pub async fn stop(&self) -> Result<()> {
        let Some(mut running) = self.running.write().await.take() else {
            return Ok(());
        };

        let _ = running.shutdown.send(true);
        for task in running.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(target: "gb28181::publisher", "task join failed: {}", e);
            }
        }

        running.session.clear_request_handler().await;
        if running.session.is_registered() {
            if let Err(e) = running.session.unregister().await {
                tracing::warn!(target: "gb28181::publisher", "unregister failed: {}", e);
            }
        }
        running.session.close().await;

        self.last_sent.write().await.clear();

        tracing::info!(target: "gb28181::publisher", "publisher stopped");
        Ok(())
    }

    /// 是否已注册到平台
    pub async fn is_connected(&self) -> bool {
        let running = self.running.read().await;
        running
            .as_ref()
            .map(|r| r.session.is_registered())
            .unwrap_or(false)
    }

    /// 在线通道数
    pub async fn online_device_count(&self) -> usize {
        let running = self.running.read().await;
        match running.as_ref() {
            Some(r) => r.channels.count_online().await,
            None => 0,
        }
    }

    /// 有效订阅数
    pub async fn active_subscription_count(&self) -> usize {
        let running = self.running.read().await;
        match running.as_ref() {
            Some(r) => r.subscriptions.count_active().await,
            None => 0,
        }
    }

    /// 会话本地地址（测试与诊断用）
    pub async fn local_addr(&self) -> Option<std::net::SocketAddr> {
        let running = self.running.read().await;
        running.as_ref().map(|r| r.session.local_addr())
    }
}

/// 心跳循环：定期发送 Keepalive 并顺带扫描失活通道
async fn heartbeat_loop(
    session: Arc<SipSession>,
    channels: Arc<ChannelRegistry>,
    config: Gb28181Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.heartbeat_interval));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if session.is_registered() {
                    let body = manscdp::keepalive_notify(session.next_sn(), &config.device_id);
                    if let Err(e) = session.send_message(MANSCDP_CONTENT_TYPE, body).await {
                        // 单次心跳失败不致命，平台按自身超时判定离线
                        tracing::warn!(target: "gb28181::publisher", "keepalive failed: {}", e);
                    }
                }

                let flipped = channels.mark_stale_offline(config.channel_timeout).await;
                if flipped > 0 {
                    tracing::debug!(
                        target: "gb28181::publisher",
                        flipped,
                        "stale channels marked offline"
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!(target: "gb28181::publisher", "heartbeat loop stopped");
}

#[async_trait]
impl NorthboundPublisher for Gb28181Publisher {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(Gb28181Publisher::start(self).await?)
    }

    async fn publish(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        Ok(Gb28181Publisher::publish(self, record).await?)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(Gb28181Publisher::stop(self).await?)
    }

    fn kind(&self) -> NorthboundKind {
        NorthboundKind::Gb28181
    }

    async fn is_connected(&self) -> bool {
        Gb28181Publisher::is_connected(self).await
    }

    async fn online_device_count(&self) -> usize {
        Gb28181Publisher::online_device_count(self).await
    }

    async fn active_subscription_count(&self) -> usize {
        Gb28181Publisher::active_subscription_count(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use aeris_northbound::NorthboundPublisher;

    fn test_config() -> Gb28181Config {
        Gb28181Config {
            device_id: "34020000001110000001".to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 0,
            platform_id: "34020000002000000001".to_string(),
            platform_ip: "127.0.0.1".to_string(),
            platform_port: 5060,
            sip_domain: String::new(),
            username: String::new(),
            password: "telemetry123".to_string(),
            transport: TransportKind::Udp,
            register_expires: 3600,
            heartbeat_interval: 60,
            position_interval: 1,
            channel_timeout: 180,
            device_name: String::new(),
        }
    }

    fn record(device_id: &str) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.to_string(),
            timestamp: 1_700_000_000_000,
            latitude: 31.23,
            longitude: 121.47,
            altitude: 100.0,
            vx: 1.0,
            vy: 1.0,
            yaw: 45.0,
        }
    }

    #[tokio::test]
    async fn test_publish_when_stopped_is_rejected() {
        let publisher = Gb28181Publisher::new(test_config()).unwrap();

        let result = publisher.publish(&record("UAV-0001")).await;
        assert!(matches!(result, Err(Error::NotRunning)));
        assert!(!publisher.is_connected().await);
        assert_eq!(publisher.online_device_count().await, 0);
        assert_eq!(publisher.active_subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let publisher = Gb28181Publisher::new(test_config()).unwrap();
        publisher.stop().await.unwrap();
        publisher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_trait_name() {
        let publisher = Gb28181Publisher::new(test_config()).unwrap();
        assert_eq!(NorthboundPublisher::name(&publisher), "gb28181");
        assert_eq!(publisher.kind(), NorthboundKind::Gb28181);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = test_config();
        config.device_id = "short".to_string();
        assert!(Gb28181Publisher::new(config).is_err());
    }
}
