use crate::types::NorthboundKind;
use aeris_types::TelemetryRecord;
use async_trait::async_trait;

/// 统一北向发布接口
/// 由核心引擎驱动：启动后持续投递遥测记录，关停时释放底层连接
#[async_trait]
pub trait NorthboundPublisher: Send + Sync {
    /// 建立北向连接并启动后台任务；失败时发布器不可用
    async fn start(&self) -> anyhow::Result<()>;

    /// 发布一条遥测记录；发布器未运行或未连接时返回错误
    async fn publish(&self, record: &TelemetryRecord) -> anyhow::Result<()>;

    /// 停止后台任务并断开连接；重复调用应为幂等
    async fn stop(&self) -> anyhow::Result<()>;

    /// 发布通道类型
    fn kind(&self) -> NorthboundKind;

    /// 发布通道名称
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// 是否已与远端建立连接
    async fn is_connected(&self) -> bool;

    /// 当前在线设备数
    async fn online_device_count(&self) -> usize;

    /// 当前有效订阅数
    async fn active_subscription_count(&self) -> usize;
}
