use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// 统一遥测记录
/// 南向适配器解码后、北向发布器消费的统一数据格式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// 遥测源设备 ID（机身序列号等）
    pub device_id: String,

    /// 采样时间（Unix 毫秒）
    pub timestamp: i64,

    /// 纬度（度）
    pub latitude: f64,

    /// 经度（度）
    pub longitude: f64,

    /// 海拔（米）
    pub altitude: f64,

    /// 水平速度分量（米/秒，机体北向）
    pub vx: f64,

    /// 水平速度分量（米/秒，机体东向）
    pub vy: f64,

    /// 航向角（度，可为负或超过 360）
    pub yaw: f64,
}

impl TelemetryRecord {
    /// 地速（米/秒）
    pub fn ground_speed(&self) -> f64 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }

    /// 航向归一化到 [0, 360)
    pub fn normalized_heading(&self) -> f64 {
        let mut heading = self.yaw % 360.0;
        if heading < 0.0 {
            heading += 360.0;
        }
        heading
    }

    /// 采样时间转 UTC；时间戳非法时退回当前时间
    pub fn time_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }
}
