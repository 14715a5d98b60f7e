// MANSCDP XML 消息体
// 出站通知/应答按国标模板拼装，入站查询用 quick-xml 解析

use crate::channel::Channel;
use crate::error::{Error, Result};
use aeris_types::TelemetryRecord;
use quick_xml::de::from_str;
use serde::Deserialize;

/// 入站查询消息（MESSAGE 消息体中的 <Query>）
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Query {
    /// 命令类型
    pub cmd_type: String,

    /// 序列号
    #[serde(rename = "SN", default)]
    pub sn: Option<u32>,

    /// 查询目标设备 ID
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
}

/// 解析入站查询消息体
pub fn parse_query(xml: &str) -> Result<Query> {
    from_str(xml.trim()).map_err(|e| Error::Xml(format!("failed to parse query: {}", e)))
}

/// 从订阅消息体中提取上报间隔（秒）
/// 订阅体不是完整结构化文档，这里按元素文本匹配
pub fn extract_interval(body: &str) -> Option<u64> {
    let start = body.find("<Interval>")? + "<Interval>".len();
    let end = body[start..].find("</Interval>")? + start;
    body[start..end].trim().parse().ok()
}

/// 位置通知（MobilePosition）
pub fn position_notify(sn: u32, channel_id: &str, record: &TelemetryRecord) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Notify>
<CmdType>MobilePosition</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<Time>{}</Time>
<Longitude>{:.6}</Longitude>
<Latitude>{:.6}</Latitude>
<Speed>{:.1}</Speed>
<Direction>{:.1}</Direction>
<Altitude>{:.1}</Altitude>
</Notify>"#,
        sn,
        channel_id,
        record.time_utc().format("%Y-%m-%dT%H:%M:%S"),
        record.longitude,
        record.latitude,
        record.ground_speed(),
        record.normalized_heading(),
        record.altitude
    )
}

/// 心跳通知（Keepalive）
pub fn keepalive_notify(sn: u32, device_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Notify>
<CmdType>Keepalive</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<Status>OK</Status>
</Notify>"#,
        sn, device_id
    )
}

/// 目录查询应答（Catalog）
pub fn catalog_response(sn: u32, device_id: &str, channels: &[Channel]) -> String {
    let mut items = String::new();
    for channel in channels {
        let status = if channel.online { "ON" } else { "OFF" };
        items.push_str(&format!(
            r#"<Item>
<DeviceID>{}</DeviceID>
<Name>{}</Name>
<Manufacturer>AERIS</Manufacturer>
<Model>UAV</Model>
<Owner>{}</Owner>
<CivilCode>{}</CivilCode>
<Parental>0</Parental>
<ParentID>{}</ParentID>
<RegisterWay>1</RegisterWay>
<Secrecy>0</Secrecy>
<Status>{}</Status>
<Longitude>{:.6}</Longitude>
<Latitude>{:.6}</Latitude>
</Item>
"#,
            channel.channel_id,
            channel.name,
            device_id,
            &channel.channel_id[..6],
            device_id,
            status,
            channel.last_telemetry.longitude,
            channel.last_telemetry.latitude
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>Catalog</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<SumNum>{}</SumNum>
<DeviceList Num="{}">
{}</DeviceList>
</Response>"#,
        sn,
        device_id,
        channels.len(),
        channels.len(),
        items
    )
}

/// 设备信息查询应答（DeviceInfo）
pub fn device_info_response(sn: u32, device_id: &str, device_name: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>DeviceInfo</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<Result>OK</Result>
<DeviceName>{}</DeviceName>
<Manufacturer>AERIS</Manufacturer>
<Model>UAV-GW</Model>
<Firmware>{}</Firmware>
</Response>"#,
        sn,
        device_id,
        device_name,
        env!("CARGO_PKG_VERSION")
    )
}

/// 设备状态查询应答（DeviceStatus）
pub fn device_status_response(sn: u32, device_id: &str, online: bool) -> String {
    let online_text = if online { "ONLINE" } else { "OFFLINE" };
    format!(
        r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>DeviceStatus</CmdType>
<SN>{}</SN>
<DeviceID>{}</DeviceID>
<Result>OK</Result>
<Online>{}</Online>
<Status>OK</Status>
</Response>"#,
        sn, device_id, online_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(vx: f64, vy: f64, yaw: f64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: "UAV-0001".to_string(),
            timestamp: 1_577_880_000_000, // 2020-01-01T12:00:00Z
            latitude: 31.230416,
            longitude: 121.473701,
            altitude: 120.5,
            vx,
            vy,
            yaw,
        }
    }

    fn channel(channel_id: &str, online: bool) -> Channel {
        Channel {
            channel_id: channel_id.to_string(),
            name: "UAV-0001".to_string(),
            source_device_id: "UAV-0001".to_string(),
            online,
            last_update: Utc::now(),
            last_telemetry: record(0.0, 0.0, 0.0),
        }
    }

    #[test]
    fn test_position_notify_speed_and_direction() {
        let body = position_notify(1, "34020000131000000010", &record(3.0, 4.0, -10.0));

        assert!(body.starts_with("<?xml version=\"1.0\" encoding=\"GB2312\"?>"));
        assert!(body.contains("<CmdType>MobilePosition</CmdType>"));
        assert!(body.contains("<DeviceID>34020000131000000010</DeviceID>"));
        assert!(body.contains("<Time>2020-01-01T12:00:00</Time>"));
        assert!(body.contains("<Speed>5.0</Speed>"));
        assert!(body.contains("<Direction>350.0</Direction>"));
        assert!(body.contains("<Longitude>121.473701</Longitude>"));
        assert!(body.contains("<Latitude>31.230416</Latitude>"));
        assert!(body.contains("<Altitude>120.5</Altitude>"));
    }

    #[test]
    fn test_keepalive_notify() {
        let body = keepalive_notify(7, "34020000001110000001");
        assert!(body.contains("<CmdType>Keepalive</CmdType>"));
        assert!(body.contains("<SN>7</SN>"));
        assert!(body.contains("<Status>OK</Status>"));
    }

    #[test]
    fn test_catalog_response_counts() {
        let channels = vec![
            channel("34020000131000000010", true),
            channel("34020000131000000020", false),
        ];
        let body = catalog_response(3, "34020000001110000001", &channels);

        assert!(body.contains("<SumNum>2</SumNum>"));
        assert!(body.contains("<DeviceList Num=\"2\">"));
        assert_eq!(body.matches("<Item>").count(), 2);
        assert!(body.contains("<DeviceID>34020000131000000010</DeviceID>"));
        assert!(body.contains("<Status>ON</Status>"));
        assert!(body.contains("<Status>OFF</Status>"));
    }

    #[test]
    fn test_catalog_response_empty() {
        let body = catalog_response(4, "34020000001110000001", &[]);
        assert!(body.contains("<SumNum>0</SumNum>"));
        assert_eq!(body.matches("<Item>").count(), 0);
    }

    #[test]
    fn test_parse_query() {
        let xml = r#"<?xml version="1.0" encoding="GB2312"?>
<Query>
<CmdType>Catalog</CmdType>
<SN>42</SN>
<DeviceID>34020000001110000001</DeviceID>
</Query>"#;

        let query = parse_query(xml).unwrap();
        assert_eq!(query.cmd_type, "Catalog");
        assert_eq!(query.sn, Some(42));
        assert_eq!(query.device_id, "34020000001110000001");
    }

    #[test]
    fn test_parse_query_rejects_garbage() {
        assert!(parse_query("not xml at all").is_err());
    }

    #[test]
    fn test_extract_interval() {
        assert_eq!(
            extract_interval("<Subscribe><Interval>10</Interval></Subscribe>"),
            Some(10)
        );
        assert_eq!(extract_interval("<Interval> 30 </Interval>"), Some(30));
        assert_eq!(extract_interval("<Subscribe></Subscribe>"), None);
        assert_eq!(extract_interval("<Interval>abc</Interval>"), None);
    }

    #[test]
    fn test_device_info_and_status_responses() {
        let info = device_info_response(5, "34020000001110000001", "AERIS UAV Gateway");
        assert!(info.contains("<CmdType>DeviceInfo</CmdType>"));
        assert!(info.contains("<DeviceName>AERIS UAV Gateway</DeviceName>"));

        let status = device_status_response(6, "34020000001110000001", true);
        assert!(status.contains("<CmdType>DeviceStatus</CmdType>"));
        assert!(status.contains("<Online>ONLINE</Online>"));
    }
}
