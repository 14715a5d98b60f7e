// SIP 消息解析和生成
// 支持 GB28181 标准的 SIP 消息格式

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Message,
    Subscribe,
    Notify,
    Invite,
    Ack,
    Bye,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Info => "INFO",
        };
        write!(f, "{}", s)
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "INFO" => Some(SipMethod::Info),
            _ => None,
        }
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// CSeq 头部中的序号部分
    pub fn cseq_number(&self) -> Option<u32> {
        cseq_number(self.headers.get("CSeq"))
    }

    /// Expires 头部值
    pub fn expires(&self) -> Option<u32> {
        self.headers.get("Expires").and_then(|v| v.trim().parse().ok())
    }

    /// 从字符串解析 SIP 请求
    pub fn parse(s: &str) -> Result<Self> {
        let (start_line, headers, body) = split_message(s)?;

        let mut parts = start_line.split_whitespace();
        let method = parts
            .next()
            .and_then(SipMethod::parse)
            .ok_or_else(|| Error::Parse(format!("unknown method in {:?}", start_line)))?;
        let uri = parts
            .next()
            .ok_or_else(|| Error::Parse("request line missing URI".to_string()))?
            .to_string();
        let version = parts
            .next()
            .ok_or_else(|| Error::Parse("request line missing version".to_string()))?
            .to_string();

        Ok(Self {
            method,
            uri,
            version,
            headers,
            body,
        })
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        write_headers_and_body(f, &self.headers, self.body.as_deref())
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// 构造应答，回填请求中的对话头部
    pub fn reply_to(req: &SipRequest, status_code: u16, reason_phrase: &str) -> Self {
        let mut resp = Self::new(status_code, reason_phrase);
        for key in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = req.headers.get(key) {
                resp.add_header(key, value.clone());
            }
        }
        resp
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// 是否 200 类成功应答
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn cseq_number(&self) -> Option<u32> {
        cseq_number(self.headers.get("CSeq"))
    }

    pub fn expires(&self) -> Option<u32> {
        self.headers.get("Expires").and_then(|v| v.trim().parse().ok())
    }

    /// 从字符串解析 SIP 响应
    pub fn parse(s: &str) -> Result<Self> {
        let (start_line, headers, body) = split_message(s)?;

        let mut parts = start_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| Error::Parse("empty status line".to_string()))?
            .to_string();
        let status_code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| Error::Parse(format!("invalid status code in {:?}", start_line)))?;
        let reason_phrase = parts.next().unwrap_or("").to_string();

        Ok(Self {
            version,
            status_code,
            reason_phrase,
            headers,
            body,
        })
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        )?;
        write_headers_and_body(f, &self.headers, self.body.as_deref())
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::parse(s)?))
        } else {
            Ok(SipMessage::Request(SipRequest::parse(s)?))
        }
    }
}

fn cseq_number(value: Option<&String>) -> Option<u32> {
    value
        .and_then(|v| v.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

fn write_headers_and_body(
    f: &mut fmt::Formatter<'_>,
    headers: &HashMap<String, String>,
    body: Option<&str>,
) -> fmt::Result {
    for (key, value) in headers {
        write!(f, "{}: {}\r\n", key, value)?;
    }
    match body {
        Some(body) => {
            write!(f, "Content-Length: {}\r\n\r\n", body.len())?;
            write!(f, "{}", body)
        }
        None => write!(f, "Content-Length: 0\r\n\r\n"),
    }
}

/// 拆分起始行、头部和消息体
fn split_message(s: &str) -> Result<(String, HashMap<String, String>, Option<String>)> {
    let lines: Vec<&str> = s.split("\r\n").collect();

    if lines.is_empty() || lines[0].is_empty() {
        return Err(Error::Parse("empty SIP message".to_string()));
    }

    let start_line = lines[0].to_string();

    let mut headers = HashMap::new();
    let mut body_start = lines.len();

    for (i, line) in lines.iter().enumerate().skip(1) {
        if line.is_empty() {
            body_start = i + 1;
            break;
        }

        if let Some(pos) = line.find(':') {
            let key = line[..pos].trim().to_string();
            let value = line[pos + 1..].trim().to_string();
            headers.insert(key, value);
        }
    }

    let body = if body_start < lines.len() {
        let body_str = lines[body_start..].join("\r\n");
        if body_str.is_empty() {
            None
        } else {
            Some(body_str)
        }
    } else {
        None
    };

    Ok((start_line, headers, body))
}
