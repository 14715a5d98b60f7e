// RFC 2617 Digest 鉴权
// 解析平台挑战并计算 Authorization 应答；纯计算，不做任何 I/O

use crate::error::{Error, Result};
use std::collections::HashMap;

/// 平台下发的 Digest 挑战
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// 解析 WWW-Authenticate / Proxy-Authenticate 头部值
    /// realm 与 nonce 缺失或为空视为协议错误
    pub fn parse(value: &str) -> Result<Self> {
        let params = parse_auth_params(value);

        let realm = params
            .get("realm")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::Auth("challenge missing realm".to_string()))?;
        let nonce = params
            .get("nonce")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::Auth("challenge missing nonce".to_string()))?;

        // qop 可能是 "auth,auth-int" 列表，取支持的 auth
        let qop = params.get("qop").and_then(|v| {
            v.split(',')
                .map(str::trim)
                .find(|q| *q == "auth")
                .map(str::to_string)
        });

        Ok(Self {
            realm,
            nonce,
            qop,
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
        })
    }
}

/// Digest 应答生成器
/// 持有凭据与挑战，每次生成递增 nonce-count 并抽取新的客户端随机数
pub struct DigestAuthenticator {
    username: String,
    password: String,
    challenge: DigestChallenge,
    nonce_count: u32,
}

impl DigestAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>, challenge: DigestChallenge) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            challenge,
            nonce_count: 0,
        }
    }

    /// 生成 Authorization 头部值
    pub fn respond(&mut self, method: &str, uri: &str) -> String {
        self.nonce_count += 1;
        let cnonce = format!("{:08x}", rand::random::<u32>());
        self.respond_with(method, uri, self.nonce_count, &cnonce)
    }

    fn respond_with(&self, method: &str, uri: &str, nonce_count: u32, cnonce: &str) -> String {
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            self.username, self.challenge.realm, self.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        let nc = format!("{:08x}", nonce_count);
        let response = match self.challenge.qop.as_deref() {
            Some(qop) => md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.challenge.nonce, nc, cnonce, qop, ha2
            )),
            None => md5_hex(&format!("{}:{}:{}", ha1, self.challenge.nonce, ha2)),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            self.username, self.challenge.realm, self.challenge.nonce, uri, response
        );
        if let Some(qop) = &self.challenge.qop {
            header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        if let Some(opaque) = &self.challenge.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}

/// 解析 Digest 参数串为键值对，容忍带或不带 "Digest " 前缀
fn parse_auth_params(value: &str) -> HashMap<String, String> {
    let rest = value.strip_prefix("Digest ").unwrap_or(value);

    let mut map = HashMap::new();

    for part in rest.split(',') {
        let trimmed = part.trim();
        if let Some(eq_idx) = trimmed.find('=') {
            let key = trimmed[..eq_idx].trim().to_string();
            let mut val = trimmed[eq_idx + 1..].trim().to_string();
            if val.starts_with('"') && val.ends_with('"') && val.len() >= 2 {
                val = val[1..val.len() - 1].to_string();
            }
            map.insert(key, val);
        }
    }

    map
}

pub(crate) fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}
