// SIP 用户代理会话
// 维护注册生命周期、出站事务匹配与入站请求分发

use crate::config::Gb28181Config;
use crate::error::{Error, Result};
use crate::sip::auth::{DigestAuthenticator, DigestChallenge};
use crate::sip::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use crate::sip::transport::SipTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

/// 事务应答等待上限
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// 刷新连续失败阈值，达到后降级为未注册并轮换注册对话
const MAX_REFRESH_FAILURES: u32 = 3;

/// 入站请求处理策略
/// 未安装处理器时会话对任何入站请求自动应答 200 OK
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: SipRequest) -> SipResponse;
}

/// 注册对话标识，会话生命周期内稳定；降级重建时整体轮换
struct RegisterDialog {
    call_id: String,
    tag: String,
}

impl RegisterDialog {
    fn generate(domain: &str) -> Self {
        Self {
            call_id: format!(
                "{:08x}{:08x}@{}",
                rand::random::<u32>(),
                rand::random::<u32>(),
                domain
            ),
            tag: format!("{:08x}", rand::random::<u32>()),
        }
    }
}

/// GB28181 信令会话（网关侧用户代理）
pub struct SipSession {
    config: Gb28181Config,
    transport: SipTransport,
    registered: AtomicBool,
    registered_at: RwLock<Option<DateTime<Utc>>>,
    granted_expires: AtomicU32,
    cseq: AtomicU32,
    sn: AtomicU32,
    register_dialog: RwLock<RegisterDialog>,
    /// register 互斥：刷新定时器与调用方不允许并发握手
    registering: Mutex<()>,
    pending: Mutex<HashMap<String, oneshot::Sender<SipResponse>>>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    refresh_failures: AtomicU32,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SipSession {
    /// 建立传输、生成注册对话标识并启动入站分发
    pub async fn start(config: Gb28181Config) -> Result<Arc<Self>> {
        let local: SocketAddr = format!("{}:{}", config.local_ip, config.local_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid local address: {}", e)))?;
        let peer: SocketAddr = format!("{}:{}", config.platform_ip, config.platform_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid platform address: {}", e)))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (transport, inbound, recv_task) =
            SipTransport::connect(config.transport, local, peer, shutdown_rx).await?;

        let dialog = RegisterDialog::generate(&config.sip_domain);
        let expires = config.register_expires;

        let session = Arc::new(Self {
            config,
            transport,
            registered: AtomicBool::new(false),
            registered_at: RwLock::new(None),
            granted_expires: AtomicU32::new(expires),
            cseq: AtomicU32::new(0),
            sn: AtomicU32::new(0),
            register_dialog: RwLock::new(dialog),
            registering: Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            refresh_failures: AtomicU32::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let dispatch_task = tokio::spawn({
            let session = session.clone();
            async move { session.dispatch_loop(inbound).await }
        });
        session.tasks.lock().await.extend([recv_task, dispatch_task]);

        tracing::info!(
            target: "gb28181::sip",
            device_id = %session.config.device_id,
            local = %session.transport.local_addr(),
            platform = %session.transport.peer_addr(),
            "SIP session started"
        );

        Ok(session)
    }

    /// 向平台注册
    /// 收到 401/407 挑战时计算 Digest 应答并重发；成功后进入已注册状态
    pub async fn register(&self) -> Result<()> {
        let _guard = self.registering.lock().await;

        let response = self.register_exchange(self.config.register_expires).await?;
        if !response.is_success() {
            return Err(Error::Registration(format!(
                "platform replied {} {}",
                response.status_code, response.reason_phrase
            )));
        }

        let granted = response
            .expires()
            .filter(|e| *e > 0)
            .unwrap_or(self.config.register_expires);
        self.granted_expires.store(granted, Ordering::SeqCst);
        self.registered.store(true, Ordering::SeqCst);
        *self.registered_at.write().await = Some(Utc::now());
        self.refresh_failures.store(0, Ordering::SeqCst);

        tracing::info!(
            target: "gb28181::sip",
            platform = %self.config.platform_id,
            expires = granted,
            "registered with platform"
        );

        Ok(())
    }

    /// 注销（Expires: 0），停机时尽力而为
    pub async fn unregister(&self) -> Result<()> {
        let _guard = self.registering.lock().await;

        let result = self.register_exchange(0).await;
        self.registered.store(false, Ordering::SeqCst);
        *self.registered_at.write().await = None;

        let response = result?;
        if !response.is_success() {
            return Err(Error::Rejected(response.status_code));
        }

        tracing::info!(target: "gb28181::sip", "unregistered from platform");
        Ok(())
    }

    /// 注册刷新循环：按协商有效期的 80%（下限 60 秒）定期重注册
    /// 单次失败记录并等待下个周期；连续失败达到阈值后降级重建对话
    pub async fn run_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let granted = self.granted_expires.load(Ordering::SeqCst) as u64;
            let wait = Duration::from_secs((granted * 4 / 5).max(60));

            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => break,
            }

            match self.register().await {
                Ok(()) => {
                    tracing::debug!(target: "gb28181::sip", "registration refreshed");
                }
                Err(e) => {
                    let failures = self.refresh_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(
                        target: "gb28181::sip",
                        failures,
                        "registration refresh failed: {}",
                        e
                    );

                    if failures >= MAX_REFRESH_FAILURES {
                        self.registered.store(false, Ordering::SeqCst);
                        *self.register_dialog.write().await =
                            RegisterDialog::generate(&self.config.sip_domain);
                        self.refresh_failures.store(0, Ordering::SeqCst);
                        tracing::warn!(
                            target: "gb28181::sip",
                            "demoted to unregistered after repeated refresh failures"
                        );
                    }
                }
            }
        }

        tracing::debug!(target: "gb28181::sip", "refresh loop stopped");
    }

    /// 发送 MESSAGE 请求（新对话，携带 XML 消息体）
    pub async fn send_message(&self, content_type: &str, body: String) -> Result<()> {
        let request = self.build_body_request(SipMethod::Message, content_type, body, None)?;
        self.send_checked(request).await
    }

    /// 发送 NOTIFY 请求（新对话，订阅状态 active）
    pub async fn send_notify(&self, event: &str, content_type: &str, body: String) -> Result<()> {
        let request =
            self.build_body_request(SipMethod::Notify, content_type, body, Some(event))?;
        self.send_checked(request).await
    }

    /// 安装入站请求处理器
    pub async fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn clear_request_handler(&self) {
        *self.handler.write().await = None;
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub async fn registered_at(&self) -> Option<DateTime<Utc>> {
        *self.registered_at.read().await
    }

    /// XML 消息体序列号（独立于信令层 CSeq）
    pub fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// 停止后台任务并等待其退出
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(target: "gb28181::sip", "session task join failed: {}", e);
            }
        }

        tracing::info!(target: "gb28181::sip", "SIP session closed");
    }

    /// REGISTER 往返，处理一次鉴权挑战
    async fn register_exchange(&self, expires: u32) -> Result<SipResponse> {
        let uri = format!(
            "sip:{}@{}",
            self.config.platform_id, self.config.sip_domain
        );

        let request = self.build_register(&uri, expires, None).await;
        let response = self.send_request_wait(&request).await?;

        if response.status_code != 401 && response.status_code != 407 {
            return Ok(response);
        }

        let challenge_value = response
            .header("WWW-Authenticate")
            .or_else(|| response.header("Proxy-Authenticate"))
            .ok_or_else(|| Error::Auth("challenge response without challenge header".to_string()))?;
        let challenge = DigestChallenge::parse(challenge_value)?;
        let mut authenticator = DigestAuthenticator::new(
            self.config.username.as_str(),
            self.config.password.as_str(),
            challenge,
        );
        let authorization = authenticator.respond("REGISTER", &uri);

        tracing::debug!(target: "gb28181::sip", "answering registration challenge");

        let request = self.build_register(&uri, expires, Some(authorization)).await;
        self.send_request_wait(&request).await
    }

    async fn build_register(
        &self,
        uri: &str,
        expires: u32,
        authorization: Option<String>,
    ) -> SipRequest {
        let dialog = self.register_dialog.read().await;
        let local = self.transport.local_addr();
        let cseq = self.next_cseq();

        let mut request = SipRequest::new(SipMethod::Register, uri);
        request.add_header("Via", self.via_header(local.port()));
        request.add_header(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.config.device_id, self.config.sip_domain, dialog.tag
            ),
        );
        request.add_header(
            "To",
            format!("<sip:{}@{}>", self.config.device_id, self.config.sip_domain),
        );
        request.add_header("Call-ID", dialog.call_id.clone());
        request.add_header("CSeq", format!("{} REGISTER", cseq));
        request.add_header(
            "Contact",
            format!(
                "<sip:{}@{}:{}>",
                self.config.device_id,
                self.config.local_ip,
                local.port()
            ),
        );
        request.add_header("Max-Forwards", "70");
        request.add_header("Expires", expires.to_string());
        if let Some(authorization) = authorization {
            request.add_header("Authorization", authorization);
        }

        request
    }

    fn build_body_request(
        &self,
        method: SipMethod,
        content_type: &str,
        body: String,
        event: Option<&str>,
    ) -> Result<SipRequest> {
        if !self.is_registered() {
            return Err(Error::NotRegistered);
        }

        let local = self.transport.local_addr();
        let cseq = self.next_cseq();

        let mut request = SipRequest::new(
            method,
            format!(
                "sip:{}@{}:{}",
                self.config.platform_id, self.config.platform_ip, self.config.platform_port
            ),
        );
        request.add_header("Via", self.via_header(local.port()));
        request.add_header(
            "From",
            format!(
                "<sip:{}@{}>;tag={:08x}",
                self.config.device_id,
                self.config.sip_domain,
                rand::random::<u32>()
            ),
        );
        request.add_header(
            "To",
            format!(
                "<sip:{}@{}>",
                self.config.platform_id, self.config.sip_domain
            ),
        );
        request.add_header(
            "Call-ID",
            format!(
                "{:08x}{:08x}@{}",
                rand::random::<u32>(),
                rand::random::<u32>(),
                self.config.sip_domain
            ),
        );
        request.add_header("CSeq", format!("{} {}", cseq, method));
        request.add_header("Content-Type", content_type);
        request.add_header("Max-Forwards", "70");
        if let Some(event) = event {
            request.add_header("Event", event);
            request.add_header("Subscription-State", "active");
        }
        request.set_body(body);

        Ok(request)
    }

    fn via_header(&self, local_port: u16) -> String {
        format!(
            "SIP/2.0/{} {}:{};rport;branch=z9hG4bK{:08x}",
            self.config.transport.via_token(),
            self.config.local_ip,
            local_port,
            rand::random::<u32>()
        )
    }

    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 发送请求并等待匹配应答（按 Call-ID + CSeq 序号）
    async fn send_request_wait(&self, request: &SipRequest) -> Result<SipResponse> {
        let key = format!(
            "{}:{}",
            request.header("Call-ID").unwrap_or_default(),
            request.cseq_number().unwrap_or(0)
        );

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        if let Err(e) = self.transport.send(&request.to_string()).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        match timeout(TRANSACTION_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Timeout(format!("transaction {} dropped", key))),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                Err(Error::Timeout(format!("no reply for transaction {}", key)))
            }
        }
    }

    async fn send_checked(&self, request: SipRequest) -> Result<()> {
        let response = self.send_request_wait(&request).await?;
        if !response.is_success() {
            return Err(Error::Rejected(response.status_code));
        }
        Ok(())
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<String>) {
        while let Some(raw) = inbound.recv().await {
            match SipMessage::parse(&raw) {
                Ok(SipMessage::Response(response)) => self.route_response(response).await,
                Ok(SipMessage::Request(request)) => self.handle_inbound(request).await,
                Err(e) => {
                    tracing::debug!(target: "gb28181::sip", "dropping unparsable message: {}", e);
                }
            }
        }

        tracing::debug!(target: "gb28181::sip", "dispatch loop stopped");
    }

    async fn route_response(&self, response: SipResponse) {
        let key = format!(
            "{}:{}",
            response.header("Call-ID").unwrap_or_default(),
            response.cseq_number().unwrap_or(0)
        );

        match self.pending.lock().await.remove(&key) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(
                    target: "gb28181::sip",
                    status = response.status_code,
                    "unmatched response for transaction {}",
                    key
                );
            }
        }
    }

    async fn handle_inbound(&self, request: SipRequest) {
        let handler = self.handler.read().await.clone();

        let response = match handler {
            Some(handler) => handler.handle(request).await,
            None => SipResponse::reply_to(&request, 200, "OK"),
        };

        if let Err(e) = self.transport.send(&response.to_string()).await {
            tracing::warn!(target: "gb28181::sip", "failed to send reply: {}", e);
        }
    }
}
