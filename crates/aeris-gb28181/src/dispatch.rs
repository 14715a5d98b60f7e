// 入站请求分发
// 查询类消息先回 200 再异步发送正文应答（两段式），订阅同步授予

use crate::channel::ChannelRegistry;
use crate::config::Gb28181Config;
use crate::manscdp;
use crate::sip::message::{SipMethod, SipRequest, SipResponse};
use crate::sip::session::{RequestHandler, SipSession};
use crate::sip::MANSCDP_CONTENT_TYPE;
use crate::subscription::{Subscription, SubscriptionRegistry, DEVICE_FILTER_ALL};
use async_trait::async_trait;
use std::sync::Arc;

/// 订阅默认有效期（秒）
const DEFAULT_SUBSCRIBE_EXPIRES: u32 = 3600;

/// 订阅默认事件类型
const DEFAULT_EVENT_TYPE: &str = "presence";

/// 订阅默认上报间隔（秒）
const DEFAULT_REPORT_INTERVAL: u64 = 5;

/// 平台查询与订阅请求的分发器
pub struct QueryDispatcher {
    session: Arc<SipSession>,
    channels: Arc<ChannelRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    config: Gb28181Config,
}

impl QueryDispatcher {
    pub fn new(
        session: Arc<SipSession>,
        channels: Arc<ChannelRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        config: Gb28181Config,
    ) -> Self {
        Self {
            session,
            channels,
            subscriptions,
            config,
        }
    }

    async fn handle_query(&self, request: &SipRequest) -> SipResponse {
        let Some(body) = request.body.as_deref() else {
            tracing::debug!(target: "gb28181::dispatch", "MESSAGE without body acknowledged");
            return SipResponse::reply_to(request, 200, "OK");
        };

        let query = match manscdp::parse_query(body) {
            Ok(query) => query,
            Err(e) => {
                // 畸形查询不能中断信令对话，应答成功并丢弃
                tracing::warn!(target: "gb28181::dispatch", "malformed query body: {}", e);
                return SipResponse::reply_to(request, 200, "OK");
            }
        };

        let sn = query.sn.unwrap_or_else(|| self.session.next_sn());

        match query.cmd_type.as_str() {
            "Catalog" => self.answer_later(catalog_task(
                self.session.clone(),
                self.channels.clone(),
                self.config.device_id.clone(),
                sn,
            )),
            "DeviceInfo" => {
                let body = manscdp::device_info_response(
                    sn,
                    &self.config.device_id,
                    &self.config.device_name,
                );
                self.answer_later(send_task(self.session.clone(), body, "DeviceInfo"));
            }
            "DeviceStatus" => {
                let body = manscdp::device_status_response(
                    sn,
                    &self.config.device_id,
                    self.session.is_registered(),
                );
                self.answer_later(send_task(self.session.clone(), body, "DeviceStatus"));
            }
            other => {
                tracing::warn!(
                    target: "gb28181::dispatch",
                    cmd_type = %other,
                    "unrecognized command type acknowledged"
                );
            }
        }

        SipResponse::reply_to(request, 200, "OK")
    }

    async fn handle_subscribe(&self, request: &SipRequest) -> SipResponse {
        let Some(call_id) = request.header("Call-ID") else {
            return SipResponse::reply_to(request, 400, "Bad Request");
        };

        let expires = request.expires().unwrap_or(DEFAULT_SUBSCRIBE_EXPIRES);
        let event_type = request
            .header("Event")
            .unwrap_or(DEFAULT_EVENT_TYPE)
            .to_string();
        let interval = request
            .body
            .as_deref()
            .and_then(manscdp::extract_interval)
            .unwrap_or(DEFAULT_REPORT_INTERVAL);
        let device_filter = request
            .body
            .as_deref()
            .and_then(|body| manscdp::parse_query(body).ok())
            .map(|q| q.device_id)
            .filter(|id| !id.is_empty() && *id != self.config.device_id)
            .unwrap_or_else(|| DEVICE_FILTER_ALL.to_string());

        let subscription =
            Subscription::new(call_id, device_filter, interval, expires, event_type);

        tracing::info!(
            target: "gb28181::dispatch",
            id = %subscription.id,
            filter = %subscription.device_filter,
            interval = subscription.report_interval,
            expires,
            "position subscription granted"
        );

        self.subscriptions.add(subscription).await;

        let mut response = SipResponse::reply_to(request, 200, "OK");
        response.add_header("Expires", expires.to_string());
        response
    }

    fn answer_later(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        tokio::spawn(task);
    }
}

#[async_trait]
impl RequestHandler for QueryDispatcher {
    async fn handle(&self, request: SipRequest) -> SipResponse {
        match request.method {
            SipMethod::Message => self.handle_query(&request).await,
            SipMethod::Subscribe => self.handle_subscribe(&request).await,
            method => {
                tracing::warn!(
                    target: "gb28181::dispatch",
                    %method,
                    "unsupported inbound method acknowledged"
                );
                SipResponse::reply_to(&request, 200, "OK")
            }
        }
    }
}

async fn catalog_task(
    session: Arc<SipSession>,
    channels: Arc<ChannelRegistry>,
    device_id: String,
    sn: u32,
) {
    let listing = channels.list_all().await;
    let body = manscdp::catalog_response(sn, &device_id, &listing);
    send_task(session, body, "Catalog").await;
}

async fn send_task(session: Arc<SipSession>, body: String, cmd_type: &'static str) {
    match session.send_message(MANSCDP_CONTENT_TYPE, body).await {
        Ok(()) => {
            tracing::debug!(target: "gb28181::dispatch", cmd_type, "query answered");
        }
        Err(e) => {
            tracing::warn!(target: "gb28181::dispatch", cmd_type, "query answer failed: {}", e);
        }
    }
}
