// 信令传输层
// UDP 数据报或 TCP 长连接两种方式，统一向会话投递原始报文

use crate::config::TransportKind;
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// 单条入站报文通道的容量
const INBOUND_QUEUE: usize = 64;

/// SIP 信令传输
pub struct SipTransport {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    inner: Inner,
}

enum Inner {
    Udp(Arc<UdpSocket>),
    Tcp(Mutex<OwnedWriteHalf>),
}

impl SipTransport {
    /// 建立到平台的传输并启动接收任务
    /// 返回传输本体、入站报文通道和接收任务句柄
    pub async fn connect(
        kind: TransportKind,
        local: SocketAddr,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, mpsc::Receiver<String>, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

        match kind {
            TransportKind::Udp => {
                let socket = Arc::new(UdpSocket::bind(local).await?);
                let local_addr = socket.local_addr()?;

                tracing::info!(
                    target: "gb28181::transport",
                    local = %local_addr,
                    platform = %peer,
                    "UDP transport bound"
                );

                let handle = tokio::spawn(udp_recv_loop(socket.clone(), tx, shutdown));

                Ok((
                    Self {
                        local_addr,
                        peer_addr: peer,
                        inner: Inner::Udp(socket),
                    },
                    rx,
                    handle,
                ))
            }
            TransportKind::Tcp => {
                let tcp_socket = if local.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                tcp_socket.bind(local)?;
                let stream = tcp_socket.connect(peer).await?;
                let local_addr = stream.local_addr()?;

                tracing::info!(
                    target: "gb28181::transport",
                    local = %local_addr,
                    platform = %peer,
                    "TCP transport connected"
                );

                let (read_half, write_half) = stream.into_split();
                let handle = tokio::spawn(tcp_recv_loop(read_half, tx, shutdown));

                Ok((
                    Self {
                        local_addr,
                        peer_addr: peer,
                        inner: Inner::Tcp(Mutex::new(write_half)),
                    },
                    rx,
                    handle,
                ))
            }
        }
    }

    /// 发送一条报文到平台
    pub async fn send(&self, payload: &str) -> Result<()> {
        match &self.inner {
            Inner::Udp(socket) => {
                socket.send_to(payload.as_bytes(), self.peer_addr).await?;
            }
            Inner::Tcp(writer) => {
                let mut writer = writer.lock().await;
                writer.write_all(payload.as_bytes()).await?;
            }
        }
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

async fn udp_recv_loop(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, addr)) => {
                        let text = String::from_utf8_lossy(&buf[..len]).to_string();
                        tracing::debug!(
                            target: "gb28181::transport",
                            remote = %addr,
                            bytes = len,
                            "datagram received"
                        );
                        if tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(target: "gb28181::transport", "UDP recv failed: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!(target: "gb28181::transport", "UDP recv loop stopped");
}

async fn tcp_recv_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending = Vec::new();
    let mut chunk = vec![0u8; 8192];

    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        tracing::warn!(target: "gb28181::transport", "platform closed TCP connection");
                        break;
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        while let Some(frame) = next_frame(&mut pending) {
                            if tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(target: "gb28181::transport", "TCP read failed: {}", e);
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!(target: "gb28181::transport", "TCP recv loop stopped");
}

/// 按头部 + Content-Length 从流缓冲中切出一条完整 SIP 报文
fn next_frame(pending: &mut Vec<u8>) -> Option<String> {
    let header_end = pending
        .windows(4)
        .position(|window| window == b"\r\n\r\n")?;

    let header_text = String::from_utf8_lossy(&pending[..header_end]);
    let content_length = header_text
        .split("\r\n")
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let total = header_end + 4 + content_length;
    if pending.len() < total {
        return None;
    }

    let frame = String::from_utf8_lossy(&pending[..total]).to_string();
    pending.drain(..total);
    Some(frame)
}
