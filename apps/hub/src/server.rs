//! WebSocket 订阅服务
//!
//! 每个连接拆成读写两半：
//!
//! - 写：从 [`ChannelSink`] 的接收端取消息发送；接收端关闭（被广播器移除）即结束
//! - 读：客户端上行消息只记录日志；收到 Close 或读错误即结束
//!
//! 任一半结束后注销订阅者。

use crate::broadcaster::{Broadcaster, ChannelSink};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// 接受连接直到任务被取消
pub async fn serve(listener: TcpListener, broadcaster: Arc<Broadcaster>, subscriber_buffer: usize) {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket server listening on ws://{}", addr),
        Err(e) => warn!("WebSocket server listening on unknown address: {}", e),
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("New connection from {}", peer);
                let broadcaster = broadcaster.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, broadcaster, subscriber_buffer).await;
                });
            },
            Err(e) => warn!("Accept error: {}", e),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broadcaster: Arc<Broadcaster>,
    subscriber_buffer: usize,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        },
    };
    let (mut write, mut read) = ws.split();

    let (sink, mut outbound) = ChannelSink::new(subscriber_buffer);
    let id = broadcaster.register(Arc::new(sink), peer.to_string());

    let writer = async {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write.send(Message::Text(message.to_string())).await {
                debug!("Send to {} failed: {}", peer, e);
                break;
            }
        }
        let _ = write.close().await;
    };

    let reader = async {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => debug!("Message from {}: {}", peer, text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {},
                Err(e) => {
                    debug!("Read from {} failed: {}", peer, e);
                    break;
                },
            }
        }
    };

    tokio::select! {
        _ = writer => {},
        _ = reader => {
            broadcaster.mark_closing(id);
        },
    }

    broadcaster.unregister(id);
}
