//! Inbound message routing.
//!
//! The adapter callback only enqueues raw frames; a single task per
//! connection drains that queue and routes every frame either to the
//! notification subscribers or to the reply queue of the channel encoded in
//! its context.

use crate::channel::VppReply;
use crate::connection::ConnectionInner;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{broadcast, mpsc};
use vppapi_protocol::{Codec, MessageType, RequestContext};

/// Runs until the connection is disconnected or dropped.
pub(crate) async fn run(
    conn: Weak<ConnectionInner>,
    mut inbound: mpsc::Receiver<(u16, Bytes)>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let (msg_id, data) = tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.recv() => break,
        };

        let Some(conn) = conn.upgrade() else {
            break;
        };
        conn.dispatch(msg_id, data).await;
    }
    tracing::debug!("inbound dispatcher stopped");
}

impl ConnectionInner {
    /// Routes one inbound frame.
    pub(crate) async fn dispatch(self: &Arc<Self>, msg_id: u16, data: Bytes) {
        let Some(prototype) = self.registry.lookup(None, msg_id) else {
            self.dispatch_unregistered(msg_id, data).await;
            return;
        };

        let context = match Codec::decode_msg_context(&data, prototype.msg_type()) {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!("malformed {} (ID {}): {}", prototype.name(), msg_id, e);
                return;
            }
        };
        let ctx = RequestContext::unpack(context);

        if self.trace.is_enabled() {
            let mut msg = prototype.new_instance();
            match Codec::decode_msg(&data, msg.as_mut()) {
                Ok(()) => self.trace.record(Arc::from(msg), ctx.channel_id, true),
                Err(e) => tracing::debug!("trace: failed to decode {}: {}", prototype.name(), e),
            }
        }

        if context == 0 || self.subscriptions.contains(msg_id) {
            let delivered = self.subscriptions.dispatch(msg_id, &data);
            tracing::debug!(
                "notification {} (ID {}) offered to {} subscriber(s)",
                prototype.name(),
                msg_id,
                delivered
            );
            return;
        }

        let reply_tx = match self.channels.read().get(&ctx.channel_id) {
            Some(entry) => entry.reply_tx.clone(),
            None => {
                tracing::debug!(
                    "reply {} for unknown channel {}, dropping",
                    prototype.name(),
                    ctx.channel_id
                );
                return;
            }
        };

        let is_ping_reply = self
            .ping_ids()
            .map(|ids| ids.reply == msg_id)
            .unwrap_or(false);
        let reply = VppReply {
            msg_id,
            seq_num: ctx.seq_num,
            data,
            last_received: is_ping_reply && ctx.multipart,
            err: None,
        };

        tracing::debug!(
            "reply {} (ID {}) -> channel {} seq_num={} multipart={}",
            prototype.name(),
            msg_id,
            ctx.channel_id,
            ctx.seq_num,
            ctx.multipart
        );
        self.deliver_reply(ctx.channel_id, reply_tx, reply).await;
    }

    /// Routes a frame whose wire ID has no registered prototype. If it reads
    /// as a reply addressed to a live channel it is handed over undecoded;
    /// the waiting caller knows the type it expects.
    async fn dispatch_unregistered(&self, msg_id: u16, data: Bytes) {
        let context = Codec::decode_msg_context(&data, MessageType::Reply).unwrap_or(0);
        let ctx = RequestContext::unpack(context);
        let reply_tx = match self.channels.read().get(&ctx.channel_id) {
            Some(entry) if context != 0 => entry.reply_tx.clone(),
            _ => {
                tracing::warn!("unknown message ID {} received ({} bytes), dropping", msg_id, data.len());
                return;
            }
        };

        tracing::debug!(
            "unregistered message ID {} -> channel {} seq_num={}",
            msg_id,
            ctx.channel_id,
            ctx.seq_num
        );
        let reply = VppReply {
            msg_id,
            seq_num: ctx.seq_num,
            data,
            last_received: false,
            err: None,
        };
        self.deliver_reply(ctx.channel_id, reply_tx, reply).await;
    }

    async fn deliver_reply(&self, channel_id: u16, reply_tx: mpsc::Sender<VppReply>, reply: VppReply) {
        match reply_tx
            .send_timeout(reply, self.config.reply_delivery_timeout())
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(reply)) => {
                tracing::warn!(
                    "channel {} reply queue full, dropping reply seq_num={}",
                    channel_id,
                    reply.seq_num
                );
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!("channel {} closed, dropping reply", channel_id);
            }
        }

        self.touch_last_reply();
    }
}

#[cfg(test)]
mod tests {
    use crate::adapter::MockAdapter;
    use crate::config::ConnectionConfig;
    use crate::test_messages::*;
    use crate::Connection;
    use std::sync::Arc;
    use std::time::Duration;
    use vppapi_protocol::{ControlPing, ControlPingReply, RequestContext};

    #[tokio::test]
    async fn test_reply_for_closed_channel_is_dropped() {
        let adapter = Arc::new(MockAdapter::new());
        let conn = Connection::new(adapter.clone(), ConnectionConfig::default()).unwrap();
        conn.register_messages(all_messages()).unwrap();
        conn.connect().await.unwrap();

        let ch = conn.new_channel().unwrap();
        let closed_id = ch.id();
        ch.close();
        tokio::time::timeout(Duration::from_secs(1), async {
            while conn.channel_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let stray = ControlPingReply {
            vpe_pid: 7,
            ..Default::default()
        };
        adapter
            .inject(&stray, RequestContext::new(closed_id, false, 1).pack())
            .unwrap();

        let ch = conn.new_channel().unwrap();
        let ctx = ch.send_request(ControlPing).await.unwrap();
        let mut reply = ControlPingReply::default();
        ctx.receive_reply(&mut reply).await.unwrap();
        assert_eq!(reply.vpe_pid, std::process::id());
    }

    #[tokio::test]
    async fn test_full_reply_queue_drops() {
        let config = ConnectionConfig::default().with_reply_delivery_timeout(Duration::from_millis(10));
        let adapter = Arc::new(MockAdapter::new());
        let conn = Connection::new(adapter.clone(), config).unwrap();
        conn.register_messages(all_messages()).unwrap();
        conn.connect().await.unwrap();

        let ch = conn.new_channel_buffered(4, 1).unwrap();
        adapter.mock_reply(
            (0..3)
                .map(|i| {
                    Box::new(SwInterfaceDetails {
                        sw_if_index: i,
                        interface_name: format!("eth{}", i),
                    }) as Box<dyn vppapi_protocol::Message>
                })
                .collect(),
        );
        let ctx = ch.send_multi_request(SwInterfaceDump::default()).await.unwrap();

        // only the first part fits; the rest and the terminator time out
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut details = SwInterfaceDetails::default();
        assert!(!ctx.receive_reply(&mut details).await.unwrap());
        assert_eq!(details.interface_name, "eth0");

        ch.set_reply_timeout(Duration::from_millis(50));
        assert!(ctx.receive_reply(&mut details).await.unwrap_err().is_timeout());
    }
}
