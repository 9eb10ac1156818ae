//! Direct request/response streams.
//!
//! A [`Stream`] sits on a private channel without a worker: messages are
//! encoded and sent on the caller's task and replies are read straight from
//! the channel's reply queue, in arrival order and without sequence checks.

use crate::channel::{ChannelCore, VppRequest};
use crate::error::ClientError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use vppapi_protocol::{Codec, Message};

/// Creates a linked cancellation handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Triggers the paired [`CancelSignal`]s.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal observed by blocking stream receives.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped
    /// without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Options for [`Connection::new_stream`](crate::Connection::new_stream).
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Overrides the connection's reply timeout.
    pub reply_timeout: Option<Duration>,
    /// Overrides the connection's reply queue size.
    pub reply_queue_size: Option<usize>,
    pub cancel: Option<CancelSignal>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn with_reply_queue_size(mut self, size: usize) -> Self {
        self.reply_queue_size = Some(size.max(1));
        self
    }

    pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }
}

/// Request/response stream over a private channel.
pub struct Stream {
    core: Arc<ChannelCore>,
    cancel: Option<CancelSignal>,
}

impl Stream {
    pub(crate) fn new(core: Arc<ChannelCore>, options: StreamOptions) -> Self {
        if let Some(timeout) = options.reply_timeout {
            core.set_reply_timeout(timeout);
        }
        tracing::debug!("stream opened on channel {}", core.id());
        Self {
            core,
            cancel: options.cancel,
        }
    }

    /// ID of the underlying channel.
    pub fn id(&self) -> u16 {
        self.core.id()
    }

    /// Encodes and sends `msg` right away.
    pub fn send_msg<M: Message>(&self, msg: M) -> Result<(), ClientError> {
        let req = VppRequest {
            msg: Arc::new(msg),
            seq_num: self.core.next_seq(),
            multipart: false,
        };
        self.core.conn.process_request(self.core.id(), &req)
    }

    /// Waits for the next message routed to this stream.
    ///
    /// Replies are returned as received; engine error codes in them are not
    /// turned into errors.
    pub async fn recv_msg(&mut self) -> Result<Box<dyn Message>, ClientError> {
        let timeout = self.core.reply_timeout();
        let reply = self.core.recv_raw(timeout, self.cancel.as_mut()).await?;
        if let Some(err) = reply.err {
            return Err(err);
        }

        let prototype = self
            .core
            .conn
            .registry
            .lookup(None, reply.msg_id)
            .ok_or(ClientError::UnknownMessage(reply.msg_id))?;
        let mut msg = prototype.new_instance();
        Codec::decode_msg(&reply.data, msg.as_mut())?;
        Ok(msg)
    }

    /// Closes the stream and releases its channel.
    pub fn close(self) {}
}

impl Drop for Stream {
    fn drop(&mut self) {
        tracing::debug!("stream on channel {} closed", self.core.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use crate::config::ConnectionConfig;
    use crate::test_messages::*;
    use crate::Connection;
    use vppapi_protocol::{ControlPing, ControlPingReply};

    async fn connected() -> (Arc<MockAdapter>, Connection) {
        let adapter = Arc::new(MockAdapter::new());
        let conn = Connection::new(adapter.clone(), ConnectionConfig::default()).unwrap();
        conn.register_messages(all_messages()).unwrap();
        conn.connect().await.unwrap();
        (adapter, conn)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (_adapter, conn) = connected().await;
        let mut stream = conn.new_stream(StreamOptions::new()).unwrap();
        assert_eq!(conn.channel_count(), 1);

        stream.send_msg(ControlPing).unwrap();
        let msg = stream.recv_msg().await.unwrap();
        let reply = msg.downcast_ref::<ControlPingReply>().unwrap();
        assert_eq!(reply.vpe_pid, std::process::id());

        stream.close();
        assert_eq!(conn.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_dump_with_explicit_ping() {
        let (adapter, conn) = connected().await;
        let mut stream = conn.new_stream(StreamOptions::new()).unwrap();

        adapter.mock_reply(vec![
            Box::new(SwInterfaceDetails {
                sw_if_index: 1,
                interface_name: "local0".to_string(),
            }),
            Box::new(SwInterfaceDetails {
                sw_if_index: 2,
                interface_name: "eth0".to_string(),
            }),
        ]);
        stream.send_msg(SwInterfaceDump::default()).unwrap();
        stream.send_msg(ControlPing).unwrap();

        let mut names = Vec::new();
        loop {
            let msg = stream.recv_msg().await.unwrap();
            if msg.downcast_ref::<ControlPingReply>().is_some() {
                break;
            }
            let details = msg.downcast_ref::<SwInterfaceDetails>().unwrap();
            names.push(details.interface_name.clone());
        }
        assert_eq!(names, vec!["local0", "eth0"]);
    }

    #[tokio::test]
    async fn test_engine_errors_are_returned_as_replies() {
        let (adapter, conn) = connected().await;
        let mut stream = conn.new_stream(StreamOptions::new()).unwrap();

        adapter.mock_reply(vec![Box::new(SwInterfaceSetFlagsReply { retval: -6 })]);
        stream.send_msg(SwInterfaceSetFlags::default()).unwrap();

        let msg = stream.recv_msg().await.unwrap();
        assert_eq!(msg.as_retval().map(|r| r.retval()), Some(-6));
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let (_adapter, conn) = connected().await;
        let options = StreamOptions::new().with_reply_timeout(Duration::from_millis(30));
        let mut stream = conn.new_stream(options).unwrap();

        stream.send_msg(SwInterfaceSetFlags::default()).unwrap();
        let err = stream.recv_msg().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (adapter, conn) = connected().await;
        adapter.set_unresponsive(true);

        let (handle, signal) = cancel_pair();
        let options = StreamOptions::new()
            .with_reply_timeout(Duration::from_secs(10))
            .with_cancel(signal);
        let mut stream = conn.new_stream(options).unwrap();
        stream.send_msg(ControlPing).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let err = stream.recv_msg().await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let adapter = Arc::new(MockAdapter::new());
        let conn = Connection::new(adapter, ConnectionConfig::default()).unwrap();
        let stream = conn.new_stream(StreamOptions::new()).unwrap();
        assert!(matches!(
            stream.send_msg(ControlPing),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_dropped_handle_never_cancels() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        assert!(!signal.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(waited.is_err());
    }
}
