//! Logical channels and request/reply correlation.
//!
//! A channel is a single-caller conversation multiplexed over the shared
//! transport. Each request gets the next 16-bit sequence number; replies are
//! matched against it using cyclic ordering so that stale replies are skipped
//! and replies that overtook the awaited one are held back for the next call.

use crate::connection::ConnectionInner;
use crate::error::ClientError;
use crate::pool::ReplyQueue;
use crate::stream::CancelSignal;
use crate::subscription::SubscriptionHandle;
use bytes::Bytes;
use std::cmp::Ordering as SeqOrdering;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use vppapi_protocol::{compare_seq_nums, Codec, Message, VppApiError};

/// Outbound request handed to a channel worker.
pub(crate) struct VppRequest {
    pub msg: Arc<dyn Message>,
    pub seq_num: u16,
    pub multipart: bool,
}

/// Inbound reply routed to a channel.
#[derive(Debug)]
pub(crate) struct VppReply {
    pub msg_id: u16,
    pub seq_num: u16,
    pub data: Bytes,
    /// Set on the control ping reply terminating a multi-part request.
    pub last_received: bool,
    pub err: Option<ClientError>,
}

enum ReplyOutcome {
    Ignore,
    Done { last: bool },
}

struct ReplySlot {
    queue: Option<ReplyQueue>,
    /// Reply that arrived ahead of the one being awaited.
    delayed: Option<VppReply>,
}

/// Channel state shared between the caller, its worker and the connection.
pub(crate) struct ChannelCore {
    id: u16,
    pub(crate) conn: Arc<ConnectionInner>,
    last_seq: AtomicU16,
    reply_tx: mpsc::Sender<VppReply>,
    slot: Mutex<ReplySlot>,
    reply_timeout: parking_lot::Mutex<Duration>,
}

impl ChannelCore {
    pub(crate) fn new(id: u16, conn: Arc<ConnectionInner>, queue: ReplyQueue) -> Self {
        let reply_timeout = conn.config.reply_timeout();
        Self {
            id,
            conn,
            last_seq: AtomicU16::new(0),
            reply_tx: queue.tx.clone(),
            slot: Mutex::new(ReplySlot {
                queue: Some(queue),
                delayed: None,
            }),
            reply_timeout: parking_lot::Mutex::new(reply_timeout),
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    /// Returns the next sequence number. The first one is 1; the counter
    /// wraps through the whole 16-bit space.
    pub(crate) fn next_seq(&self) -> u16 {
        self.last_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub(crate) fn last_seq(&self) -> u16 {
        self.last_seq.load(Ordering::Relaxed)
    }

    pub(crate) fn reply_timeout(&self) -> Duration {
        *self.reply_timeout.lock()
    }

    pub(crate) fn set_reply_timeout(&self, timeout: Duration) {
        *self.reply_timeout.lock() = timeout;
    }

    /// Pushes a failed request back to the caller as a reply carrying the
    /// error, so that the pending `receive_reply` for it completes.
    async fn deliver_error(&self, seq_num: u16, err: ClientError) {
        let reply = VppReply {
            msg_id: 0,
            seq_num,
            data: Bytes::new(),
            last_received: false,
            err: Some(err),
        };
        if self.reply_tx.send(reply).await.is_err() {
            tracing::debug!("channel {} reply queue closed, dropping error reply", self.id);
        }
    }

    /// Discards queued replies without waiting.
    pub(crate) fn drain_replies(&self) -> usize {
        match self.slot.try_lock() {
            Ok(mut slot) => slot.queue.as_mut().map(ReplyQueue::drain).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Waits for the reply matching `expected` and decodes it into `out`.
    /// Returns `true` if the reply was a multi-part terminator.
    pub(crate) async fn receive_reply(
        &self,
        out: &mut dyn Message,
        expected: u16,
    ) -> Result<bool, ClientError> {
        let timeout = self.reply_timeout();
        let mut shutdown = self.conn.shutdown.subscribe();
        let mut guard = self.slot.lock().await;
        let ReplySlot { queue, delayed } = &mut *guard;
        let queue = queue.as_mut().ok_or(ClientError::ChannelClosed)?;

        if let Some(reply) = delayed.take() {
            if let ReplyOutcome::Done { last } = self.process_reply(reply, expected, out, delayed)? {
                return Ok(last);
            }
        }

        if self.conn.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        let start = Instant::now();
        let deadline = start + timeout;
        let slow_at = start + self.conn.config.slow_reply_warning();
        let mut warned = slow_at >= deadline;

        loop {
            let reply = tokio::select! {
                reply = queue.rx.recv() => reply.ok_or(ClientError::ChannelClosed)?,
                _ = tokio::time::sleep_until(slow_at), if !warned => {
                    warned = true;
                    tracing::warn!(
                        "reply for seq_num={} on channel {} is slow (waiting {:?})",
                        expected,
                        self.id,
                        start.elapsed()
                    );
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ClientError::Timeout {
                        seq_num: expected,
                        timeout,
                    });
                }
                _ = shutdown.recv() => return Err(ClientError::ConnectionClosed),
            };

            match self.process_reply(reply, expected, out, delayed)? {
                ReplyOutcome::Ignore => continue,
                ReplyOutcome::Done { last } => return Ok(last),
            }
        }
    }

    fn process_reply(
        &self,
        reply: VppReply,
        expected: u16,
        out: &mut dyn Message,
        delayed: &mut Option<VppReply>,
    ) -> Result<ReplyOutcome, ClientError> {
        match compare_seq_nums(reply.seq_num, expected) {
            SeqOrdering::Less => {
                tracing::warn!(
                    "channel {}: ignoring stale reply seq_num={} (expected {})",
                    self.id,
                    reply.seq_num,
                    expected
                );
                return Ok(ReplyOutcome::Ignore);
            }
            SeqOrdering::Greater => {
                tracing::debug!(
                    "channel {}: reply seq_num={} arrived before {}, holding it back",
                    self.id,
                    reply.seq_num,
                    expected
                );
                *delayed = Some(reply);
                return Err(ClientError::MissingReply { seq_num: expected });
            }
            SeqOrdering::Equal => {}
        }

        if let Some(err) = reply.err {
            return Err(err);
        }
        if reply.last_received {
            return Ok(ReplyOutcome::Done { last: true });
        }

        let expected_id = self.conn.get_message_id(&*out)?;
        if reply.msg_id != expected_id {
            let received = self
                .conn
                .registry
                .lookup(Some(out.package()), reply.msg_id)
                .map(|msg| msg.key())
                .unwrap_or_else(|| "unknown message".to_string());
            return Err(ClientError::UnexpectedReply {
                seq_num: expected,
                expected: out.key(),
                expected_id,
                received,
                received_id: reply.msg_id,
            });
        }

        Codec::decode_msg(&reply.data, out)?;

        if let Some(retval) = out.as_retval() {
            if let Some(err) = VppApiError::from_retval(retval.retval()) {
                return Err(ClientError::VppApi(err));
            }
        }

        Ok(ReplyOutcome::Done { last: false })
    }

    /// Awaits the next reply without any sequence checks.
    pub(crate) async fn recv_raw(
        &self,
        timeout: Duration,
        cancel: Option<&mut CancelSignal>,
    ) -> Result<VppReply, ClientError> {
        let mut shutdown = self.conn.shutdown.subscribe();
        if self.conn.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        let mut guard = self.slot.lock().await;
        let queue = guard.queue.as_mut().ok_or(ClientError::ChannelClosed)?;
        let cancelled = async move {
            match cancel {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            reply = queue.rx.recv() => reply.ok_or(ClientError::ChannelClosed),
            _ = tokio::time::sleep(timeout) => Err(ClientError::Timeout {
                seq_num: self.last_seq(),
                timeout,
            }),
            _ = cancelled => Err(ClientError::Cancelled),
            _ = shutdown.recv() => Err(ClientError::ConnectionClosed),
        }
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        self.conn.channels.write().remove(&self.id);
        if let Some(queue) = self.slot.get_mut().queue.take() {
            if !self.conn.is_closed() {
                self.conn.channel_pool.release(self.id, queue);
            }
        }
        self.conn.id_pool.release(self.id);
        tracing::debug!("channel {} released", self.id);
    }
}

/// A logical channel to the engine.
///
/// Requests are queued to a per-channel worker that encodes and transmits
/// them. Replies are collected through the returned request contexts, which
/// should be consumed in the order the requests were sent.
pub struct Channel {
    core: Arc<ChannelCore>,
    requests: mpsc::Sender<VppRequest>,
    worker: JoinHandle<()>,
}

impl Channel {
    pub(crate) fn spawn(core: Arc<ChannelCore>, request_queue_size: usize) -> Self {
        let (requests, rx) = mpsc::channel(request_queue_size.max(1));
        let shutdown = core.conn.shutdown.subscribe();
        let worker = tokio::spawn(run_worker(core.clone(), rx, shutdown));
        Self {
            core,
            requests,
            worker,
        }
    }

    pub fn id(&self) -> u16 {
        self.core.id
    }

    /// Queues a request expecting exactly one reply.
    ///
    /// Waits only if the request queue is full.
    pub async fn send_request<M: Message>(&self, msg: M) -> Result<RequestCtx<'_>, ClientError> {
        let seq_num = self.enqueue(Arc::new(msg), false).await?;
        Ok(RequestCtx {
            channel: &self.core,
            seq_num,
        })
    }

    /// Queues a request answered by a stream of replies. The stream is
    /// terminated by a control ping sent right after the request.
    pub async fn send_multi_request<M: Message>(
        &self,
        msg: M,
    ) -> Result<MultiRequestCtx<'_>, ClientError> {
        let seq_num = self.enqueue(Arc::new(msg), true).await?;
        Ok(MultiRequestCtx {
            channel: &self.core,
            seq_num,
        })
    }

    async fn enqueue(&self, msg: Arc<dyn Message>, multipart: bool) -> Result<u16, ClientError> {
        let seq_num = self.core.next_seq();
        tracing::debug!(
            "channel {}: queueing {} seq_num={} multipart={}",
            self.core.id,
            msg.name(),
            seq_num,
            multipart
        );
        self.requests
            .send(VppRequest {
                msg,
                seq_num,
                multipart,
            })
            .await
            .map_err(|_| ClientError::ChannelClosed)?;
        Ok(seq_num)
    }

    pub fn set_reply_timeout(&self, timeout: Duration) {
        self.core.set_reply_timeout(timeout);
    }

    pub fn reply_timeout(&self) -> Duration {
        self.core.reply_timeout()
    }

    /// Subscribes `tx` to notifications of type `E`.
    pub fn subscribe_notification<E: Message + Default>(
        &self,
        tx: mpsc::Sender<E>,
    ) -> Result<SubscriptionHandle, ClientError> {
        self.core.conn.subscribe_notification(tx)
    }

    /// Checks that the engine knows every message. All incompatible
    /// messages are reported together.
    pub fn check_compatibility(&self, msgs: &[&dyn Message]) -> Result<(), ClientError> {
        self.core.conn.check_compatibility(msgs)
    }

    /// Closes the channel and returns its ID to the pool.
    pub fn close(self) {}
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    core: Arc<ChannelCore>,
    mut requests: mpsc::Receiver<VppRequest>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let req = tokio::select! {
            req = requests.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = shutdown.recv() => break,
        };

        if let Err(err) = core.conn.process_request(core.id, &req) {
            tracing::debug!(
                "channel {}: sending {} seq_num={} failed: {}",
                core.id,
                req.msg.name(),
                req.seq_num,
                err
            );
            core.deliver_error(req.seq_num, err).await;
        }
    }
    tracing::debug!("channel {} worker stopped", core.id);
}

/// Pending single-reply request.
pub struct RequestCtx<'a> {
    channel: &'a ChannelCore,
    seq_num: u16,
}

impl RequestCtx<'_> {
    pub fn seq_num(&self) -> u16 {
        self.seq_num
    }

    /// Waits for the reply and decodes it into `reply`.
    pub async fn receive_reply(&self, reply: &mut dyn Message) -> Result<(), ClientError> {
        let last = self.channel.receive_reply(reply, self.seq_num).await?;
        if last {
            return Err(ClientError::UnexpectedMultipart);
        }
        Ok(())
    }
}

/// Pending multi-part request.
pub struct MultiRequestCtx<'a> {
    channel: &'a ChannelCore,
    seq_num: u16,
}

impl MultiRequestCtx<'_> {
    pub fn seq_num(&self) -> u16 {
        self.seq_num
    }

    /// Waits for the next part and decodes it into `reply`. Returns `true`
    /// once the terminator arrived, in which case `reply` is untouched.
    pub async fn receive_reply(&self, reply: &mut dyn Message) -> Result<bool, ClientError> {
        self.channel.receive_reply(reply, self.seq_num).await
    }
}
