//! Connection management.
//!
//! A [`Connection`] owns the transport adapter and multiplexes any number of
//! [`Channel`]s and [`Stream`]s over it. Inbound frames are pushed by the
//! adapter callback into a bounded queue and routed by a single dispatcher
//! task; see [`crate::dispatch`].

use crate::adapter::{AdapterError, VppApi};
use crate::channel::{Channel, ChannelCore, VppReply, VppRequest};
use crate::config::ConnectionConfig;
use crate::dispatch;
use crate::error::ClientError;
use crate::events::ConnectionEvent;
use crate::health;
use crate::pool::{ChannelPool, IdPool};
use crate::registry::MessageRegistry;
use crate::stream::{Stream, StreamOptions};
use crate::subscription::{SubscriptionHandle, SubscriptionTable};
use crate::trace::Trace;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use vppapi_protocol::{
    Codec, ControlPing, ControlPingReply, Message, RequestContext, MAX_CHANNEL_ID,
};

/// Reply queue capacity of the private health check channel.
const PROBE_QUEUE_SIZE: usize = 2;

/// Routing entry of a live channel.
pub(crate) struct ChannelEntry {
    pub reply_tx: mpsc::Sender<VppReply>,
}

/// Resolved IDs of the control ping pair.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PingIds {
    pub request: u16,
    pub reply: u16,
}

/// State shared by a connection, its channels and its background tasks.
pub(crate) struct ConnectionInner {
    pub(crate) adapter: Arc<dyn VppApi>,
    pub(crate) config: ConnectionConfig,
    pub(crate) registry: MessageRegistry,
    pub(crate) channels: RwLock<HashMap<u16, ChannelEntry>>,
    pub(crate) subscriptions: Arc<SubscriptionTable>,
    pub(crate) id_pool: IdPool,
    pub(crate) channel_pool: ChannelPool,
    pub(crate) trace: Trace,
    pub(crate) shutdown: broadcast::Sender<()>,
    connected: AtomicBool,
    closed: AtomicBool,
    ping_ids: RwLock<Option<PingIds>>,
    last_reply: Mutex<Instant>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ping_ids(&self) -> Option<PingIds> {
        *self.ping_ids.read()
    }

    pub(crate) fn touch_last_reply(&self) {
        *self.last_reply.lock() = Instant::now();
    }

    pub(crate) fn since_last_reply(&self) -> Duration {
        self.last_reply.lock().elapsed()
    }

    pub(crate) fn get_message_id(&self, msg: &dyn Message) -> Result<u16, ClientError> {
        self.registry.get_message_id(self.adapter.as_ref(), msg)
    }

    /// Opens the adapter session and resolves every known message.
    /// Blocking; run it off the async workers.
    pub(crate) fn connect_vpp(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        self.adapter.connect()?;

        if let Err(err) = self.resolve_messages() {
            if let Err(e) = self.adapter.disconnect() {
                tracing::debug!("adapter disconnect after failed setup: {}", e);
            }
            return Err(err);
        }

        if self.is_closed() {
            // disconnect() ran while the session was being opened
            let _ = self.adapter.disconnect();
            return Err(ClientError::ConnectionClosed);
        }

        self.touch_last_reply();
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("connected to VPP");
        Ok(())
    }

    fn resolve_messages(&self) -> Result<(), ClientError> {
        let incompatible = self.registry.resolve_all(self.adapter.as_ref())?;
        if !incompatible.is_empty() {
            tracing::warn!(
                "{} registered message(s) not known by VPP: {}",
                incompatible.len(),
                incompatible.join(", ")
            );
        }

        let ping_ids = PingIds {
            request: self.get_message_id(&ControlPing)?,
            reply: self.get_message_id(&ControlPingReply::default())?,
        };
        *self.ping_ids.write() = Some(ping_ids);
        Ok(())
    }

    /// Closes the adapter session if one is open.
    pub(crate) fn disconnect_vpp(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.adapter.disconnect() {
                tracing::warn!("adapter disconnect failed: {}", e);
            }
            tracing::debug!("disconnected from VPP");
        }
    }

    /// Encodes and transmits a request. Multi-part requests are followed by
    /// a control ping carrying the same context.
    pub(crate) fn process_request(&self, channel_id: u16, req: &VppRequest) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let msg_id = self.get_message_id(req.msg.as_ref())?;
        let context = RequestContext::new(channel_id, req.multipart, req.seq_num).pack();
        let data = Codec::encode_msg(req.msg.as_ref(), msg_id, context)?;

        tracing::debug!(
            "sending {} (ID {}) channel={} seq_num={} multipart={} ({} bytes)",
            req.msg.name(),
            msg_id,
            channel_id,
            req.seq_num,
            req.multipart,
            data.len()
        );
        self.trace.record(req.msg.clone(), channel_id, false);
        self.adapter.send_msg(context, data)?;

        if req.multipart {
            let ping_id = self
                .ping_ids()
                .map(|ids| ids.request)
                .ok_or(ClientError::NotConnected)?;
            let data = Codec::encode_msg(&ControlPing, ping_id, context)?;
            self.trace.record(Arc::new(ControlPing), channel_id, false);
            self.adapter.send_msg(context, data)?;
        }

        Ok(())
    }

    pub(crate) fn check_compatibility(&self, msgs: &[&dyn Message]) -> Result<(), ClientError> {
        let mut incompatible = Vec::new();
        for msg in msgs {
            match self.get_message_id(*msg) {
                Ok(_) => {}
                Err(ClientError::MessageIncompatible { name, crc }) => {
                    incompatible.push(format!("{}_{}", name, crc));
                }
                Err(e) => return Err(e),
            }
        }
        if incompatible.is_empty() {
            Ok(())
        } else {
            Err(ClientError::IncompatibleMessages {
                messages: incompatible,
            })
        }
    }

    pub(crate) fn subscribe_notification<E: Message + Default>(
        &self,
        tx: mpsc::Sender<E>,
    ) -> Result<SubscriptionHandle, ClientError> {
        let msg_id = self.get_message_id(&E::default())?;
        Ok(self.subscriptions.subscribe(msg_id, tx))
    }

    /// Allocates a channel ID and registers a reply queue for it.
    pub(crate) fn new_channel_core(
        self: &Arc<Self>,
        reply_queue_size: usize,
    ) -> Result<Arc<ChannelCore>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let id = self
            .id_pool
            .allocate()
            .ok_or(ClientError::ChannelIdsExhausted)?;
        let queue = self.channel_pool.acquire(id, reply_queue_size);
        self.channels.write().insert(
            id,
            ChannelEntry {
                reply_tx: queue.tx.clone(),
            },
        );
        tracing::debug!("channel {} created", id);
        Ok(Arc::new(ChannelCore::new(id, self.clone(), queue)))
    }

    pub(crate) fn new_probe_channel(self: &Arc<Self>) -> Result<Arc<ChannelCore>, ClientError> {
        let core = self.new_channel_core(PROBE_QUEUE_SIZE)?;
        core.set_reply_timeout(self.config.health_check_reply_timeout());
        Ok(core)
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if self.connected.load(Ordering::SeqCst) {
            let _ = self.adapter.disconnect();
        }
    }
}

/// A connection to VPP through a [`VppApi`] adapter.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    ///
    /// Must be called within a Tokio runtime: the inbound dispatcher and the
    /// trace persister are spawned here.
    pub fn new(adapter: Arc<dyn VppApi>, config: ConnectionConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let (shutdown, _) = broadcast::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel::<(u16, Bytes)>(config.inbound_queue_size);
        let trace = Trace::new(config.trace_capacity, config.trace_enabled);

        let inner = Arc::new(ConnectionInner {
            adapter,
            registry: MessageRegistry::new(),
            channels: RwLock::new(HashMap::new()),
            subscriptions: Arc::new(SubscriptionTable::new()),
            id_pool: IdPool::new(MAX_CHANNEL_ID),
            channel_pool: ChannelPool::new(),
            trace,
            shutdown,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ping_ids: RwLock::new(None),
            last_reply: Mutex::new(Instant::now()),
            supervisor: Mutex::new(None),
            config,
        });

        inner.registry.register(Arc::new(ControlPing));
        inner.registry.register(Arc::new(ControlPingReply::default()));

        inner
            .adapter
            .set_msg_callback(Arc::new(move |msg_id: u16, data: Bytes| {
                match inbound_tx.try_send((msg_id, data)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("inbound queue full, dropping message ID {}", msg_id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!("dispatcher stopped, dropping message ID {}", msg_id);
                    }
                }
            }));

        tokio::spawn(dispatch::run(
            Arc::downgrade(&inner),
            inbound_rx,
            inner.shutdown.subscribe(),
        ));

        Ok(Self { inner })
    }

    /// Connects to VPP with a single attempt. No health checking is done.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.inner.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        if self.inner.is_connected() {
            return Ok(());
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.connect_vpp())
            .await
            .map_err(|e| ClientError::Adapter(AdapterError::Connect(e.to_string())))?
    }

    /// Connects in the background with retries, then keeps the session
    /// alive with periodic health checks, reconnecting when they fail.
    ///
    /// State changes are reported on the returned queue. The background
    /// task runs until [`disconnect`](Self::disconnect) or until reconnecting
    /// gives up.
    pub fn async_connect(&self) -> Result<mpsc::Receiver<ConnectionEvent>, ClientError> {
        if self.inner.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        let (events_tx, events_rx) = mpsc::channel(self.inner.config.event_queue_size);
        let handle = tokio::spawn(health::supervise(
            self.inner.clone(),
            events_tx,
            self.inner.shutdown.subscribe(),
        ));

        if let Some(previous) = self.inner.supervisor.lock().replace(handle) {
            previous.abort();
        }
        Ok(events_rx)
    }

    /// Disconnects from VPP, releases every channel and subscription and
    /// stops all background tasks. The connection cannot be reused.
    pub async fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("disconnecting...");

        let _ = self.inner.shutdown.send(());

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        self.inner.disconnect_vpp();

        let released = {
            let mut channels = self.inner.channels.write();
            let released = channels.len();
            channels.clear();
            released
        };
        self.inner.subscriptions.clear();
        self.inner.channel_pool.clear();

        tracing::info!("disconnected, released {} channel(s)", released);
    }

    /// Creates a channel with the configured queue sizes.
    pub fn new_channel(&self) -> Result<Channel, ClientError> {
        self.new_channel_buffered(
            self.inner.config.request_queue_size,
            self.inner.config.reply_queue_size,
        )
    }

    /// Creates a channel with explicit request and reply queue sizes.
    pub fn new_channel_buffered(
        &self,
        request_queue_size: usize,
        reply_queue_size: usize,
    ) -> Result<Channel, ClientError> {
        let core = self.inner.new_channel_core(reply_queue_size)?;
        Ok(Channel::spawn(core, request_queue_size))
    }

    /// Creates a stream on a private channel.
    pub fn new_stream(&self, options: StreamOptions) -> Result<Stream, ClientError> {
        let reply_queue_size = options
            .reply_queue_size
            .unwrap_or(self.inner.config.reply_queue_size);
        let core = self.inner.new_channel_core(reply_queue_size)?;
        Ok(Stream::new(core, options))
    }

    /// Resolves the wire ID of a message.
    pub fn get_message_id(&self, msg: &dyn Message) -> Result<u16, ClientError> {
        self.inner.get_message_id(msg)
    }

    /// Registers message prototypes so inbound messages of these types can
    /// be routed. Registered messages are resolved again on every connect.
    ///
    /// When already connected they are resolved right away and any the
    /// engine does not know are reported.
    pub fn register_messages<I>(&self, prototypes: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = Arc<dyn Message>>,
    {
        let mut added = Vec::new();
        for prototype in prototypes {
            if self.inner.registry.register(prototype.clone()) {
                added.push(prototype);
            }
        }
        if !self.inner.is_connected() {
            return Ok(());
        }

        let msgs: Vec<&dyn Message> = added.iter().map(|m| m.as_ref()).collect();
        self.inner.check_compatibility(&msgs)
    }

    /// Finds the registered message type with the given wire ID.
    pub fn lookup_message(&self, msg_id: u16) -> Option<Arc<dyn Message>> {
        self.inner.registry.lookup(None, msg_id)
    }

    /// Subscribes `tx` to notifications of type `E`.
    ///
    /// Each notification is decoded into a fresh `E` for every subscriber.
    /// If `tx` is full the notification is dropped for that subscriber.
    pub fn subscribe_notification<E: Message + Default>(
        &self,
        tx: mpsc::Sender<E>,
    ) -> Result<SubscriptionHandle, ClientError> {
        self.inner.subscribe_notification(tx)
    }

    /// Returns whether messages with this wire ID go to subscribers.
    pub fn is_notification(&self, msg_id: u16) -> bool {
        self.inner.subscriptions.contains(msg_id)
    }

    /// Checks that the engine knows every message.
    pub fn check_compatibility(&self, msgs: &[&dyn Message]) -> Result<(), ClientError> {
        self.inner.check_compatibility(msgs)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Number of open channels and streams (including the health check
    /// channel while it runs).
    pub fn channel_count(&self) -> usize {
        self.inner.channels.read().len()
    }

    pub fn trace(&self) -> &Trace {
        &self.inner.trace
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }
}
