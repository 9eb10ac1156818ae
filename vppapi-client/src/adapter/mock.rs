//! Scriptable in-process adapter for tests.
//!
//! Replies are scripted in batches. Every message sent through the adapter
//! pops one batch and delivers its replies synchronously, stamped with the
//! request's context. Once the batches run out, registered reply handlers are
//! consulted, and as a last resort a `control_ping` is answered with a
//! `control_ping_reply`.

use super::{AdapterError, MsgCallback, VppApi};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use vppapi_protocol::{message_key, Codec, ControlPing, ControlPingReply, Message, RequestContext};

/// Reply with an explicit sequence number and multi-part flag. The channel
/// ID is taken from the request that triggers the batch.
#[derive(Debug)]
pub struct MsgWithContext {
    pub msg: Box<dyn Message>,
    pub seq_num: u16,
    pub multipart: bool,
}

/// A message observed by the adapter.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub msg_id: u16,
    /// `name_crc` key, if the ID was handed out by this adapter.
    pub key: Option<String>,
    pub context: u32,
    pub data: Bytes,
}

impl SentMessage {
    pub fn context(&self) -> RequestContext {
        RequestContext::unpack(self.context)
    }
}

/// Produces replies for a sent message, or `None` to pass.
pub type ReplyHandler = Arc<dyn Fn(&SentMessage) -> Option<Vec<Box<dyn Message>>> + Send + Sync>;

enum ScriptedReply {
    /// Uses the request's context unchanged.
    Inherit(Box<dyn Message>),
    Explicit(MsgWithContext),
}

struct MockState {
    connected: bool,
    ids: HashMap<String, u16>,
    keys: HashMap<u16, String>,
    next_id: u16,
    batches: VecDeque<Vec<ScriptedReply>>,
    handlers: Vec<ReplyHandler>,
    auto_ping_reply: bool,
    connect_error: Option<String>,
    send_error: Option<String>,
    unresponsive: bool,
    incompatible: HashSet<String>,
    connect_count: usize,
    sent: Vec<SentMessage>,
}

/// In-process [`VppApi`] implementation with scripted replies.
pub struct MockAdapter {
    state: Mutex<MockState>,
    callback: RwLock<Option<MsgCallback>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                connected: false,
                ids: HashMap::new(),
                keys: HashMap::new(),
                next_id: 1,
                batches: VecDeque::new(),
                handlers: Vec::new(),
                auto_ping_reply: true,
                connect_error: None,
                send_error: None,
                unresponsive: false,
                incompatible: HashSet::new(),
                connect_count: 0,
                sent: Vec::new(),
            }),
            callback: RwLock::new(None),
        }
    }

    /// Queues a batch of replies for the next sent message.
    pub fn mock_reply(&self, msgs: Vec<Box<dyn Message>>) {
        let batch = msgs.into_iter().map(ScriptedReply::Inherit).collect();
        self.state.lock().batches.push_back(batch);
    }

    /// Queues a batch of replies with explicit sequence numbers.
    pub fn mock_reply_with_context(&self, msgs: Vec<MsgWithContext>) {
        let batch = msgs.into_iter().map(ScriptedReply::Explicit).collect();
        self.state.lock().batches.push_back(batch);
    }

    /// Registers a handler consulted once all batches are consumed.
    pub fn mock_reply_handler<F>(&self, handler: F)
    where
        F: Fn(&SentMessage) -> Option<Vec<Box<dyn Message>>> + Send + Sync + 'static,
    {
        self.state.lock().handlers.push(Arc::new(handler));
    }

    /// Drops all scripted batches and handlers.
    pub fn clear_replies(&self) {
        let mut state = self.state.lock();
        state.batches.clear();
        state.handlers.clear();
    }

    /// Toggles the automatic `control_ping_reply` fallback.
    pub fn set_auto_ping_reply(&self, enabled: bool) {
        self.state.lock().auto_ping_reply = enabled;
    }

    /// Makes every connect attempt fail while set.
    pub fn set_connect_error(&self, err: Option<&str>) {
        self.state.lock().connect_error = err.map(str::to_string);
    }

    /// Makes every send fail while set.
    pub fn set_send_error(&self, err: Option<&str>) {
        self.state.lock().send_error = err.map(str::to_string);
    }

    /// Accepts sends but never replies while set.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().unresponsive = unresponsive;
    }

    /// Makes ID resolution fail for the given `name_crc` keys.
    pub fn set_incompatible(&self, keys: &[&str]) {
        let mut state = self.state.lock();
        state.incompatible = keys.iter().map(|k| k.to_string()).collect();
    }

    /// Pushes an unsolicited message (context 0) to the runtime.
    pub fn send_notification(&self, msg: &dyn Message) -> Result<(), AdapterError> {
        self.inject(msg, 0)
    }

    /// Pushes a message with an arbitrary context to the runtime, as if the
    /// engine had sent it on its own.
    pub fn inject(&self, msg: &dyn Message, context: u32) -> Result<(), AdapterError> {
        let frame = self.state.lock().encode(msg, context)?;
        self.deliver(vec![frame]);
        Ok(())
    }

    /// Returns the ID assigned to a message, assigning one if needed.
    pub fn msg_id(&self, msg: &dyn Message) -> u16 {
        self.state.lock().assign_id(&msg.key())
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    fn deliver(&self, frames: Vec<(u16, Bytes)>) {
        let callback = self.callback.read().clone();
        let Some(callback) = callback else {
            tracing::warn!("mock adapter: no callback installed, dropping {} frames", frames.len());
            return;
        };
        for (msg_id, data) in frames {
            callback(msg_id, data);
        }
    }
}

impl MockState {
    fn assign_id(&mut self, key: &str) -> u16 {
        if let Some(id) = self.ids.get(key) {
            return *id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.ids.insert(key.to_string(), id);
        self.keys.insert(id, key.to_string());
        id
    }

    fn encode(&mut self, msg: &dyn Message, context: u32) -> Result<(u16, Bytes), AdapterError> {
        let msg_id = self.assign_id(&msg.key());
        let data =
            Codec::encode_msg(msg, msg_id, context).map_err(|e| AdapterError::Send(e.to_string()))?;
        Ok((msg_id, data))
    }

    fn replies_for(&mut self, sent: &SentMessage) -> Result<Vec<(u16, Bytes)>, AdapterError> {
        if let Some(batch) = self.batches.pop_front() {
            let request = sent.context();
            let mut frames = Vec::with_capacity(batch.len());
            for reply in batch {
                let frame = match reply {
                    ScriptedReply::Inherit(msg) => self.encode(msg.as_ref(), sent.context)?,
                    ScriptedReply::Explicit(with_ctx) => {
                        let context =
                            RequestContext::new(request.channel_id, with_ctx.multipart, with_ctx.seq_num);
                        self.encode(with_ctx.msg.as_ref(), context.pack())?
                    }
                };
                frames.push(frame);
            }
            return Ok(frames);
        }

        for handler in self.handlers.clone() {
            if let Some(msgs) = handler(sent) {
                let mut frames = Vec::with_capacity(msgs.len());
                for msg in msgs {
                    frames.push(self.encode(msg.as_ref(), sent.context)?);
                }
                return Ok(frames);
            }
        }

        let ping_key = message_key(ControlPing::NAME, ControlPing::CRC);
        if self.auto_ping_reply && sent.key.as_deref() == Some(ping_key.as_str()) {
            let reply = ControlPingReply {
                vpe_pid: std::process::id(),
                ..Default::default()
            };
            return Ok(vec![self.encode(&reply, sent.context)?]);
        }

        Ok(Vec::new())
    }
}

impl VppApi for MockAdapter {
    fn connect(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.connect_count += 1;
        if let Some(err) = &state.connect_error {
            return Err(AdapterError::Connect(err.clone()));
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), AdapterError> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn set_msg_callback(&self, callback: MsgCallback) {
        *self.callback.write() = Some(callback);
    }

    fn send_msg(&self, context: u32, data: Bytes) -> Result<(), AdapterError> {
        let frames = {
            let mut state = self.state.lock();
            if let Some(err) = &state.send_error {
                return Err(AdapterError::Send(err.clone()));
            }
            if !state.connected {
                return Err(AdapterError::NotConnected);
            }

            let msg_id = Codec::decode_msg_id(&data).map_err(|e| AdapterError::Send(e.to_string()))?;
            let sent = SentMessage {
                msg_id,
                key: state.keys.get(&msg_id).cloned(),
                context,
                data,
            };
            state.sent.push(sent.clone());

            if state.unresponsive {
                return Ok(());
            }
            state.replies_for(&sent)?
        };

        self.deliver(frames);
        Ok(())
    }

    fn get_msg_id(&self, name: &str, crc: &str) -> Result<u16, AdapterError> {
        let key = message_key(name, crc);
        let mut state = self.state.lock();
        if state.incompatible.contains(&key) {
            return Err(AdapterError::UnknownMessage {
                name: name.to_string(),
                crc: crc.to_string(),
            });
        }
        Ok(state.assign_id(&key))
    }
}
