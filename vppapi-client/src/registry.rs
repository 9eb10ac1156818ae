//! Message ID resolution and reverse lookup.
//!
//! Wire IDs are assigned by the engine and may change across restarts, so
//! the cache is rebuilt on every connect from the registered prototypes.

use crate::adapter::{AdapterError, VppApi};
use crate::error::ClientError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use vppapi_protocol::Message;

#[derive(Default)]
struct RegistryState {
    /// `name_crc` -> wire ID.
    ids: HashMap<String, u16>,
    /// package -> wire ID -> prototype.
    by_path: HashMap<&'static str, HashMap<u16, Arc<dyn Message>>>,
    /// Every message the connection has been asked about, keyed by `name_crc`.
    prototypes: HashMap<String, Arc<dyn Message>>,
}

/// Connection-owned message registry.
#[derive(Default)]
pub(crate) struct MessageRegistry {
    state: RwLock<RegistryState>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a prototype. Returns `false` if it was already known.
    pub fn register(&self, prototype: Arc<dyn Message>) -> bool {
        let key = prototype.key();
        let mut state = self.state.write();
        if state.prototypes.contains_key(&key) {
            return false;
        }
        if let Some(id) = state.ids.get(&key).copied() {
            state
                .by_path
                .entry(prototype.package())
                .or_default()
                .insert(id, prototype.clone());
        }
        state.prototypes.insert(key, prototype);
        true
    }

    /// Returns the cached wire ID of `msg`, resolving it through the adapter
    /// on a miss.
    pub fn get_message_id(&self, adapter: &dyn VppApi, msg: &dyn Message) -> Result<u16, ClientError> {
        let key = msg.key();
        if let Some(id) = self.state.read().ids.get(&key) {
            return Ok(*id);
        }

        // resolved without holding the lock
        let id = resolve(adapter, msg)?;

        let mut state = self.state.write();
        let prototype = state
            .prototypes
            .entry(key.clone())
            .or_insert_with(|| Arc::from(msg.new_instance()))
            .clone();
        state
            .by_path
            .entry(prototype.package())
            .or_default()
            .insert(id, prototype);
        state.ids.insert(key, id);
        Ok(id)
    }

    /// Drops every cached ID and resolves all registered prototypes again.
    /// Returns the keys of messages the engine does not know.
    pub fn resolve_all(&self, adapter: &dyn VppApi) -> Result<Vec<String>, ClientError> {
        let prototypes: Vec<Arc<dyn Message>> = {
            let mut state = self.state.write();
            state.ids.clear();
            state.by_path.clear();
            state.prototypes.values().cloned().collect()
        };

        let mut incompatible = Vec::new();
        let mut resolved = Vec::with_capacity(prototypes.len());
        for prototype in prototypes {
            match resolve(adapter, prototype.as_ref()) {
                Ok(id) => resolved.push((id, prototype)),
                Err(ClientError::MessageIncompatible { .. }) => {
                    tracing::warn!("message {} is not compatible with the engine", prototype.key());
                    incompatible.push(prototype.key());
                }
                Err(e) => return Err(e),
            }
        }

        let mut state = self.state.write();
        for (id, prototype) in resolved {
            state.ids.insert(prototype.key(), id);
            state
                .by_path
                .entry(prototype.package())
                .or_default()
                .insert(id, prototype);
        }
        incompatible.sort();
        Ok(incompatible)
    }

    /// Finds the prototype for a wire ID, preferring the given package.
    pub fn lookup(&self, package: Option<&str>, id: u16) -> Option<Arc<dyn Message>> {
        let state = self.state.read();
        if let Some(msg) = package
            .and_then(|p| state.by_path.get(p))
            .and_then(|msgs| msgs.get(&id))
        {
            return Some(msg.clone());
        }
        state.by_path.values().find_map(|msgs| msgs.get(&id).cloned())
    }

    /// Returns the cached wire ID for a `name_crc` key without resolving.
    #[cfg(test)]
    pub fn cached_id(&self, key: &str) -> Option<u16> {
        self.state.read().ids.get(key).copied()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.read().prototypes.len()
    }
}

fn resolve(adapter: &dyn VppApi, msg: &dyn Message) -> Result<u16, ClientError> {
    adapter.get_msg_id(msg.name(), msg.crc()).map_err(|e| match e {
        AdapterError::UnknownMessage { name, crc } => ClientError::MessageIncompatible { name, crc },
        other => ClientError::Adapter(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use vppapi_protocol::{ControlPing, ControlPingReply};

    #[test]
    fn test_get_message_id_caches() {
        let adapter = MockAdapter::new();
        let registry = MessageRegistry::new();

        let id = registry.get_message_id(&adapter, &ControlPing).unwrap();
        assert_eq!(registry.cached_id("control_ping_51077d14"), Some(id));
        assert_eq!(registry.get_message_id(&adapter, &ControlPing).unwrap(), id);

        let found = registry.lookup(Some("memclnt"), id).unwrap();
        assert_eq!(found.name(), "control_ping");
        // falls back to any package
        assert!(registry.lookup(Some("interface"), id).is_some());
        assert!(registry.lookup(None, id + 100).is_none());
    }

    #[test]
    fn test_incompatible_message() {
        let adapter = MockAdapter::new();
        adapter.set_incompatible(&["control_ping_reply_f6b0b8ca"]);
        let registry = MessageRegistry::new();

        let err = registry
            .get_message_id(&adapter, &ControlPingReply::default())
            .unwrap_err();
        match err {
            ClientError::MessageIncompatible { name, crc } => {
                assert_eq!(name, "control_ping_reply");
                assert_eq!(crc, "f6b0b8ca");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_resolve_all_reports_incompatible() {
        let adapter = MockAdapter::new();
        let registry = MessageRegistry::new();
        assert!(registry.register(Arc::new(ControlPing)));
        assert!(registry.register(Arc::new(ControlPingReply::default())));
        assert!(!registry.register(Arc::new(ControlPing)));
        assert_eq!(registry.len(), 2);

        adapter.set_incompatible(&["control_ping_51077d14"]);
        let incompatible = registry.resolve_all(&adapter).unwrap();
        assert_eq!(incompatible, vec!["control_ping_51077d14".to_string()]);
        assert!(registry.cached_id("control_ping_51077d14").is_none());
        assert!(registry.cached_id("control_ping_reply_f6b0b8ca").is_some());
    }

    #[test]
    fn test_register_after_resolution_indexes_prototype() {
        let adapter = MockAdapter::new();
        let registry = MessageRegistry::new();
        let id = registry.get_message_id(&adapter, &ControlPing).unwrap();

        // already known through resolution
        assert!(!registry.register(Arc::new(ControlPing)));
        assert!(registry.lookup(None, id).is_some());
    }
}
