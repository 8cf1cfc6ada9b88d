//! Registry of ongoing swaps. Holds weak handles only (identity plus input
//! queue); drivers own their state and the backend. The guard protects short
//! map operations and is never held across I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::driver::SwapEvent;
use crate::error::{Result, SwapError};
use crate::net::PeerId;

/// Identity and input channel of a running driver.
#[derive(Clone, Debug)]
pub struct SwapHandle {
    pub offer_id: String,
    pub peer: PeerId,
    pub input: mpsc::Sender<SwapEvent>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, SwapHandle>,
    by_peer: HashMap<PeerId, String>,
    by_contract: HashMap<String, String>,
}

pub struct SwapManager {
    registry: Mutex<Registry>,
    single_swap: bool,
}

impl SwapManager {
    pub fn new(single_swap: bool) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            single_swap,
        }
    }

    /// Registers a new swap. At most one non-terminal swap per peer; in
    /// single-swap mode at most one in the whole process.
    pub fn new_swap(
        &self,
        offer_id: &str,
        peer: &PeerId,
        input: mpsc::Sender<SwapEvent>,
    ) -> Result<SwapHandle> {
        let mut registry = self.registry.lock().unwrap();
        if registry.by_peer.contains_key(peer) {
            return Err(SwapError::AlreadyActive);
        }
        if self.single_swap && !registry.active.is_empty() {
            return Err(SwapError::AlreadyActive);
        }
        if registry.active.contains_key(offer_id) {
            return Err(SwapError::AlreadyActive);
        }
        let handle = SwapHandle {
            offer_id: offer_id.to_string(),
            peer: peer.clone(),
            input,
        };
        registry.active.insert(offer_id.to_string(), handle.clone());
        registry.by_peer.insert(peer.clone(), offer_id.to_string());
        Ok(handle)
    }

    /// Indexes the contract-assigned id once the ETH lock exists.
    pub fn bind_contract_id(&self, offer_id: &str, contract_id: &str) {
        let mut registry = self.registry.lock().unwrap();
        registry
            .by_contract
            .insert(contract_id.to_string(), offer_id.to_string());
    }

    /// Looks up a handle by offer id or contract swap id.
    pub fn get(&self, id: &str) -> Option<SwapHandle> {
        let registry = self.registry.lock().unwrap();
        if let Some(handle) = registry.active.get(id) {
            return Some(handle.clone());
        }
        registry
            .by_contract
            .get(id)
            .and_then(|offer_id| registry.active.get(offer_id))
            .cloned()
    }

    /// Frees the slot once the driver has persisted a terminal state.
    pub fn complete(&self, offer_id: &str) -> Option<SwapHandle> {
        let mut registry = self.registry.lock().unwrap();
        let handle = registry.active.remove(offer_id)?;
        registry.by_peer.remove(&handle.peer);
        registry
            .by_contract
            .retain(|_, mapped| mapped.as_str() != offer_id);
        Some(handle)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let registry = self.registry.lock().unwrap();
        let mut ids: Vec<String> = registry.active.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> mpsc::Sender<SwapEvent> {
        mpsc::channel(8).0
    }

    #[test]
    fn one_swap_per_peer() {
        let manager = SwapManager::new(false);
        manager.new_swap("aa", &"peer1".to_string(), channel()).unwrap();
        let err = manager
            .new_swap("bb", &"peer1".to_string(), channel())
            .unwrap_err();
        assert!(matches!(err, SwapError::AlreadyActive));

        // A different peer is fine outside single-swap mode.
        manager.new_swap("cc", &"peer2".to_string(), channel()).unwrap();
    }

    #[test]
    fn single_swap_mode_blocks_all_seconds() {
        let manager = SwapManager::new(true);
        manager.new_swap("aa", &"peer1".to_string(), channel()).unwrap();
        let err = manager
            .new_swap("bb", &"peer2".to_string(), channel())
            .unwrap_err();
        assert!(matches!(err, SwapError::AlreadyActive));
    }

    #[test]
    fn complete_frees_the_peer_slot() {
        let manager = SwapManager::new(false);
        manager.new_swap("aa", &"peer1".to_string(), channel()).unwrap();
        manager.bind_contract_id("aa", "cc");
        assert!(manager.get("cc").is_some());

        manager.complete("aa").unwrap();
        assert!(manager.get("aa").is_none());
        assert!(manager.get("cc").is_none());
        manager.new_swap("bb", &"peer1".to_string(), channel()).unwrap();
    }

    #[test]
    fn lookup_by_both_ids() {
        let manager = SwapManager::new(false);
        manager.new_swap("aa", &"peer1".to_string(), channel()).unwrap();
        manager.bind_contract_id("aa", "ff");
        assert_eq!(manager.get("aa").unwrap().offer_id, "aa");
        assert_eq!(manager.get("ff").unwrap().offer_id, "aa");
        assert_eq!(manager.active_ids(), vec!["aa"]);
    }
}
