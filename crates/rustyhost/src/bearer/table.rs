//! Registry of open bearers

use super::types::{BearerDescriptor, BearerError, BearerId, BearerResult};
use crate::gap::BdAddr;
use log::debug;
use std::collections::{HashMap, HashSet};

/// Open bearers keyed by id; invalidated ids are remembered forever
#[derive(Debug, Default)]
pub struct BearerTable {
    open: HashMap<BearerId, BearerDescriptor>,
    retired: HashSet<BearerId>,
}

impl BearerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly established channel
    pub fn open(&mut self, descriptor: BearerDescriptor) -> BearerResult<()> {
        let id = descriptor.id;
        if self.retired.contains(&id) {
            return Err(BearerError::Invalidated(id));
        }
        if self.open.contains_key(&id) {
            return Err(BearerError::AlreadyOpen(id));
        }

        debug!(
            "bearer {} open to {} cid {:#06x} mtu {}",
            id, descriptor.peer, descriptor.local_cid, descriptor.mtu
        );
        self.open.insert(id, descriptor);
        Ok(())
    }

    /// Remove a channel; its id can never be opened again
    pub fn invalidate(&mut self, id: BearerId) -> BearerResult<BearerDescriptor> {
        let descriptor = self.open.remove(&id).ok_or(BearerError::UnknownBearer(id))?;
        self.retired.insert(id);
        debug!("bearer {} invalidated", id);
        Ok(descriptor)
    }

    pub fn get(&self, id: BearerId) -> BearerResult<&BearerDescriptor> {
        self.open.get(&id).ok_or(BearerError::UnknownBearer(id))
    }

    pub fn set_congested(&mut self, id: BearerId, congested: bool) -> BearerResult<()> {
        let descriptor = self.open.get_mut(&id).ok_or(BearerError::UnknownBearer(id))?;
        descriptor.congested = congested;
        Ok(())
    }

    pub fn set_mtu(&mut self, id: BearerId, mtu: u16) -> BearerResult<()> {
        let descriptor = self.open.get_mut(&id).ok_or(BearerError::UnknownBearer(id))?;
        descriptor.mtu = mtu;
        Ok(())
    }

    /// Every open bearer to `peer`
    pub fn for_peer(&self, peer: &BdAddr) -> Vec<&BearerDescriptor> {
        let mut found: Vec<&BearerDescriptor> =
            self.open.values().filter(|d| d.peer == *peer).collect();
        found.sort_by_key(|d| d.id);
        found
    }

    pub fn is_retired(&self, id: BearerId) -> bool {
        self.retired.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
