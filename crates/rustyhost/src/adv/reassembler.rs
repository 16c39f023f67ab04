//! Advertising report reassembler
//!
//! Extended advertising data may arrive split over several HCI reports and
//! may be followed by a scan response. Fragments are accumulated per
//! advertising set in a small LRU cache and released as one report once
//! the set is complete.

use super::constants::*;
use super::types::*;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::fmt::Debug;

/// Most-recently-used-first cache with a fixed capacity
#[derive(Debug)]
struct FragmentCache<K, V> {
    entries: VecDeque<(K, V)>,
    capacity: usize,
}

impl<K: PartialEq + Copy + Debug, V> FragmentCache<K, V> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    fn get(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        self.entries.remove(pos).map(|(_, v)| v)
    }

    /// Fetch the entry for `key`, creating it if needed, and mark it most recent.
    /// The least recently used entries beyond capacity are discarded.
    fn touch_or_insert_with<F: FnOnce() -> V>(&mut self, key: K, make: F) -> &mut V {
        let value = match self.remove(&key) {
            Some(value) => value,
            None => make(),
        };
        self.entries.push_front((key, value));

        while self.entries.len() > self.capacity {
            if let Some((evicted, _)) = self.entries.pop_back() {
                debug!("evicting stale advertising fragment {:?}", evicted);
            }
        }
        &mut self.entries[0].1
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Partially received advertising set
#[derive(Debug)]
struct PendingAdv {
    event_type: ExtendedEventType,
    data: Vec<u8>,
    /// Advertising data is complete and a scan response is awaited
    awaiting_scan_response: bool,
}

/// Reassembles fragmented extended and periodic advertising reports
#[derive(Debug)]
pub struct AdvReassembler {
    config: AdvConfig,
    extended: FragmentCache<AdvKey, PendingAdv>,
    periodic: FragmentCache<u16, Vec<u8>>,
}

impl Default for AdvReassembler {
    fn default() -> Self {
        Self::new(AdvConfig::default())
    }
}

impl AdvReassembler {
    pub fn new(config: AdvConfig) -> Self {
        Self {
            extended: FragmentCache::new(config.cache_size),
            periodic: FragmentCache::new(config.periodic_cache_size),
            config,
        }
    }

    /// Enable or disable waiting for scan responses (active vs passive scan)
    pub fn set_scan_responses(&mut self, enabled: bool) {
        self.config.scan_responses = enabled;
    }

    /// Number of advertising sets with buffered fragments
    pub fn pending_count(&self) -> usize {
        self.extended.len()
    }

    /// Number of periodic trains with buffered fragments
    pub fn periodic_pending_count(&self) -> usize {
        self.periodic.len()
    }

    /// Whether fragments are buffered for the given advertising set
    pub fn has_pending(&self, key: &AdvKey) -> bool {
        self.extended.contains(key)
    }

    /// Buffered payload length for the given advertising set
    pub fn pending_len(&self, key: &AdvKey) -> Option<usize> {
        self.extended.get(key).map(|p| p.data.len())
    }

    /// Drop every buffered fragment, e.g. when scanning stops
    pub fn clear(&mut self) {
        self.extended.clear();
        self.periodic.clear();
    }

    /// Feed one extended (or legacy-mapped) report; returns a report once complete
    pub fn process_report(&mut self, fragment: AdvReportFragment) -> Option<AdvReport> {
        if !fragment.address.is_anonymous() && fragment.address.address.is_zero() {
            warn!("dropping advertising report with empty address");
            return None;
        }

        let key = AdvKey::for_fragment(&fragment);
        let event_type = fragment.event_type;
        let is_scan_response = event_type.is_scan_response();

        if is_scan_response && (!self.config.scan_responses || !self.extended.contains(&key)) {
            trace!("dropping unsolicited scan response from {}", fragment.address);
            return None;
        }

        let mut payload = fragment.data.as_slice();
        if event_type.is_legacy() {
            payload = strip_zero_padding(payload);
            if !is_scan_response {
                // Legacy advertisements are never fragmented
                self.extended.remove(&key);
            }
        }

        let pending = self.extended.touch_or_insert_with(key, || PendingAdv {
            event_type,
            data: Vec::new(),
            awaiting_scan_response: false,
        });

        if is_scan_response {
            let connectable = pending.event_type & ExtendedEventType::CONNECTABLE;
            pending.event_type = event_type.difference(ExtendedEventType::CONNECTABLE) | connectable;
            pending.awaiting_scan_response = false;
        } else {
            if pending.awaiting_scan_response {
                // A new advertisement replaces one whose scan response never came
                pending.data.clear();
                pending.awaiting_scan_response = false;
            }
            pending.event_type = event_type;
        }

        let room = MAX_ADV_DATA_LEN.saturating_sub(pending.data.len());
        pending
            .data
            .extend_from_slice(&payload[..payload.len().min(room)]);

        if fragment.data_status == DataStatus::More {
            trace!("waiting for more data from {}", fragment.address);
            return None;
        }

        if !is_scan_response && event_type.is_scannable() && self.config.scan_responses {
            trace!("waiting for scan response from {}", fragment.address);
            pending.awaiting_scan_response = true;
            return None;
        }

        let pending = self.extended.remove(&key)?;
        Some(AdvReport {
            event_type: pending.event_type,
            data_status: fragment.data_status,
            address: fragment.address,
            primary_phy: fragment.primary_phy,
            secondary_phy: fragment.secondary_phy,
            sid: fragment.sid,
            tx_power: fragment.tx_power,
            rssi: fragment.rssi,
            periodic_adv_interval: fragment.periodic_adv_interval,
            direct_address: fragment.direct_address,
            data: trim_gap_entries(&pending.data),
        })
    }

    /// Feed one periodic advertising report; returns a report once complete
    pub fn process_periodic(&mut self, fragment: PeriodicReportFragment) -> Option<PeriodicReport> {
        let buffer = self
            .periodic
            .touch_or_insert_with(fragment.sync_handle, Vec::new);
        let room = MAX_ADV_DATA_LEN.saturating_sub(buffer.len());
        buffer.extend_from_slice(&fragment.data[..fragment.data.len().min(room)]);

        if fragment.data_status == DataStatus::More {
            return None;
        }

        let data = self.periodic.remove(&fragment.sync_handle)?;
        Some(PeriodicReport {
            sync_handle: fragment.sync_handle,
            tx_power: fragment.tx_power,
            rssi: fragment.rssi,
            cte_type: fragment.cte_type,
            data_status: fragment.data_status,
            data: trim_gap_entries(&data),
        })
    }

    /// Forget buffered data for a periodic train whose sync was lost
    pub fn sync_lost(&mut self, sync_handle: u16) {
        if self.periodic.remove(&sync_handle).is_some() {
            debug!("discarded partial periodic report for sync {:#06x}", sync_handle);
        }
    }
}

/// Drop empty and overflowing GAP entries.
///
/// An entry is kept when its length byte is non-zero and its body fits in
/// what is left of the buffer. Malformed entries are skipped and the walk
/// continues past them.
pub fn trim_gap_entries(data: &[u8]) -> Vec<u8> {
    let mut trimmed = Vec::with_capacity(data.len());
    let mut position = 0;
    while position < data.len() {
        let len = data[position] as usize;
        let remaining = data.len() - position;
        if len > 0 && len < remaining {
            trimmed.extend_from_slice(&data[position..position + len + 1]);
        }
        position += len + 1;
    }
    trimmed
}

/// Strip zero padding some controllers append to legacy payloads.
///
/// Only a zero length byte followed by nothing but zeros is padding; a
/// zero in the middle of real data is left for the final trim.
fn strip_zero_padding(data: &[u8]) -> &[u8] {
    let mut position = 0;
    while position < data.len() {
        let len = data[position] as usize;
        if len == 0 {
            if data[position..].iter().all(|b| *b == 0) {
                return &data[..position];
            }
            return data;
        }
        position += len + 1;
    }
    data
}
