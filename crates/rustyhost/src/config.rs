//! Stack configuration
//!
//! One struct per engine, gathered into [`StackConfig`]. Every field has a
//! default, so callers usually start from `StackConfig::default()` and
//! override what they need.

use crate::adv::AdvConfig;
use crate::gap::{AddressType, AddressWithType, BdAddr};
use crate::gatt::GattConfig;
use crate::rfcomm::RfcommConfig;
use crate::smp::SmpConfig;

/// Configuration of the whole host core
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Address the local controller uses on LE links
    pub local_address: AddressWithType,
    pub rfcomm: RfcommConfig,
    pub smp: SmpConfig,
    pub gatt: GattConfig,
    pub adv: AdvConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            local_address: AddressWithType::new(BdAddr::ANY, AddressType::Public),
            rfcomm: RfcommConfig::default(),
            smp: SmpConfig::default(),
            gatt: GattConfig::default(),
            adv: AdvConfig::default(),
        }
    }
}

impl StackConfig {
    pub fn with_local_address(mut self, address: AddressWithType) -> Self {
        self.local_address = address;
        self
    }
}
