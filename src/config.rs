//! Configuration collaborator of the bus core.
//!
//! The transceiver needs three answers from the device configuration
//! store: its own physical address, whether a group address is in the
//! address table, and whether every telegram should be delivered to the
//! higher layers regardless of addressing. The store itself (EEPROM
//! layout, commissioning) is outside this crate.

/// Access to the configuration values the transceiver depends on.
pub trait BusConfig {
    /// The device's own physical address, assembled big endian from the
    /// first two bytes of the address table.
    fn own_address(&self) -> u16;

    /// True if the given group address is in the device's address table.
    fn is_group_member(&self, address: u16) -> bool;

    /// True if every valid telegram is to be published to the higher
    /// layers, regardless of its destination. Acknowledge policy is not
    /// affected: promiscuously received foreign traffic is never ACKed.
    fn promiscuous(&self) -> bool;
}

/// A fixed configuration, useful for firmware with a compile-time group
/// table and for tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticConfig {
    /// Own physical address.
    pub address: u16,
    /// Group addresses the device listens to.
    pub groups: &'static [u16],
    /// Publish every telegram to the higher layers.
    pub promiscuous: bool,
}

impl BusConfig for StaticConfig {
    fn own_address(&self) -> u16 {
        self.address
    }

    fn is_group_member(&self, address: u16) -> bool {
        self.groups.contains(&address)
    }

    fn promiscuous(&self) -> bool {
        self.promiscuous
    }
}
