//! Persisted pairing record
//!
//! Written once after a successful discovery and loaded at every boot. The
//! record is a fixed 8-byte little-endian image; a record with any zero
//! field is treated as "never paired".

/// Identity of this remote and its main unit on one installation's network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairingConfig {
    /// RF address shared by all members of the fan network
    pub network_id: u32,
    pub my_device_type: u8,
    pub my_device_id: u8,
    pub main_unit_type: u8,
    pub main_unit_id: u8,
}

impl PairingConfig {
    /// Stored record size in bytes
    pub const SIZE: usize = 8;

    /// All fields non-zero marks a completed pairing.
    pub fn is_valid(&self) -> bool {
        self.network_id != 0
            && self.my_device_type != 0
            && self.my_device_id != 0
            && self.main_unit_type != 0
            && self.main_unit_id != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[..4].copy_from_slice(&self.network_id.to_le_bytes());
        data[4] = self.my_device_type;
        data[5] = self.my_device_id;
        data[6] = self.main_unit_type;
        data[7] = self.main_unit_id;
        data
    }

    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Self {
        Self {
            network_id: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            my_device_type: data[4],
            my_device_id: data[5],
            main_unit_type: data[6],
            main_unit_id: data[7],
        }
    }
}
