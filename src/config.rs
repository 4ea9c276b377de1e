//! Configuration constants for the Zehnder/BUVA RF link

/// Fixed nRF905 profile used on the fan network
pub mod radio_defaults {
    /// RF channel (868.4 MHz together with the band select)
    pub const PAIRING_CHANNEL: u16 = 118;

    /// Band select: `true` = 868/915 MHz band, `false` = 434 MHz band
    pub const PAIRING_BAND: bool = true;

    /// Address width in bytes for both directions
    pub const ADDRESS_WIDTH: u8 = 4;

    /// Payload width in bytes for both directions
    pub const PAYLOAD_WIDTH: u8 = 16;

    /// Crystal frequency of the radio module
    pub const XTAL_FREQUENCY_HZ: u32 = 16_000_000;
}

/// Fan network protocol constants
pub mod protocol {
    /// Bytes per on-air frame
    pub const FAN_FRAMESIZE: usize = 16;

    /// On-air retransmits of every frame per transmission start
    pub const FAN_TX_FRAMES: u8 = 4;

    /// Scheduler-level retries when no reply is received
    pub const FAN_TX_RETRIES: i8 = 10;

    /// Default frame time-to-live (0xFA)
    pub const FAN_TTL: u8 = 250;

    /// Wait this long for a reply before retrying
    pub const FAN_REPLY_TIMEOUT_MS: u64 = 1000;

    /// Give up carrier sensing after this long
    pub const AIRWAY_WAIT_CEILING_MS: u64 = 5000;

    /// No RF activity before this much time has passed since boot
    pub const STARTUP_DELAY_MS: u64 = 15_000;

    /// Steady-state fan settings poll interval
    pub const QUERY_INTERVAL_MS: u64 = 10_000;

    /// Well-known address shared by all unpaired devices; used only during discovery
    pub const NETWORK_LINK_ID: u32 = 0xA55A_5AA5;

    /// Number of speed presets above `off`
    pub const SPEED_COUNT: u8 = 4;
}

/// Non-volatile storage constants
pub mod storage {
    /// Preference name hashed into the storage key for the pairing record
    pub const PREFERENCE_NAME: &str = "zehnderrf";
}
