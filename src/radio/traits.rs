//! Radio abstraction consumed by the link scheduler and protocol engine
//!
//! The trait covers exactly what the upper layers need from the transceiver,
//! allowing the nRF905 driver to be swapped with a mock for testing.

use crate::radio::registers::RadioConfig;
use heapless::Vec;

/// The chip always transfers its full RX register, regardless of the
/// configured payload width.
pub const RX_BUFFER_SIZE: usize = 32;

/// Errors that can occur during radio operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// Codec or payload input out of range
    InvalidField,
    /// Register read-back after a config write did not match
    ConfigWrite,
    /// SPI transfer failed
    Bus,
    /// Pin drive failed
    Pin,
}

/// Transceiver power/mode states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    PowerDown,
    Idle,
    Receive,
    Transmit,
}

/// Edge-triggered events reported by [`Radio::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A frame passed address match and CRC; carries the full RX register.
    RxComplete(Vec<u8, RX_BUFFER_SIZE>),
    /// The TX shift register drained; the radio is now in the stored next mode.
    TxReady,
    /// An address match was seen but the frame failed its CRC.
    RxInvalid,
}

/// Abstract transceiver interface.
///
/// [`poll`](Radio::poll) must be called from the main loop; it samples the
/// status lines and reports at most one event per call.
pub trait Radio {
    /// Switch the transceiver power/mode state.
    fn set_mode(&mut self, mode: Mode) -> Result<(), RadioError>;

    /// Program the full register image and the matching TX address, then
    /// verify by read-back.
    fn configure(&mut self, config: &RadioConfig) -> Result<(), RadioError>;

    /// Point both the receive and transmit addresses at `address`.
    fn set_network_address(&mut self, address: u32) -> Result<(), RadioError>;

    /// Load the TX payload register. The payload persists across
    /// transmissions until overwritten.
    fn write_tx_payload(&mut self, data: &[u8]) -> Result<(), RadioError>;

    /// Begin transmitting the loaded payload; on TX completion the driver
    /// switches to `next_mode`.
    fn start_tx(&mut self, next_mode: Mode) -> Result<(), RadioError>;

    /// Carrier detect. Absent detect pin reads as a free airway.
    fn airway_busy(&mut self) -> bool;

    /// Sample the status lines and report an edge, if any.
    fn poll(&mut self) -> Result<Option<RadioEvent>, RadioError>;
}
