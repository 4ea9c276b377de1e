//! nRF905 RF-CONFIG register image
//!
//! The ten configuration registers are bit-packed: the 9-bit channel spans
//! the first byte boundary, the crystal frequency is stored as
//! `(f / 4 MHz) - 1` and the TX power as a 2-bit code. [`RadioConfig`] is the
//! semantic view; [`RadioConfig::encode`] and [`RadioConfig::decode`] map it
//! to and from the on-chip image.

use crate::config::radio_defaults;
use crate::radio::traits::RadioError;

/// Number of RF-CONFIG registers
pub const REGISTER_COUNT: usize = 10;

/// TX output power, 2-bit encoded
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPower {
    Minus10Dbm = 0b00,
    Minus2Dbm = 0b01,
    Plus6Dbm = 0b10,
    Plus10Dbm = 0b11,
}

impl TxPower {
    fn from_code(code: u8) -> Self {
        match code & 0x03 {
            0b00 => Self::Minus10Dbm,
            0b01 => Self::Minus2Dbm,
            0b10 => Self::Plus6Dbm,
            _ => Self::Plus10Dbm,
        }
    }

    /// Output power in dBm
    pub fn dbm(self) -> i8 {
        match self {
            Self::Minus10Dbm => -10,
            Self::Minus2Dbm => -2,
            Self::Plus6Dbm => 6,
            Self::Plus10Dbm => 10,
        }
    }
}

/// Receiver sensitivity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPower {
    Normal,
    Reduced,
}

/// Clock output frequency, 2-bit encoded
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOut {
    Clk4MHz = 0b00,
    Clk2MHz = 0b01,
    Clk1MHz = 0b10,
    Clk500kHz = 0b11,
}

impl ClockOut {
    fn from_code(code: u8) -> Self {
        match code & 0x03 {
            0b00 => Self::Clk4MHz,
            0b01 => Self::Clk2MHz,
            0b10 => Self::Clk1MHz,
            _ => Self::Clk500kHz,
        }
    }

    /// Output frequency in Hz
    pub fn hz(self) -> u32 {
        match self {
            Self::Clk4MHz => 4_000_000,
            Self::Clk2MHz => 2_000_000,
            Self::Clk1MHz => 1_000_000,
            Self::Clk500kHz => 500_000,
        }
    }
}

/// CRC checksum width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcBits {
    Eight,
    Sixteen,
}

/// Semantic view of the RF-CONFIG register block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioConfig {
    /// RF channel index, 9 bits (0-511)
    pub channel: u16,
    /// Band select: `true` = 868/915 MHz band, `false` = 434 MHz band
    pub band: bool,
    pub tx_power: TxPower,
    pub rx_power: RxPower,
    /// Continuous retransmission of the TX payload while in transmit mode
    pub auto_retransmit: bool,
    /// Receive address, matched against incoming frames
    pub rx_address: u32,
    /// Receive address width in bytes (1-4)
    pub rx_address_width: u8,
    /// Transmit address width in bytes (1-4)
    pub tx_address_width: u8,
    /// Receive payload width in bytes (1-32)
    pub rx_payload_width: u8,
    /// Transmit payload width in bytes (1-32)
    pub tx_payload_width: u8,
    pub clock_out: ClockOut,
    pub clock_out_enable: bool,
    /// Crystal frequency in Hz; must be a multiple of 4 MHz, 4-32 MHz
    pub xtal_frequency_hz: u32,
    pub crc_enable: bool,
    pub crc_bits: CrcBits,
}

impl RadioConfig {
    /// The fixed profile used on the Zehnder/BUVA fan network.
    ///
    /// Channel 118 in the 868 MHz band, CRC-16, +10 dBm, 4-byte addressing
    /// and 16-byte payloads. Only the receive address varies (the pairing
    /// address before discovery, the network id afterwards).
    pub fn zehnder_profile(rx_address: u32) -> Self {
        Self {
            channel: radio_defaults::PAIRING_CHANNEL,
            band: radio_defaults::PAIRING_BAND,
            tx_power: TxPower::Plus10Dbm,
            rx_power: RxPower::Normal,
            auto_retransmit: false,
            rx_address,
            rx_address_width: radio_defaults::ADDRESS_WIDTH,
            tx_address_width: radio_defaults::ADDRESS_WIDTH,
            rx_payload_width: radio_defaults::PAYLOAD_WIDTH,
            tx_payload_width: radio_defaults::PAYLOAD_WIDTH,
            clock_out: ClockOut::Clk500kHz,
            clock_out_enable: false,
            xtal_frequency_hz: radio_defaults::XTAL_FREQUENCY_HZ,
            crc_enable: true,
            crc_bits: CrcBits::Sixteen,
        }
    }

    /// RF carrier frequency derived from channel and band select.
    ///
    /// Not a register; used for logging only.
    pub fn rf_frequency_hz(&self) -> u32 {
        (422_400_000 + self.channel as u32 * 100_000) * if self.band { 2 } else { 1 }
    }

    /// Encode into the 10-byte register image.
    ///
    /// Returns [`RadioError::InvalidField`] when a field is out of range;
    /// nothing is written in that case.
    pub fn encode(&self) -> Result<[u8; REGISTER_COUNT], RadioError> {
        if self.channel > 0x1FF {
            return Err(RadioError::InvalidField);
        }
        if !(1..=4).contains(&self.rx_address_width) || !(1..=4).contains(&self.tx_address_width) {
            return Err(RadioError::InvalidField);
        }
        if !(1..=32).contains(&self.rx_payload_width) || !(1..=32).contains(&self.tx_payload_width)
        {
            return Err(RadioError::InvalidField);
        }
        if self.xtal_frequency_hz % 4_000_000 != 0
            || !(4_000_000..=32_000_000).contains(&self.xtal_frequency_hz)
        {
            return Err(RadioError::InvalidField);
        }

        let mut data = [0u8; REGISTER_COUNT];

        data[0] = (self.channel & 0xFF) as u8;
        data[1] = ((self.channel >> 8) & 0x01) as u8;
        data[1] |= if self.band { 0x02 } else { 0x00 };
        data[1] |= (self.tx_power as u8) << 2;
        data[1] |= if self.rx_power == RxPower::Reduced { 0x10 } else { 0x00 };
        data[1] |= if self.auto_retransmit { 0x20 } else { 0x00 };
        data[2] = self.rx_address_width & 0x07;
        data[2] |= (self.tx_address_width & 0x07) << 4;
        data[3] = self.rx_payload_width & 0x3F;
        data[4] = self.tx_payload_width & 0x3F;
        data[5..9].copy_from_slice(&self.rx_address.to_le_bytes());
        data[9] = self.clock_out as u8;
        data[9] |= if self.clock_out_enable { 0x04 } else { 0x00 };
        data[9] |= ((self.xtal_frequency_hz / 4_000_000 - 1) as u8) << 3;
        data[9] |= if self.crc_enable { 0x40 } else { 0x00 };
        data[9] |= if self.crc_bits == CrcBits::Sixteen { 0x80 } else { 0x00 };

        Ok(data)
    }

    /// Decode the 10-byte register image read back from the chip.
    pub fn decode(data: &[u8; REGISTER_COUNT]) -> Self {
        Self {
            channel: ((data[1] as u16 & 0x01) << 8) | data[0] as u16,
            band: data[1] & 0x02 != 0,
            tx_power: TxPower::from_code(data[1] >> 2),
            rx_power: if data[1] & 0x10 != 0 { RxPower::Reduced } else { RxPower::Normal },
            auto_retransmit: data[1] & 0x20 != 0,
            rx_address_width: data[2] & 0x07,
            tx_address_width: (data[2] >> 4) & 0x07,
            rx_payload_width: data[3] & 0x3F,
            tx_payload_width: data[4] & 0x3F,
            rx_address: u32::from_le_bytes([data[5], data[6], data[7], data[8]]),
            clock_out: ClockOut::from_code(data[9]),
            clock_out_enable: data[9] & 0x04 != 0,
            xtal_frequency_hz: (((data[9] >> 3) & 0x07) as u32 + 1) * 4_000_000,
            crc_enable: data[9] & 0x40 != 0,
            crc_bits: if data[9] & 0x80 != 0 { CrcBits::Sixteen } else { CrcBits::Eight },
        }
    }
}
