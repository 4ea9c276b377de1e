//! nRF905 transceiver driver
//!
//! Drives the chip over SPI with three mode pins (PWR, CE, TXEN) and an
//! optional carrier-detect input. Every register instruction is a single
//! full-duplex transaction issued from idle mode; the first byte carries the
//! instruction out and the status register back. DR (data ready) and AM
//! (address match) are polled through the status byte and turned into
//! edge-triggered [`RadioEvent`]s.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiDevice;
use heapless::Vec;
use log::{debug, error, trace};

use crate::config::protocol::NETWORK_LINK_ID;
use crate::radio::registers::{RadioConfig, REGISTER_COUNT};
use crate::radio::traits::{Mode, Radio, RadioError, RadioEvent, RX_BUFFER_SIZE};

/// nRF905 SPI instructions
mod instruction {
    pub const W_CONFIG: u8 = 0x00;
    pub const R_CONFIG: u8 = 0x10;
    pub const W_TX_PAYLOAD: u8 = 0x20;
    pub const R_TX_PAYLOAD: u8 = 0x21;
    pub const W_TX_ADDRESS: u8 = 0x22;
    pub const R_TX_ADDRESS: u8 = 0x23;
    pub const R_RX_PAYLOAD: u8 = 0x24;
    pub const NOP: u8 = 0xFF;
}

/// Status byte bits, returned on every instruction
mod status {
    /// Data ready: RX frame received or TX shift register drained
    pub const DATA_READY: u8 = 1 << 5;
    /// Address match on an incoming carrier
    pub const ADDRESS_MATCH: u8 = 1 << 7;
}

/// Settle time after leaving power-down before the transmit pins may pulse
const POWER_UP_SETTLE_MS: u32 = 3;

/// nRF905 driver
///
/// Generic over the SPI device (which owns chip-select framing), the three
/// mode pins and a delay provider. The carrier-detect pin is optional; when
/// absent the airway always reads free.
pub struct Nrf905<Spi, Pwr, Ce, TxEn, Cd, D> {
    spi: Spi,
    pwr: Pwr,
    ce: Ce,
    txen: TxEn,
    cd: Option<Cd>,
    delay: D,
    mode: Mode,
    next_mode: Mode,
    config: RadioConfig,
    last_status: u8,
    address_match: bool,
}

impl<Spi, Pwr, Ce, TxEn, Cd, D> Nrf905<Spi, Pwr, Ce, TxEn, Cd, D>
where
    Spi: SpiDevice,
    Pwr: OutputPin,
    Ce: OutputPin,
    TxEn: OutputPin,
    Cd: InputPin,
    D: DelayNs,
{
    /// Create a new driver. The chip is left untouched until
    /// [`set_mode`](Radio::set_mode) or [`configure`](Radio::configure) is
    /// called.
    pub fn new(spi: Spi, pwr: Pwr, ce: Ce, txen: TxEn, cd: Option<Cd>, delay: D) -> Self {
        Self {
            spi,
            pwr,
            ce,
            txen,
            cd,
            delay,
            mode: Mode::PowerDown,
            next_mode: Mode::PowerDown,
            config: RadioConfig::zehnder_profile(NETWORK_LINK_ID),
            last_status: 0,
            address_match: false,
        }
    }

    /// Current power/mode state.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Cached register image; refreshed by [`read_config`](Self::read_config)
    /// and rewritten by [`write_config`](Self::write_config).
    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    fn transfer(&mut self, buf: &mut [u8]) -> Result<(), RadioError> {
        self.spi.transfer_in_place(buf).map_err(|_| RadioError::Bus)
    }

    fn drive_pins(&mut self, mode: Mode) -> Result<(), RadioError> {
        let pwr = mode != Mode::PowerDown;
        let ce = mode == Mode::Receive || mode == Mode::Transmit;
        let txen = mode == Mode::Transmit;

        self.pwr.set_state(pwr.into()).map_err(|_| RadioError::Pin)?;
        self.ce.set_state(ce.into()).map_err(|_| RadioError::Pin)?;
        self.txen.set_state(txen.into()).map_err(|_| RadioError::Pin)?;
        Ok(())
    }

    /// Read the register image from the chip, refreshing the cache.
    pub fn read_config(&mut self) -> Result<RadioConfig, RadioError> {
        let mode = self.mode;
        self.set_mode(Mode::Idle)?;

        let mut buf = [0u8; REGISTER_COUNT + 1];
        buf[0] = instruction::R_CONFIG;
        self.transfer(&mut buf)?;

        let mut image = [0u8; REGISTER_COUNT];
        image.copy_from_slice(&buf[1..]);
        self.config = RadioConfig::decode(&image);
        trace!("read config image: {:02x?}", image);

        self.set_mode(mode)?;
        Ok(self.config)
    }

    /// Program the register image, then read it back and compare.
    ///
    /// A mismatch leaves the chip in an undefined configuration and is
    /// reported as [`RadioError::ConfigWrite`]; the caller may retry.
    pub fn write_config(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        let image = config.encode()?;
        self.config = *config;

        let mode = self.mode;
        self.set_mode(Mode::Idle)?;

        let mut buf = [0u8; REGISTER_COUNT + 1];
        buf[0] = instruction::W_CONFIG;
        buf[1..].copy_from_slice(&image);
        trace!("write config image: {:02x?}", image);
        let result = self.transfer(&mut buf).and_then(|()| {
            let mut verify = [0u8; REGISTER_COUNT + 1];
            verify[0] = instruction::R_CONFIG;
            self.transfer(&mut verify)?;
            if verify[1..] != image {
                error!("config write failed, read back {:02x?}", &verify[1..]);
                return Err(RadioError::ConfigWrite);
            }
            Ok(())
        });

        self.set_mode(mode)?;
        result
    }

    /// Program the TX address register, little-endian.
    pub fn write_tx_address(&mut self, address: u32) -> Result<(), RadioError> {
        debug!("set TX address {:#010x}", address);

        let mode = self.mode;
        self.set_mode(Mode::Idle)?;

        let mut buf = [0u8; 5];
        buf[0] = instruction::W_TX_ADDRESS;
        buf[1..].copy_from_slice(&address.to_le_bytes());
        let result = self.transfer(&mut buf);

        self.set_mode(mode)?;
        result
    }

    /// Read the TX address register back.
    pub fn read_tx_address(&mut self) -> Result<u32, RadioError> {
        let mode = self.mode;
        self.set_mode(Mode::Idle)?;

        let mut buf = [0u8; 5];
        buf[0] = instruction::R_TX_ADDRESS;
        let result = self.transfer(&mut buf);

        self.set_mode(mode)?;
        result?;
        Ok(u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]))
    }

    /// Load the TX payload register. Shorter payloads are zero padded; the
    /// register keeps its contents across transmissions.
    pub fn write_tx_payload(&mut self, data: &[u8]) -> Result<(), RadioError> {
        if data.len() > RX_BUFFER_SIZE {
            error!("TX payload of {} bytes exceeds the chip buffer", data.len());
            return Err(RadioError::InvalidField);
        }

        let mode = self.mode;
        self.set_mode(Mode::Idle)?;

        let mut buf = [0u8; RX_BUFFER_SIZE + 1];
        buf[0] = instruction::W_TX_PAYLOAD;
        buf[1..1 + data.len()].copy_from_slice(data);
        let result = self.transfer(&mut buf);

        self.set_mode(mode)?;
        result
    }

    /// Read `len` bytes of the TX payload register back.
    pub fn read_tx_payload(&mut self, len: usize) -> Result<Vec<u8, RX_BUFFER_SIZE>, RadioError> {
        if len > RX_BUFFER_SIZE {
            return Err(RadioError::InvalidField);
        }

        let mode = self.mode;
        self.set_mode(Mode::Idle)?;

        let mut buf = [0u8; RX_BUFFER_SIZE + 1];
        buf[0] = instruction::R_TX_PAYLOAD;
        let result = self.transfer(&mut buf[..len + 1]);

        self.set_mode(mode)?;
        result?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&buf[1..len + 1]).ok();
        Ok(payload)
    }

    /// Read the RX payload register. Unlike the other register accesses this
    /// does not switch modes; it is issued on the data-ready edge while the
    /// chip sits in receive mode.
    fn read_rx_payload(&mut self) -> Result<Vec<u8, RX_BUFFER_SIZE>, RadioError> {
        let mut buf = [0u8; RX_BUFFER_SIZE + 1];
        buf[0] = instruction::R_RX_PAYLOAD;
        self.transfer(&mut buf)?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&buf[1..]).ok();
        Ok(payload)
    }

    /// Read the status register through a NOP instruction.
    pub fn read_status(&mut self) -> Result<u8, RadioError> {
        let mut buf = [instruction::NOP];
        self.transfer(&mut buf)?;
        Ok(buf[0])
    }
}

impl<Spi, Pwr, Ce, TxEn, Cd, D> Radio for Nrf905<Spi, Pwr, Ce, TxEn, Cd, D>
where
    Spi: SpiDevice,
    Pwr: OutputPin,
    Ce: OutputPin,
    TxEn: OutputPin,
    Cd: InputPin,
    D: DelayNs,
{
    fn set_mode(&mut self, mode: Mode) -> Result<(), RadioError> {
        self.drive_pins(mode)?;
        self.mode = mode;
        Ok(())
    }

    fn configure(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        self.write_config(config)?;
        // RX and TX addresses are always paired on the fan network
        self.write_tx_address(config.rx_address)?;
        debug!(
            "configured: channel {} ({} Hz), rx address {:#010x}, {} dBm",
            config.channel,
            config.rf_frequency_hz(),
            config.rx_address,
            config.tx_power.dbm()
        );
        Ok(())
    }

    fn set_network_address(&mut self, address: u32) -> Result<(), RadioError> {
        let mut config = self.config;
        config.rx_address = address;
        self.configure(&config)
    }

    fn write_tx_payload(&mut self, data: &[u8]) -> Result<(), RadioError> {
        Nrf905::write_tx_payload(self, data)
    }

    fn start_tx(&mut self, next_mode: Mode) -> Result<(), RadioError> {
        if self.mode == Mode::PowerDown {
            // The radio needs time to power up before the TX pins pulse
            self.set_mode(Mode::Idle)?;
            self.delay.delay_ms(POWER_UP_SETTLE_MS);
        }

        self.next_mode = next_mode;
        self.set_mode(Mode::Transmit)
    }

    fn airway_busy(&mut self) -> bool {
        match self.cd.as_mut() {
            Some(pin) => pin.is_high().unwrap_or(false),
            None => false,
        }
    }

    fn poll(&mut self) -> Result<Option<RadioEvent>, RadioError> {
        let state = self.read_status()? & (status::DATA_READY | status::ADDRESS_MATCH);
        if state == self.last_status {
            return Ok(None);
        }
        trace!("status edge {:#04x} -> {:#04x}", self.last_status, state);
        self.last_status = state;

        if state == (status::DATA_READY | status::ADDRESS_MATCH) {
            // RX complete
            self.address_match = false;
            let payload = self.read_rx_payload()?;
            debug!("RX complete: {:02x?}", payload.as_slice());
            Ok(Some(RadioEvent::RxComplete(payload)))
        } else if state == status::DATA_READY {
            // TX complete
            self.address_match = false;
            self.set_mode(self.next_mode)?;
            debug!("TX ready");
            Ok(Some(RadioEvent::TxReady))
        } else if state == status::ADDRESS_MATCH {
            self.address_match = true;
            debug!("address match");
            Ok(None)
        } else if self.address_match {
            // Address match cleared without data ready: CRC failure
            self.address_match = false;
            debug!("RX invalid");
            Ok(Some(RadioEvent::RxInvalid))
        } else {
            Ok(None)
        }
    }
}
