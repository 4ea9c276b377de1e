//! Fan protocol engine
//!
//! Top-level state machine for the remote: wait out the startup window, pair
//! with a main unit through the four-step discovery handshake (or load a
//! stored pairing), then poll the fan's settings and push speed changes in
//! steady state. Consumes the [`RfScheduler`] and produces fan-state
//! observations for the layer above.

pub mod pairing;

use log::{debug, error, info, warn};
use rand_core::RngCore;

use crate::config::protocol::{
    FAN_TX_RETRIES, NETWORK_LINK_ID, QUERY_INTERVAL_MS, SPEED_COUNT, STARTUP_DELAY_MS,
};
use crate::link::{LinkError, LinkEvent, LinkTimeout, RfScheduler};
use crate::platform::{Clock, Storage, PAIRING_PREFERENCE_KEY};
use crate::protocol::frame::{device_type, Frame, FramePayload};
use crate::radio::{Mode, Radio, RadioConfig, RadioError};
use pairing::PairingConfig;

/// Capabilities reported to the control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanTraits {
    pub oscillation: bool,
    pub speed: bool,
    pub direction: bool,
    pub speed_count: u8,
}

/// A fan observation, published after a settings reply from the main unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanState {
    /// Running (any speed preset above off)
    pub state: bool,
    /// Current speed preset
    pub speed: u8,
}

/// Events reported by [`RfEngine::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    StatePublished(FanState),
}

/// Engine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting out the startup window before any RF activity
    Startup,
    /// About to announce ourselves on the pairing address
    StartDiscovery,
    /// Announced, waiting for a main unit to open its network
    DiscoveryWaitForLinkRequest,
    /// Join request sent, waiting for the link acknowledge
    DiscoveryWaitForJoinResponse,
    /// Link acknowledged, waiting for the network query that commits the join
    DiscoveryJoinComplete,
    /// Paired and idle
    Idle,
    /// Settings query sent, waiting for the fan settings reply
    WaitQueryResponse,
    /// Speed change sent, waiting for the fan settings reply
    WaitSetSpeedResponse,
    /// Speed acknowledge sent, waiting for the transmitter to drain
    WaitSetSpeedConfirm,
}

/// A speed request captured while the engine was busy
#[derive(Debug, Clone, Copy)]
struct PendingControl {
    speed: u8,
    timer: u8,
}

/// Fan remote protocol engine.
///
/// Owns the RF scheduler (and through it the radio) plus the platform
/// collaborators. [`poll`](Self::poll) must be called from the main loop.
pub struct RfEngine<R: Radio, C: Clock, S: Storage, G: RngCore> {
    link: RfScheduler<R>,
    clock: C,
    storage: S,
    rng: G,
    state: EngineState,
    pairing: PairingConfig,
    boot_ms: u64,
    last_query_ms: u64,
    fan_on: bool,
    fan_speed: u8,
    pending: Option<PendingControl>,
}

impl<R: Radio, C: Clock, S: Storage, G: RngCore> RfEngine<R, C, S, G> {
    pub fn new(radio: R, clock: C, storage: S, rng: G) -> Self {
        let boot_ms = clock.now_ms();
        Self {
            link: RfScheduler::new(radio),
            clock,
            storage,
            rng,
            state: EngineState::Startup,
            pairing: PairingConfig::default(),
            boot_ms,
            last_query_ms: 0,
            fan_on: false,
            fan_speed: 0,
            pending: None,
        }
    }

    /// Bring up the radio with the fixed fan network profile, listening on
    /// the pairing address until a stored pairing is loaded.
    pub fn setup(&mut self) -> Result<(), RadioError> {
        let radio = self.link.radio_mut();
        radio.set_mode(Mode::PowerDown)?;
        radio.configure(&RadioConfig::zehnder_profile(NETWORK_LINK_ID))?;
        radio.set_mode(Mode::Idle)?;
        info!("radio ready on pairing address {:#010x}", NETWORK_LINK_ID);
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Identity of this remote and its main unit; zeroed until paired.
    pub fn pairing(&self) -> &PairingConfig {
        &self.pairing
    }

    /// Capabilities of the fan entity.
    pub fn traits(&self) -> FanTraits {
        FanTraits {
            oscillation: false,
            speed: true,
            direction: false,
            speed_count: SPEED_COUNT,
        }
    }

    /// Control entry from the layer above.
    ///
    /// Updates the local fan state and requests the matching speed preset
    /// from the main unit. Speeds are clamped to `0..=SPEED_COUNT`. When the
    /// engine is busy the request is stashed and dispatched at the next idle
    /// entry; a newer request replaces an older pending one.
    pub fn control(&mut self, state: Option<bool>, speed: Option<u8>) {
        if let Some(on) = state {
            self.fan_on = on;
        }
        if let Some(speed) = speed {
            self.fan_speed = speed.min(SPEED_COUNT);
            if self.fan_speed > 0 {
                self.fan_on = true;
            }
        }

        let target = if self.fan_on { self.fan_speed } else { 0 };
        self.request_speed(target, 0);
    }

    /// Request a speed preset for a limited time (timer in the fan's units).
    pub fn set_speed_timed(&mut self, speed: u8, timer: u8) {
        self.request_speed(speed.min(SPEED_COUNT), timer);
    }

    fn request_speed(&mut self, speed: u8, timer: u8) {
        debug!("speed request: preset {} timer {}", speed, timer);
        self.pending = Some(PendingControl { speed, timer });
        if self.state == EngineState::Idle {
            let now = self.clock.now_ms();
            self.dispatch_pending(now);
        }
    }

    /// Advance the engine. At most one transition per machine per call.
    pub fn poll(&mut self) -> Option<EngineEvent> {
        let now = self.clock.now_ms();

        match self.link.poll(now) {
            Some(LinkEvent::Received(buffer)) => return self.handle_rx(&buffer, now),
            Some(LinkEvent::Timeout(cause)) => {
                self.handle_timeout(cause);
                return None;
            }
            None => {}
        }

        self.run_state(now);
        None
    }

    fn run_state(&mut self, now: u64) {
        match self.state {
            EngineState::Startup => {
                if now - self.boot_ms >= STARTUP_DELAY_MS {
                    match self.load_pairing() {
                        Some(stored) => {
                            info!(
                                "loaded pairing: network {:#010x}, we are {:#04x}/{:#04x}, main unit {:#04x}/{:#04x}",
                                stored.network_id,
                                stored.my_device_type,
                                stored.my_device_id,
                                stored.main_unit_type,
                                stored.main_unit_id
                            );
                            if let Err(e) =
                                self.link.radio_mut().set_network_address(stored.network_id)
                            {
                                error!("failed to apply stored network address: {:?}", e);
                                return;
                            }
                            self.pairing = stored;
                            // Query right away rather than waiting a full interval
                            self.last_query_ms = 0;
                            self.state = EngineState::Idle;
                        }
                        None => {
                            info!("no stored pairing, starting discovery");
                            self.state = EngineState::StartDiscovery;
                        }
                    }
                }
            }
            EngineState::StartDiscovery => self.start_discovery(now),
            EngineState::Idle => {
                if self.pending.is_some() {
                    self.dispatch_pending(now);
                } else if now - self.last_query_ms > QUERY_INTERVAL_MS {
                    self.send_query(now);
                }
            }
            EngineState::WaitSetSpeedConfirm => {
                if self.link.is_idle() {
                    self.state = EngineState::Idle;
                }
            }
            // The remaining states advance on received frames or timeouts
            _ => {}
        }
    }

    /// Announce ourselves on the pairing address under a fresh device id.
    fn start_discovery(&mut self, now: u64) {
        let device_id = self.create_device_id();
        self.pairing = PairingConfig {
            network_id: 0,
            my_device_type: device_type::REMOTE_CONTROL,
            my_device_id: device_id,
            main_unit_type: 0,
            main_unit_id: 0,
        };

        if let Err(e) = self.link.radio_mut().set_network_address(NETWORK_LINK_ID) {
            error!("failed to set pairing address: {:?}", e);
            return;
        }

        info!("starting discovery with device id {:#04x}", device_id);
        let announce = Frame::new(
            0x04, // any unit listening for joiners
            0x00,
            device_type::REMOTE_CONTROL,
            device_id,
            FramePayload::JoinAck { network_id: NETWORK_LINK_ID },
        );
        if self.send(&announce, FAN_TX_RETRIES, now) {
            self.state = EngineState::DiscoveryWaitForLinkRequest;
        }
    }

    /// Random device id in 1..=254; 0x00 and 0xFF are reserved.
    ///
    /// TODO: 1-in-254 chance of colliding with the main unit's id; a ping
    /// before announcing would rule that out.
    fn create_device_id(&mut self) -> u8 {
        (self.rng.next_u32() % 254 + 1) as u8
    }

    fn handle_rx(&mut self, buffer: &[u8], now: u64) -> Option<EngineEvent> {
        let frame = match Frame::decode(buffer) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping undecodable frame: {:?}", e);
                return None;
            }
        };

        match self.state {
            EngineState::DiscoveryWaitForLinkRequest => {
                self.on_link_open(&frame, now);
                None
            }
            EngineState::DiscoveryWaitForJoinResponse => {
                self.on_link_ack(&frame, now);
                None
            }
            EngineState::DiscoveryJoinComplete => {
                self.on_network_confirm(&frame);
                None
            }
            EngineState::Startup | EngineState::StartDiscovery => {
                debug!(
                    "ignoring frame {:#04x} from {:#04x}/{:#04x} before discovery",
                    frame.command() as u8,
                    frame.tx_type,
                    frame.tx_id
                );
                None
            }
            _ => {
                // Steady state: only frames addressed to us are considered
                if frame.rx_type != self.pairing.my_device_type
                    || frame.rx_id != self.pairing.my_device_id
                {
                    debug!(
                        "frame for {:#04x}/{:#04x}, not us",
                        frame.rx_type, frame.rx_id
                    );
                    return None;
                }

                match self.state {
                    EngineState::WaitQueryResponse => self.on_query_response(&frame),
                    EngineState::WaitSetSpeedResponse => {
                        self.on_set_speed_response(&frame, now);
                        None
                    }
                    _ => {
                        debug!(
                            "unexpected frame {:#04x} from {:#04x}/{:#04x}",
                            frame.command() as u8,
                            frame.tx_type,
                            frame.tx_id
                        );
                        None
                    }
                }
            }
        }
    }

    /// Discovery step 2: a main unit opened its network for us.
    fn on_link_open(&mut self, frame: &Frame, now: u64) {
        let FramePayload::JoinOpen { network_id } = frame.payload else {
            debug!(
                "discovery: unexpected frame {:#04x} from {:#04x}/{:#04x}",
                frame.command() as u8,
                frame.tx_type,
                frame.tx_id
            );
            return;
        };

        info!(
            "discovery: found unit type {:#04x}{} id {:#04x} on network {:#010x}",
            frame.tx_type,
            if frame.tx_type == device_type::MAIN_UNIT { " (main)" } else { "" },
            frame.tx_id,
            network_id
        );

        self.pairing.main_unit_type = frame.tx_type;
        self.pairing.main_unit_id = frame.tx_id;
        self.pairing.network_id = network_id;

        // The announce no longer needs retrying; from here on we speak on
        // the adopted network address
        self.link.rf_complete();
        if let Err(e) = self.link.radio_mut().set_network_address(network_id) {
            error!("failed to adopt network address: {:?}", e);
            self.state = EngineState::StartDiscovery;
            return;
        }

        let request = Frame::new(
            device_type::MAIN_UNIT,
            frame.tx_id,
            self.pairing.my_device_type,
            self.pairing.my_device_id,
            FramePayload::JoinRequest { network_id },
        );
        if self.send(&request, FAN_TX_RETRIES, now) {
            self.state = EngineState::DiscoveryWaitForJoinResponse;
        } else {
            self.state = EngineState::StartDiscovery;
        }
    }

    /// Discovery step 4: the main unit acknowledged the join; confirm it.
    fn on_link_ack(&mut self, frame: &Frame, now: u64) {
        if frame.payload != FramePayload::Frame0B {
            error!(
                "discovery: unexpected frame {:#04x} from {:#04x}/{:#04x}",
                frame.command() as u8,
                frame.tx_type,
                frame.tx_id
            );
            return;
        }

        let identity_match = frame.rx_type == self.pairing.my_device_type
            && frame.rx_id == self.pairing.my_device_id
            && frame.tx_type == self.pairing.main_unit_type
            && frame.tx_id == self.pairing.main_unit_id;
        if !identity_match {
            error!(
                "discovery: link acknowledge from unexpected identity {:#04x}/{:#04x}",
                frame.tx_type, frame.tx_id
            );
            return;
        }

        info!(
            "discovery: linked to unit {:#04x} on network {:#010x}",
            frame.tx_id, self.pairing.network_id
        );

        self.link.rf_complete();
        let ack = Frame::new(
            self.pairing.main_unit_type,
            self.pairing.main_unit_id,
            self.pairing.my_device_type,
            self.pairing.my_device_id,
            FramePayload::Frame0B,
        );
        if self.send(&ack, FAN_TX_RETRIES, now) {
            self.state = EngineState::DiscoveryJoinComplete;
        } else {
            self.state = EngineState::StartDiscovery;
        }
    }

    /// Discovery step 5: the main unit queries its own network; the join is
    /// committed and the pairing becomes durable.
    fn on_network_confirm(&mut self, frame: &Frame) {
        if frame.payload != FramePayload::QueryNetwork {
            error!(
                "discovery: unexpected frame {:#04x} from {:#04x}/{:#04x}",
                frame.command() as u8,
                frame.tx_type,
                frame.tx_id
            );
            return;
        }

        // The commit marker is the main unit addressing itself
        let from_main_to_itself = frame.tx_type == self.pairing.main_unit_type
            && frame.tx_id == self.pairing.main_unit_id
            && frame.rx_type == self.pairing.main_unit_type
            && frame.rx_id == self.pairing.main_unit_id;
        if !from_main_to_itself {
            debug!(
                "discovery: network query from {:#04x}/{:#04x} to {:#04x}/{:#04x}, ignoring",
                frame.tx_type, frame.tx_id, frame.rx_type, frame.rx_id
            );
            return;
        }

        self.link.rf_complete();
        self.storage
            .save(PAIRING_PREFERENCE_KEY, &self.pairing.to_bytes());
        info!(
            "pairing complete: network {:#010x}, device id {:#04x}",
            self.pairing.network_id, self.pairing.my_device_id
        );

        self.last_query_ms = 0;
        self.state = EngineState::Idle;
    }

    fn on_query_response(&mut self, frame: &Frame) -> Option<EngineEvent> {
        let FramePayload::FanSettings { speed, voltage, timer } = frame.payload else {
            debug!(
                "unexpected query reply {:#04x} from {:#04x}/{:#04x}",
                frame.command() as u8,
                frame.tx_type,
                frame.tx_id
            );
            return None;
        };

        debug!(
            "fan settings: speed {:#04x} voltage {} timer {}",
            speed, voltage, timer
        );

        self.link.rf_complete();
        self.fan_on = speed > 0;
        self.fan_speed = speed;
        self.state = EngineState::Idle;

        Some(EngineEvent::StatePublished(FanState {
            state: self.fan_on,
            speed: self.fan_speed,
        }))
    }

    fn on_set_speed_response(&mut self, frame: &Frame, now: u64) {
        let FramePayload::FanSettings { speed, voltage, timer } = frame.payload else {
            debug!(
                "unexpected speed reply {:#04x} from {:#04x}/{:#04x}",
                frame.command() as u8,
                frame.tx_type,
                frame.tx_id
            );
            return;
        };

        debug!(
            "speed change acknowledged: speed {:#04x} voltage {} timer {}",
            speed, voltage, timer
        );

        self.link.rf_complete();
        let reply = Frame::new(
            self.pairing.main_unit_type,
            self.pairing.main_unit_id,
            self.pairing.my_device_type,
            self.pairing.my_device_id,
            FramePayload::SetSpeedReply,
        );
        // Fire and forget; the scheduler drains back to idle on its own
        self.send(&reply, -1, now);
        self.state = EngineState::WaitSetSpeedConfirm;
    }

    fn handle_timeout(&mut self, cause: LinkTimeout) {
        match cause {
            LinkTimeout::AirwayBusy => warn!("airway never cleared, giving up on transmission"),
            LinkTimeout::ReplyTimeout => debug!("no reply after all retries"),
        }

        match self.state {
            EngineState::DiscoveryWaitForLinkRequest
            | EngineState::DiscoveryWaitForJoinResponse
            | EngineState::DiscoveryJoinComplete => {
                info!("discovery timed out, restarting");
                self.state = EngineState::StartDiscovery;
            }
            EngineState::WaitQueryResponse
            | EngineState::WaitSetSpeedResponse
            | EngineState::WaitSetSpeedConfirm => {
                // Recover to idle; the next interval re-polls
                self.state = EngineState::Idle;
            }
            _ => {}
        }
    }

    fn dispatch_pending(&mut self, now: u64) {
        let Some(request) = self.pending.take() else {
            return;
        };

        let payload = if request.timer > 0 {
            FramePayload::SetTimer { speed: request.speed, timer: request.timer }
        } else {
            FramePayload::SetSpeed { speed: request.speed }
        };
        let frame = Frame::new(
            self.pairing.main_unit_type,
            self.pairing.main_unit_id,
            self.pairing.my_device_type,
            self.pairing.my_device_id,
            payload,
        );

        if self.send(&frame, FAN_TX_RETRIES, now) {
            self.state = EngineState::WaitSetSpeedResponse;
        } else {
            // Link still draining; try again next tick
            self.pending = Some(request);
        }
    }

    fn send_query(&mut self, now: u64) {
        let frame = Frame::new(
            self.pairing.main_unit_type,
            self.pairing.main_unit_id,
            self.pairing.my_device_type,
            self.pairing.my_device_id,
            FramePayload::QueryDevice,
        );

        if self.send(&frame, FAN_TX_RETRIES, now) {
            self.last_query_ms = now;
            self.state = EngineState::WaitQueryResponse;
        }
    }

    fn load_pairing(&mut self) -> Option<PairingConfig> {
        let mut buf = [0u8; PairingConfig::SIZE];
        let len = self.storage.load(PAIRING_PREFERENCE_KEY, &mut buf)?;
        if len != PairingConfig::SIZE {
            warn!("stored pairing record has unexpected size {}", len);
            return None;
        }
        let stored = PairingConfig::from_bytes(&buf);
        stored.is_valid().then_some(stored)
    }

    fn send(&mut self, frame: &Frame, rx_retries: i8, now: u64) -> bool {
        match self.link.transmit(&frame.encode(), rx_retries, now) {
            Ok(()) => true,
            Err(LinkError::Busy) => {
                warn!("transmit requested while the link is busy");
                false
            }
            Err(LinkError::Radio(e)) => {
                warn!("transmit failed: {:?}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::protocol::FAN_FRAMESIZE;
    use crate::link::LinkState;
    use crate::platform::mock::{MockClock, MockStorage};
    use crate::protocol::frame::{speed, FanCommand};
    use crate::radio::traits::mock::MockRadio;
    use rand_core::SeedableRng;
    use rand_wyrand::WyRand;

    const MAIN_ID: u8 = 0x1D;
    const NETWORK: u32 = 0x1234_5678;

    type TestEngine = RfEngine<MockRadio, MockClock, MockStorage, WyRand>;

    struct Fixture {
        engine: TestEngine,
        clock: MockClock,
        storage: MockStorage,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::new();
        let storage = MockStorage::new();
        let mut radio = MockRadio::new();
        radio.auto_tx_ready = true;

        let mut engine = RfEngine::new(
            radio,
            clock.clone(),
            storage.clone(),
            WyRand::seed_from_u64(0x5EED),
        );
        engine.setup().unwrap();

        Fixture { engine, clock, storage }
    }

    fn paired_record() -> PairingConfig {
        PairingConfig {
            network_id: NETWORK,
            my_device_type: device_type::REMOTE_CONTROL,
            my_device_id: 0x6B,
            main_unit_type: device_type::MAIN_UNIT,
            main_unit_id: MAIN_ID,
        }
    }

    /// Poll until the engine settles (drains mock events and idle actions).
    fn settle(engine: &mut TestEngine) -> Option<EngineEvent> {
        let mut event = None;
        for _ in 0..8 {
            event = engine.poll().or(event);
        }
        event
    }

    fn last_frame(engine: &TestEngine) -> Frame {
        let payload = engine
            .link
            .radio()
            .last_tx_payload()
            .expect("no frame was transmitted");
        Frame::decode(&payload[..FAN_FRAMESIZE]).unwrap()
    }

    fn tx_count(engine: &TestEngine) -> usize {
        engine.link.radio().tx_payloads.len()
    }

    #[test]
    fn test_no_rf_activity_during_startup_window() {
        let mut f = fixture();

        f.clock.set(14_999);
        settle(&mut f.engine);
        assert_eq!(f.engine.state(), EngineState::Startup);
        assert_eq!(tx_count(&f.engine), 0);
    }

    #[test]
    fn test_unpaired_boot_announces_on_pairing_address() {
        let mut f = fixture();

        f.clock.set(15_000);
        settle(&mut f.engine);
        assert_eq!(f.engine.state(), EngineState::DiscoveryWaitForLinkRequest);

        // Radio listens on the pairing address
        assert_eq!(f.engine.link.radio().addresses.last(), Some(&NETWORK_LINK_ID));

        let announce = last_frame(&f.engine);
        assert_eq!(announce.rx_type, 0x04);
        assert_eq!(announce.rx_id, 0x00);
        assert_eq!(announce.tx_type, device_type::REMOTE_CONTROL);
        assert!((1..=254).contains(&announce.tx_id));
        assert_eq!(announce.ttl, 250);
        assert_eq!(announce.command(), FanCommand::JoinAck);
        assert_eq!(announce.parameter_count, 4);
        assert_eq!(
            announce.payload,
            FramePayload::JoinAck { network_id: NETWORK_LINK_ID }
        );
    }

    #[test]
    fn test_discovery_handshake() {
        let mut f = fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);
        let our_id = f.engine.pairing().my_device_id;

        // Step 2: the main unit opens its network
        let open = Frame::new(
            0x04,
            0x00,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::JoinOpen { network_id: NETWORK },
        );
        f.engine.link.radio_mut().push_rx(&open.encode());
        settle(&mut f.engine);

        assert_eq!(f.engine.state(), EngineState::DiscoveryWaitForJoinResponse);
        // Both addresses now follow the adopted network id
        assert_eq!(f.engine.link.radio().addresses.last(), Some(&NETWORK));
        let request = last_frame(&f.engine);
        assert_eq!(request.command(), FanCommand::JoinRequest);
        assert_eq!(request.rx_type, device_type::MAIN_UNIT);
        assert_eq!(request.rx_id, MAIN_ID);
        assert_eq!(request.tx_id, our_id);
        assert_eq!(request.payload, FramePayload::JoinRequest { network_id: NETWORK });

        // Step 4: the main unit acknowledges the link
        let ack = Frame::new(
            device_type::REMOTE_CONTROL,
            our_id,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::Frame0B,
        );
        f.engine.link.radio_mut().push_rx(&ack.encode());
        settle(&mut f.engine);

        assert_eq!(f.engine.state(), EngineState::DiscoveryJoinComplete);
        let reply = last_frame(&f.engine);
        assert_eq!(reply.command(), FanCommand::Frame0B);
        assert_eq!(reply.rx_id, MAIN_ID);
        assert_eq!(reply.parameter_count, 0);

        // Step 5: the main unit queries its own network; the join commits
        let confirm = Frame::new(
            device_type::MAIN_UNIT,
            MAIN_ID,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::QueryNetwork,
        );
        f.engine.link.radio_mut().push_rx(&confirm.encode());
        f.engine.poll();

        assert_eq!(f.engine.state(), EngineState::Idle);
        let stored = f.storage.record(PAIRING_PREFERENCE_KEY).unwrap();
        let record = PairingConfig::from_bytes(&stored.try_into().unwrap());
        assert_eq!(
            record,
            PairingConfig {
                network_id: NETWORK,
                my_device_type: device_type::REMOTE_CONTROL,
                my_device_id: our_id,
                main_unit_type: device_type::MAIN_UNIT,
                main_unit_id: MAIN_ID,
            }
        );
    }

    #[test]
    fn test_discovery_ignores_foreign_link_ack() {
        let mut f = fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);
        let our_id = f.engine.pairing().my_device_id;

        let open = Frame::new(
            0x04,
            0x00,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::JoinOpen { network_id: NETWORK },
        );
        f.engine.link.radio_mut().push_rx(&open.encode());
        settle(&mut f.engine);

        // Link acknowledge from a different unit is ignored
        let foreign = Frame::new(
            device_type::REMOTE_CONTROL,
            our_id,
            device_type::MAIN_UNIT,
            0x2A,
            FramePayload::Frame0B,
        );
        f.engine.link.radio_mut().push_rx(&foreign.encode());
        settle(&mut f.engine);
        assert_eq!(f.engine.state(), EngineState::DiscoveryWaitForJoinResponse);
    }

    #[test]
    fn test_discovery_timeout_restarts_discovery() {
        let mut f = fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);
        assert_eq!(f.engine.state(), EngineState::DiscoveryWaitForLinkRequest);

        // Let every announce retry expire
        for _ in 0..30 {
            f.clock.advance(1100);
            f.engine.poll();
            f.engine.poll();
        }

        // The engine fell back and announced again under a fresh attempt
        assert!(tx_count(&f.engine) > 1);
        assert_eq!(f.engine.state(), EngineState::DiscoveryWaitForLinkRequest);
    }

    fn paired_fixture() -> Fixture {
        let f = fixture();
        f.storage
            .preload(PAIRING_PREFERENCE_KEY, &paired_record().to_bytes());
        f
    }

    #[test]
    fn test_paired_boot_queries_immediately() {
        let mut f = paired_fixture();

        f.clock.set(15_000);
        f.engine.poll(); // leaves startup
        assert_eq!(f.engine.state(), EngineState::Idle);
        assert_eq!(f.engine.link.radio().addresses.last(), Some(&NETWORK));

        f.engine.poll(); // dispatches the first query
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);

        let query = last_frame(&f.engine);
        assert_eq!(query.command(), FanCommand::QueryDevice);
        assert_eq!(query.rx_type, device_type::MAIN_UNIT);
        assert_eq!(query.rx_id, MAIN_ID);
        assert_eq!(query.tx_type, device_type::REMOTE_CONTROL);
        assert_eq!(query.parameter_count, 0);
    }

    #[test]
    fn test_invalid_stored_pairing_triggers_discovery() {
        let f = fixture();
        let mut void = paired_record();
        void.network_id = 0;
        f.storage.preload(PAIRING_PREFERENCE_KEY, &void.to_bytes());

        let mut f = f;
        f.clock.set(15_000);
        f.engine.poll();
        assert_eq!(f.engine.state(), EngineState::StartDiscovery);
    }

    #[test]
    fn test_query_response_publishes_fan_state() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);

        let settings = Frame::new(
            device_type::REMOTE_CONTROL,
            paired_record().my_device_id,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::FanSettings { speed: speed::MEDIUM, voltage: 5, timer: 0 },
        );
        f.engine.link.radio_mut().push_rx(&settings.encode());

        let event = f.engine.poll();
        assert_eq!(
            event,
            Some(EngineEvent::StatePublished(FanState { state: true, speed: 2 }))
        );
        assert_eq!(f.engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_query_repeats_after_interval() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);

        let settings = Frame::new(
            device_type::REMOTE_CONTROL,
            paired_record().my_device_id,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::FanSettings { speed: 0, voltage: 0, timer: 0 },
        );
        f.engine.link.radio_mut().push_rx(&settings.encode());
        f.engine.poll();
        let sends = tx_count(&f.engine);

        // Within the interval: no new query
        f.clock.advance(QUERY_INTERVAL_MS);
        settle(&mut f.engine);
        assert_eq!(tx_count(&f.engine), sends);

        f.clock.advance(1);
        settle(&mut f.engine);
        assert_eq!(tx_count(&f.engine), sends + 1);
        assert_eq!(last_frame(&f.engine).command(), FanCommand::QueryDevice);
    }

    #[test]
    fn test_frames_for_other_devices_are_dropped() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);

        // Same reply but addressed to another remote
        let misaddressed = Frame::new(
            device_type::REMOTE_CONTROL,
            0x42,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::FanSettings { speed: 1, voltage: 3, timer: 0 },
        );
        f.engine.link.radio_mut().push_rx(&misaddressed.encode());

        assert_eq!(f.engine.poll(), None);
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);
    }

    #[test]
    fn test_speed_change_full_flow() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        f.engine.poll();
        assert_eq!(f.engine.state(), EngineState::Idle);

        f.engine.control(Some(true), Some(speed::HIGH));
        assert_eq!(f.engine.state(), EngineState::WaitSetSpeedResponse);

        let request = last_frame(&f.engine);
        assert_eq!(request.command(), FanCommand::SetSpeed);
        assert_eq!(request.payload, FramePayload::SetSpeed { speed: 3 });

        // Fan acknowledges with its settings; we confirm fire-and-forget
        let settings = Frame::new(
            device_type::REMOTE_CONTROL,
            paired_record().my_device_id,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::FanSettings { speed: 3, voltage: 9, timer: 0 },
        );
        f.engine.link.radio_mut().push_rx(&settings.encode());
        f.engine.poll();
        assert_eq!(f.engine.state(), EngineState::WaitSetSpeedConfirm);

        let reply = last_frame(&f.engine);
        assert_eq!(reply.command(), FanCommand::SetSpeedReply);

        // Once the transmitter drains, the engine settles back to idle
        f.engine.poll(); // starts the fire-and-forget transmission
        f.engine.poll(); // TX drains, confirm state observes the idle link
        assert_eq!(f.engine.state(), EngineState::Idle);
        assert!(f.engine.link.is_idle());
    }

    #[test]
    fn test_speed_clamp_and_stash_while_busy() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);

        // Out-of-range request while busy is clamped and stashed
        f.engine.control(None, Some(9));
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);
        let sends = tx_count(&f.engine);

        // The query completes; the stashed change dispatches at idle entry
        let settings = Frame::new(
            device_type::REMOTE_CONTROL,
            paired_record().my_device_id,
            device_type::MAIN_UNIT,
            MAIN_ID,
            FramePayload::FanSettings { speed: 1, voltage: 3, timer: 0 },
        );
        f.engine.link.radio_mut().push_rx(&settings.encode());
        f.engine.poll();
        f.engine.poll();

        assert_eq!(f.engine.state(), EngineState::WaitSetSpeedResponse);
        assert_eq!(tx_count(&f.engine), sends + 1);
        assert_eq!(
            last_frame(&f.engine).payload,
            FramePayload::SetSpeed { speed: SPEED_COUNT }
        );
    }

    #[test]
    fn test_timed_speed_request_uses_timer_frame() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        f.engine.poll();
        assert_eq!(f.engine.state(), EngineState::Idle);

        f.engine.set_speed_timed(speed::MAX, 30);
        assert_eq!(f.engine.state(), EngineState::WaitSetSpeedResponse);
        assert_eq!(
            last_frame(&f.engine).payload,
            FramePayload::SetTimer { speed: 4, timer: 30 }
        );
        assert_eq!(last_frame(&f.engine).parameter_count, 2);
    }

    #[test]
    fn test_control_off_requests_speed_zero() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        f.engine.poll();

        f.engine.control(Some(false), None);
        assert_eq!(
            last_frame(&f.engine).payload,
            FramePayload::SetSpeed { speed: 0 }
        );
    }

    #[test]
    fn test_query_timeout_recovers_to_idle() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);
        let sends = tx_count(&f.engine);

        // Exhaust every scheduler retry without a reply
        let mut timed_out = false;
        for _ in 0..40 {
            f.clock.advance(1100);
            f.engine.poll();
            if f.engine.state() == EngineState::Idle {
                timed_out = true;
                break;
            }
        }
        assert!(timed_out);
        assert!(f.engine.link.is_idle());

        // Only retransmissions of the single loaded payload happened
        assert_eq!(tx_count(&f.engine), sends);

        // The overdue interval triggers the next query straight away
        f.engine.poll();
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);
        assert_eq!(tx_count(&f.engine), sends + 1);
    }

    #[test]
    fn test_traits() {
        let f = fixture();
        assert_eq!(
            f.engine.traits(),
            FanTraits { oscillation: false, speed: true, direction: false, speed_count: 4 }
        );
    }

    #[test]
    fn test_scheduler_state_visible_through_engine() {
        let mut f = paired_fixture();
        f.clock.set(15_000);
        settle(&mut f.engine);

        // While a query is in flight the link is not idle
        assert_eq!(f.engine.state(), EngineState::WaitQueryResponse);
        assert_ne!(f.engine.link.state(), LinkState::Idle);
    }
}
