//! RF link scheduler
//!
//! Wraps the radio in an atomic "send this frame, then await a reply"
//! primitive. A transmission waits for a free airway (carrier sense), loads
//! the payload once and retransmits it on reply timeout until the retry
//! budget is spent. The engine confirms a received reply with
//! [`RfScheduler::rf_complete`], which is also the only cancel primitive.

use heapless::Vec;
use log::{debug, warn};

use crate::config::protocol::{AIRWAY_WAIT_CEILING_MS, FAN_FRAMESIZE, FAN_REPLY_TIMEOUT_MS};
use crate::radio::{Mode, Radio, RadioError, RadioEvent, RX_BUFFER_SIZE};

/// Scheduler states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No transmission in flight
    Idle,
    /// Payload loaded, waiting for the airway to clear
    WaitAirwayFree,
    /// Radio is transmitting
    TxBusy,
    /// Transmitted, waiting for the engine to confirm a reply
    RxWait,
}

/// Errors starting a transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// A transmission is already in flight
    Busy,
    /// The radio rejected the payload or transmit request
    Radio(RadioError),
}

/// Why a transmission was given up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTimeout {
    /// The airway never cleared within the carrier-sense ceiling
    AirwayBusy,
    /// All retries went unanswered
    ReplyTimeout,
}

/// Events reported by [`RfScheduler::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A frame arrived; carries the radio's full RX buffer
    Received(Vec<u8, RX_BUFFER_SIZE>),
    /// The current transmission was abandoned
    Timeout(LinkTimeout),
}

/// Carrier-sensing transmit scheduler with reply timeout and retry.
pub struct RfScheduler<R: Radio> {
    radio: R,
    state: LinkState,
    rx_retries: i8,
    retries_left: i8,
    wait_start_ms: u64,
    send_time_ms: u64,
}

impl<R: Radio> RfScheduler<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            state: LinkState::Idle,
            rx_retries: -1,
            retries_left: 0,
            wait_start_ms: 0,
            send_time_ms: 0,
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == LinkState::Idle
    }

    /// Start a transmission.
    ///
    /// The frame is loaded into the TX payload register once and reused
    /// across retries. `rx_retries < 0` means fire and forget: the scheduler
    /// returns to idle as soon as the frame is on the air. With
    /// `rx_retries >= 0` the engine is expected to confirm the reply via
    /// [`rf_complete`](Self::rf_complete); without confirmation the frame is
    /// retransmitted up to `rx_retries` times before a
    /// [`LinkTimeout::ReplyTimeout`] is reported.
    ///
    /// Returns [`LinkError::Busy`], with no effect, while not idle.
    pub fn transmit(
        &mut self,
        frame: &[u8; FAN_FRAMESIZE],
        rx_retries: i8,
        now_ms: u64,
    ) -> Result<(), LinkError> {
        if self.state != LinkState::Idle {
            return Err(LinkError::Busy);
        }

        self.radio.write_tx_payload(frame).map_err(LinkError::Radio)?;

        self.rx_retries = rx_retries;
        self.retries_left = rx_retries.max(0);
        self.wait_start_ms = now_ms;
        self.state = LinkState::WaitAirwayFree;
        Ok(())
    }

    /// Confirm that the expected reply arrived, cancelling any pending retry.
    pub fn rf_complete(&mut self) {
        if self.state != LinkState::Idle {
            debug!("transmission complete");
        }
        self.state = LinkState::Idle;
    }

    /// Advance the scheduler. At most one state transition per call.
    pub fn poll(&mut self, now_ms: u64) -> Option<LinkEvent> {
        match self.radio.poll() {
            Ok(Some(RadioEvent::RxComplete(buffer))) => {
                return Some(LinkEvent::Received(buffer));
            }
            Ok(Some(RadioEvent::TxReady)) => {
                if self.state == LinkState::TxBusy {
                    if self.rx_retries < 0 {
                        // Fire and forget: nothing to wait for
                        self.state = LinkState::Idle;
                    } else {
                        self.send_time_ms = now_ms;
                        self.state = LinkState::RxWait;
                    }
                }
                return None;
            }
            Ok(Some(RadioEvent::RxInvalid)) => {
                debug!("dropping frame with bad checksum");
                return None;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("radio poll failed: {:?}", e);
                return None;
            }
        }

        match self.state {
            LinkState::WaitAirwayFree => {
                if !self.radio.airway_busy() {
                    debug!("start TX");
                    match self.radio.start_tx(Mode::Receive) {
                        Ok(()) => self.state = LinkState::TxBusy,
                        Err(e) => warn!("start TX failed: {:?}", e),
                    }
                } else if now_ms - self.wait_start_ms > AIRWAY_WAIT_CEILING_MS {
                    warn!("airway still busy after {} ms", AIRWAY_WAIT_CEILING_MS);
                    self.state = LinkState::Idle;
                    return Some(LinkEvent::Timeout(LinkTimeout::AirwayBusy));
                }
            }
            LinkState::RxWait => {
                if now_ms - self.send_time_ms > FAN_REPLY_TIMEOUT_MS {
                    if self.retries_left > 0 {
                        self.retries_left -= 1;
                        debug!("no reply, retrying ({} left)", self.retries_left);
                        self.wait_start_ms = now_ms;
                        self.state = LinkState::WaitAirwayFree;
                    } else {
                        debug!("no reply, retries exhausted");
                        self.state = LinkState::Idle;
                        return Some(LinkEvent::Timeout(LinkTimeout::ReplyTimeout));
                    }
                }
            }
            LinkState::Idle | LinkState::TxBusy => {}
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::traits::mock::MockRadio;

    const FRAME: [u8; FAN_FRAMESIZE] = [
        0x01, 0x1D, 0x03, 0x6B, 0xFA, 0x10, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ];

    fn scheduler() -> RfScheduler<MockRadio> {
        RfScheduler::new(MockRadio::new())
    }

    #[test]
    fn test_transmit_loads_payload_and_waits_for_airway() {
        let mut link = scheduler();

        link.transmit(&FRAME, 0, 0).unwrap();
        assert_eq!(link.state(), LinkState::WaitAirwayFree);
        assert_eq!(link.radio().last_tx_payload(), Some(&FRAME[..]));

        // Airway free: next poll starts the transmission towards receive mode
        assert_eq!(link.poll(1), None);
        assert_eq!(link.state(), LinkState::TxBusy);
        assert_eq!(link.radio().start_tx_calls, vec![Mode::Receive]);
    }

    #[test]
    fn test_transmit_while_busy_is_rejected() {
        let mut link = scheduler();

        link.transmit(&FRAME, 0, 0).unwrap();

        // Every non-idle state refuses a second transmission
        assert_eq!(link.transmit(&FRAME, 0, 1), Err(LinkError::Busy));
        link.poll(1);
        assert_eq!(link.state(), LinkState::TxBusy);
        assert_eq!(link.transmit(&FRAME, 0, 2), Err(LinkError::Busy));

        link.radio_mut().push_event(RadioEvent::TxReady);
        link.poll(2);
        assert_eq!(link.state(), LinkState::RxWait);
        assert_eq!(link.transmit(&FRAME, 0, 3), Err(LinkError::Busy));

        // Only one payload ever reached the radio
        assert_eq!(link.radio().tx_payloads.len(), 1);
    }

    #[test]
    fn test_fire_and_forget_returns_to_idle_on_tx_ready() {
        let mut link = scheduler();
        link.radio_mut().auto_tx_ready = true;

        link.transmit(&FRAME, -1, 0).unwrap();
        link.poll(1);
        assert_eq!(link.state(), LinkState::TxBusy);
        link.poll(2);
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn test_retry_schedule_and_timeout() {
        let mut link = scheduler();
        link.radio_mut().auto_tx_ready = true;

        link.transmit(&FRAME, 3, 0).unwrap();

        let mut start_times = std::vec::Vec::new();
        let mut timeouts = std::vec::Vec::new();
        for now in 0..=5000u64 {
            let sends_before = link.radio().start_tx_calls.len();
            if let Some(LinkEvent::Timeout(cause)) = link.poll(now) {
                timeouts.push((now, cause));
            }
            if link.radio().start_tx_calls.len() > sends_before {
                start_times.push(now);
            }
        }

        // Four transmissions roughly a second apart, then one timeout
        assert_eq!(start_times.len(), 4);
        assert_eq!(start_times[0], 0);
        for (i, time) in start_times.iter().enumerate().skip(1) {
            let expected = i as u64 * (FAN_REPLY_TIMEOUT_MS + 2);
            assert!(
                time.abs_diff(expected) <= 8,
                "send {} at {} ms, expected about {} ms",
                i,
                time,
                expected
            );
        }
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].1, LinkTimeout::ReplyTimeout);
        assert_eq!(link.state(), LinkState::Idle);

        // The payload was loaded exactly once for all four transmissions
        assert_eq!(link.radio().tx_payloads.len(), 1);
    }

    #[test]
    fn test_zero_retries_times_out_after_single_send() {
        let mut link = scheduler();
        link.radio_mut().auto_tx_ready = true;

        link.transmit(&FRAME, 0, 0).unwrap();
        link.poll(0); // starts TX
        link.poll(0); // TX ready, enters RxWait
        assert_eq!(link.state(), LinkState::RxWait);

        assert_eq!(link.poll(1000), None);
        assert_eq!(
            link.poll(1001),
            Some(LinkEvent::Timeout(LinkTimeout::ReplyTimeout))
        );
        assert_eq!(link.radio().start_tx_calls.len(), 1);
    }

    #[test]
    fn test_rf_complete_cancels_retry_countdown() {
        let mut link = scheduler();
        link.radio_mut().auto_tx_ready = true;

        link.transmit(&FRAME, 3, 0).unwrap();
        link.poll(0);
        link.poll(0);
        assert_eq!(link.state(), LinkState::RxWait);

        link.rf_complete();
        assert_eq!(link.state(), LinkState::Idle);

        // No further retransmissions happen
        assert_eq!(link.poll(5000), None);
        assert_eq!(link.radio().start_tx_calls.len(), 1);
    }

    #[test]
    fn test_airway_busy_gives_up_after_ceiling() {
        let mut link = scheduler();
        link.radio_mut().airway_busy = true;

        link.transmit(&FRAME, 0, 0).unwrap();

        assert_eq!(link.poll(5000), None);
        assert_eq!(
            link.poll(5001),
            Some(LinkEvent::Timeout(LinkTimeout::AirwayBusy))
        );
        assert_eq!(link.state(), LinkState::Idle);
        assert!(link.radio().start_tx_calls.is_empty());
    }

    #[test]
    fn test_airway_clearing_releases_transmission() {
        let mut link = scheduler();
        link.radio_mut().airway_busy = true;

        link.transmit(&FRAME, 0, 0).unwrap();
        assert_eq!(link.poll(100), None);
        assert_eq!(link.state(), LinkState::WaitAirwayFree);

        link.radio_mut().airway_busy = false;
        assert_eq!(link.poll(200), None);
        assert_eq!(link.state(), LinkState::TxBusy);
    }

    #[test]
    fn test_received_frames_pass_through() {
        let mut link = scheduler();
        link.radio_mut().push_rx(&FRAME);

        match link.poll(0) {
            Some(LinkEvent::Received(buffer)) => {
                assert_eq!(&buffer[..FAN_FRAMESIZE], &FRAME);
            }
            other => panic!("expected a received frame, got {:?}", other),
        }
    }
}
