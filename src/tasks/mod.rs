//! Embassy glue for the protocol engine
//!
//! Drives [`RfEngine::poll`] from an async task and fans published fan
//! states out over a channel for the integration layer to consume.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_time::{Instant, Timer};
use log::warn;
use rand_core::RngCore;

use crate::engine::{EngineEvent, FanState, RfEngine};
use crate::platform::{Clock, Storage};
use crate::radio::Radio;

/// Poll cadence of the radio status lines
const POLL_INTERVAL_MS: u64 = 10;

/// Channel capacity for published fan states
const STATE_CHANNEL_SIZE: usize = 4;

/// Fan states published by the engine task
///
/// Single producer (the engine task), single consumer (the integration
/// layer).
pub static STATE_CHANNEL: Channel<CriticalSectionRawMutex, FanState, STATE_CHANNEL_SIZE> =
    Channel::new();

/// Type alias for the fan state receiver
pub type StateReceiver =
    Receiver<'static, CriticalSectionRawMutex, FanState, STATE_CHANNEL_SIZE>;

/// Type alias for the fan state sender
pub type StateSender = Sender<'static, CriticalSectionRawMutex, FanState, STATE_CHANNEL_SIZE>;

/// Millisecond clock backed by the embassy monotonic timer
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}

/// Task that owns the engine and drives the poll loop.
///
/// Published fan states are forwarded to [`STATE_CHANNEL`]; a full channel
/// drops the update (the next query refreshes it).
pub async fn engine_task<R, C, S, G>(mut engine: RfEngine<R, C, S, G>)
where
    R: Radio,
    C: Clock,
    S: Storage,
    G: RngCore,
{
    while let Err(e) = engine.setup() {
        warn!("radio setup failed, retrying: {:?}", e);
        Timer::after_millis(1000).await;
    }

    loop {
        if let Some(EngineEvent::StatePublished(state)) = engine.poll() {
            if STATE_CHANNEL.try_send(state).is_err() {
                warn!("state channel full, dropping fan update");
            }
        }
        Timer::after_millis(POLL_INTERVAL_MS).await;
    }
}
