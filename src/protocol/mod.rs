pub mod frame;

pub use frame::{FanCommand, Frame, FrameError, FramePayload};
