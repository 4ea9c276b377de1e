pub mod driver;
pub mod registers;
pub mod traits;

pub use driver::Nrf905;
pub use registers::RadioConfig;
pub use traits::{Mode, Radio, RadioError, RadioEvent, RX_BUFFER_SIZE};
