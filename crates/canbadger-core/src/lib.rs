pub mod bus;
pub mod frame;
pub mod record;
pub mod ring;
pub mod sd;
pub mod stdio;
pub mod storage;

pub use bus::{BusError, CanBus, SimBus, bus_pair};
pub use frame::{CanFrame, FrameFormat, FrameKind};
pub use record::{LogRecord, RecordError};
pub use ring::FrameRing;
pub use sd::SdCard;
pub use storage::{Eeprom, MemEeprom, MemStorage, Storage, StorageError};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
