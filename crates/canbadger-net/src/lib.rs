pub mod device;
pub mod dispatcher;
pub mod manager;
pub mod message;
pub mod transfer;

pub use device::Device;
pub use dispatcher::Dispatcher;
pub use manager::EthernetManager;
pub use message::{ActionKind, ControlError, Message, MessageKind};

/// Version number carried in the discovery beacon
pub const FIRMWARE_VERSION: u32 = 2;

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
