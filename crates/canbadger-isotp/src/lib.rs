pub mod link;

pub use link::{Addressing, FilterMode, IsoTpConfig, IsoTpLink, TransportError};

/// Largest payload a first frame's 12-bit length field can announce
pub const MAX_MESSAGE_LEN: usize = 4095;

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
