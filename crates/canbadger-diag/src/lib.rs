pub mod kwp;
pub mod nrc;
pub mod session;
pub mod tp20;
pub mod uds;

pub use kwp::KwpClient;
pub use session::TesterPresent;
pub use tp20::{KwpTp20Client, Tp20Channel, Tp20Error, Tp20State};
pub use uds::UdsClient;

use canbadger_isotp::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum DiagError {
    /// The ECU answered `7F <sid> <nrc>`
    #[error("negative response to SID {sid:#04X}: {nrc:#04X}")]
    Negative { sid: u8, nrc: u8 },
    /// The periodic TesterPresent went unanswered
    #[error("diagnostic session lost")]
    SessionLost,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Tp20(#[from] tp20::Tp20Error),
}

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
