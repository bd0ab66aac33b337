pub mod bridge;
pub mod fsm;
pub mod hammer;

pub use bridge::SecurityHijack;
pub use fsm::{HijackFsm, HijackOutcome, HijackProtocol, Observation, Tp20Matcher, UdsMatcher};
pub use hammer::{Hammer, HammerConfig, HammerOutcome, HammerVerdict, seeds_to_csv};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
