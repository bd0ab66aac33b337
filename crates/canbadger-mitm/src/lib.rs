pub mod engine;
pub mod rule;
pub mod store;

pub use engine::{Mitm, MitmStats};
pub use rule::{ActionOutcome, Rule, parse_rules};
pub use store::RuleStore;

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
