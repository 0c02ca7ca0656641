#![doc = include_str!("../README.md")]

use biometrics::Collector;

mod cache;
mod server;

pub use cache::ExtentCache;
pub use server::ExtentServer;

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    cache::register_biometrics(collector);
    server::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

////////////////////////////////////////////// clock ///////////////////////////////////////////////

/// Seconds since the epoch, the granularity extent attributes carry.
pub(crate) fn time_since_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
