#![doc = include_str!("../README.md")]

use biometrics::Collector;

mod client;
mod fifo;
mod server;
mod uniqueue;

pub use client::{LockClient, Releaser};
pub use fifo::Fifo;
pub use server::{AlwaysPrimary, CallbackGate, LockServer};
pub use uniqueue::UniQueue;

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    server::register_biometrics(collector);
    client::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();
