#![doc = include_str!("../README.md")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};

mod channel;
mod client;
mod mesh;
mod server;

pub use channel::{frame_message, read_framed, Channel};
pub use client::Client;
pub use mesh::Mesh;
pub use server::{dispatch, Server, ServerOptions, ServiceRegistry};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static HANDLE_NEW: Counter = Counter::new("busywire.handles.new");
static HANDLE_EVICT: Counter = Counter::new("busywire.handles.evict");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&HANDLE_NEW);
    collector.register_counter(&HANDLE_EVICT);
    channel::register_biometrics(collector);
    client::register_biometrics(collector);
    server::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////// ClientOptions //////////////////////////////////////////

/// Options for establishing client channels.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct ClientOptions {
    /// The number of channels to establish per remote.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Number of channels to establish per remote.")
    )]
    pub channels: usize,
    /// Connect timeout, in milliseconds.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Connect timeout in milliseconds.")
    )]
    pub connect_timeout_ms: u64,
    /// Per-call timeout, in milliseconds.  Zero waits forever.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Per-call timeout in milliseconds (0 waits forever).")
    )]
    pub call_timeout_ms: u64,
}

impl ClientOptions {
    /// Set the number of channels.
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = std::cmp::max(channels, 1);
        self
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout_ms(mut self, call_timeout_ms: u64) -> Self {
        self.call_timeout_ms = call_timeout_ms;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            channels: 2,
            connect_timeout_ms: 1_000,
            call_timeout_ms: 0,
        }
    }
}

/////////////////////////////////////////////// Wire ///////////////////////////////////////////////

/// One established message stream to a remote.  Callers serialize on a wire: a request is sent
/// and its response received before the next request goes out.
pub trait Wire: Send {
    /// Send one framed message.
    fn send(&mut self, body: &[u8]) -> Result<(), rpc_pb::Error>;
    /// Receive one framed message.
    fn recv(&mut self) -> Result<Vec<u8>, rpc_pb::Error>;
}

///////////////////////////////////////////// Connector ////////////////////////////////////////////

/// Establish wires to remote endpoints.  The TCP connector dials `host:port`; the [Mesh]
/// connector routes to in-process registries.
pub trait Connector: Send + Sync + 'static {
    /// Establish a wire to `target`.
    fn connect(&self, target: &str, options: &ClientOptions)
        -> Result<Box<dyn Wire>, rpc_pb::Error>;
}

/// The default connector dials plaintext TCP.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        target: &str,
        options: &ClientOptions,
    ) -> Result<Box<dyn Wire>, rpc_pb::Error> {
        Ok(Box::new(Channel::connect(target, options)?))
    }
}

////////////////////////////////////////////// Handles /////////////////////////////////////////////

/// A cache of one [Client] per remote address.  Handles are created on first use and evicted
/// explicitly when a call observes a transport failure, so the next call rebinds.
pub struct Handles {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    handles: Mutex<HashMap<String, Arc<Client>>>,
}

impl Handles {
    /// Create a new handle cache over the provided connector.
    pub fn new(options: ClientOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            options,
            connector,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Get-or-create the client for `target`.
    pub fn handle(&self, target: &str) -> Arc<Client> {
        let mut handles = self.handles.lock().unwrap();
        if let Some(client) = handles.get(target) {
            return Arc::clone(client);
        }
        HANDLE_NEW.click();
        let client = Arc::new(Client::new(
            target.to_string(),
            self.options.clone(),
            Arc::clone(&self.connector),
        ));
        handles.insert(target.to_string(), Arc::clone(&client));
        client
    }

    /// Drop the cached client for `target`.
    pub fn evict(&self, target: &str) {
        HANDLE_EVICT.click();
        self.handles.lock().unwrap().remove(target);
    }
}

//////////////////////////////////////////// transport_error ///////////////////////////////////////

/// True iff the error indicates the underlying transport is unusable and the handle should be
/// evicted.
pub fn is_transport_error(err: &rpc_pb::Error) -> bool {
    matches!(
        err,
        rpc_pb::Error::TransportFailure { .. } | rpc_pb::Error::OsError { .. }
    )
}
