//! The server side of busywire: a listener that spawns one thread per connection and dispatches
//! framed requests to a registry of [rpc_pb::Server] implementations.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use indicio::{clue, DEBUG, ERROR};
use zerror_core::ErrorCore;

use rpc_pb::{Context, Request, Response, Status};

use super::channel::Channel;
use super::{Wire, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ACCEPT: Counter = Counter::new("busywire.server.accept");
static ACCEPT_ERROR: Counter = Counter::new("busywire.server.accept.error");
static HANDLE_RPC: Counter = Counter::new("busywire.server.handle_rpc");
static UNKNOWN_SERVER_NAME: Counter = Counter::new("busywire.server.unknown_server_name");
static CONNECTION_DROPPED: Counter = Counter::new("busywire.server.connection_dropped");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ACCEPT);
    collector.register_counter(&ACCEPT_ERROR);
    collector.register_counter(&HANDLE_RPC);
    collector.register_counter(&UNKNOWN_SERVER_NAME);
    collector.register_counter(&CONNECTION_DROPPED);
}

/////////////////////////////////////////// ServerOptions //////////////////////////////////////////

/// Options for binding a server.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct ServerOptions {
    /// The host:port to bind to.  Port zero picks an ephemeral port.
    #[cfg_attr(feature = "command_line", arrrg(optional, "host:port to bind to."))]
    pub bind_to: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_to: "127.0.0.1:0".to_string(),
        }
    }
}

impl ServerOptions {
    /// Set the bind address.
    pub fn with_bind_to(mut self, bind_to: &str) -> Self {
        bind_to.clone_into(&mut self.bind_to);
        self
    }
}

/////////////////////////////////////////// ServiceRegistry ////////////////////////////////////////

/// ServiceRegistry maps servers by service name.
pub struct ServiceRegistry {
    services: HashMap<&'static str, Box<dyn rpc_pb::Server + Send + Sync + 'static>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Register the server under `service`.  Registering the same name twice is a logic error.
    pub fn register<S: rpc_pb::Server + Send + Sync + 'static>(
        &mut self,
        service: &'static str,
        server: S,
    ) {
        if self.services.contains_key(service) {
            panic!("cannot add the same service twice");
        }
        self.services.insert(service, Box::new(server));
    }

    fn get_server(&self, service: &str) -> Option<&(dyn rpc_pb::Server + Send + Sync + 'static)> {
        self.services.get(service).map(|s| s.as_ref())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////// dispatch ////////////////////////////////////////////

/// Unpack one request, dispatch it against the registry, and pack the response.  Shared between
/// the TCP server loop and the in-process mesh.
pub fn dispatch(services: &ServiceRegistry, req_buf: &[u8]) -> Result<Vec<u8>, rpc_pb::Error> {
    HANDLE_RPC.click();
    let (req, _) = Request::unpack(req_buf)?;
    let ctx = Context::from(&req);
    let status: Status = match services.get_server(req.service) {
        Some(server) => server.call(&ctx, req.method, req.body),
        None => {
            UNKNOWN_SERVER_NAME.click();
            Err(rpc_pb::Error::UnknownServerName {
                core: ErrorCore::default(),
                name: req.service.to_string(),
            })
        }
    };
    let err_buf: Vec<u8>;
    let (body, service_error, rpc_error) = match &status {
        Ok(Ok(body)) => {
            let body: &[u8] = body;
            (Some(body), None, None)
        }
        Ok(Err(err)) => {
            let err: &[u8] = err;
            (None, Some(err), None)
        }
        Err(err) => {
            err_buf = stack_pack(err).to_vec();
            let err_buf: &[u8] = &err_buf;
            (None, None, Some(err_buf))
        }
    };
    let resp = Response {
        seq_no: req.seq_no,
        trace: req.trace,
        body,
        service_error,
        rpc_error,
    };
    Ok(stack_pack(resp).to_vec())
}

////////////////////////////////////////////// Server //////////////////////////////////////////////

/// An RPC server hosting the services of one registry on one listener.
pub struct Server {
    listener: TcpListener,
    services: Arc<ServiceRegistry>,
}

impl Server {
    /// Bind the listener.  Serving starts with [Server::serve].
    pub fn new(options: ServerOptions, services: ServiceRegistry) -> Result<Server, rpc_pb::Error> {
        let listener = TcpListener::bind(&options.bind_to)?;
        Ok(Self::from_listener(listener, services))
    }

    /// Adopt an already-bound listener.
    pub fn from_listener(listener: TcpListener, services: ServiceRegistry) -> Server {
        Server {
            listener,
            services: Arc::new(services),
        }
    }

    /// The port the listener bound to.
    pub fn port(&self) -> Result<u16, rpc_pb::Error> {
        Ok(self.listener.local_addr()?.port())
    }

    /// The host:port the listener bound to.
    pub fn local_addr(&self) -> Result<String, rpc_pb::Error> {
        Ok(self.listener.local_addr()?.to_string())
    }

    /// Accept and serve connections forever.  Each connection gets its own thread; a connection
    /// thread exits when its peer disconnects.
    pub fn serve(&self) -> Result<(), rpc_pb::Error> {
        loop {
            let (stream, _) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    ACCEPT_ERROR.click();
                    clue!(COLLECTOR, ERROR, {
                        accept_error: err.to_string(),
                    });
                    continue;
                }
            };
            ACCEPT.click();
            let services = Arc::clone(&self.services);
            std::thread::spawn(move || {
                if let Err(err) = Self::serve_connection(stream, services) {
                    CONNECTION_DROPPED.click();
                    clue!(COLLECTOR, DEBUG, {
                        connection_dropped: err.to_string(),
                    });
                }
            });
        }
    }

    fn serve_connection(
        stream: TcpStream,
        services: Arc<ServiceRegistry>,
    ) -> Result<(), rpc_pb::Error> {
        let mut chan = Channel::from_stream(stream)?;
        loop {
            let req_buf = chan.recv()?;
            let resp_buf = dispatch(&services, &req_buf)?;
            chan.send(&resp_buf)?;
        }
    }
}
