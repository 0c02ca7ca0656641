//! The client side of busywire: a pool of wires to one remote, multiplexed behind the
//! [rpc_pb::Client] trait.  A call owns one wire for its full request/response exchange, so
//! responses never interleave.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use indicio::{clue, DEBUG};
use zerror_core::ErrorCore;

use rpc_pb::{Context, Request, Response, Status};

use super::{ClientOptions, Connector, Wire, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static REQUESTS: Counter = Counter::new("busywire.client.requests");
static NEW_WIRE: Counter = Counter::new("busywire.client.wire.new");
static KILL_WIRE: Counter = Counter::new("busywire.client.wire.kill");
static TRANSPORT_ERRORS: Counter = Counter::new("busywire.client.transport_errors");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&REQUESTS);
    collector.register_counter(&NEW_WIRE);
    collector.register_counter(&KILL_WIRE);
    collector.register_counter(&TRANSPORT_ERRORS);
}

////////////////////////////////////////////// Client //////////////////////////////////////////////

struct Pool {
    wires: Vec<Arc<Mutex<Box<dyn Wire>>>>,
    round_robin: usize,
}

/// A client to a single remote address.
pub struct Client {
    target: String,
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    pool: Mutex<Pool>,
    seq_no: AtomicU64,
}

impl Client {
    /// Create a client for `target`.  Wires are established lazily on first call.
    pub fn new(target: String, options: ClientOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            target,
            options,
            connector,
            pool: Mutex::new(Pool {
                wires: Vec::new(),
                round_robin: 0,
            }),
            seq_no: AtomicU64::new(1),
        }
    }

    /// The address this client dials.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn get_wire(&self) -> Result<Arc<Mutex<Box<dyn Wire>>>, rpc_pb::Error> {
        let mut pool = self.pool.lock().unwrap();
        if pool.wires.len() < std::cmp::max(self.options.channels, 1) {
            NEW_WIRE.click();
            let wire = self.connector.connect(&self.target, &self.options)?;
            let wire = Arc::new(Mutex::new(wire));
            pool.wires.push(Arc::clone(&wire));
            Ok(wire)
        } else {
            pool.round_robin = (pool.round_robin + 1) % pool.wires.len();
            Ok(Arc::clone(&pool.wires[pool.round_robin]))
        }
    }

    fn kill_wire(&self, wire: &Arc<Mutex<Box<dyn Wire>>>) {
        KILL_WIRE.click();
        let mut pool = self.pool.lock().unwrap();
        pool.wires.retain(|w| !Arc::ptr_eq(w, wire));
    }

    fn transport_failure(&self, wire: &Arc<Mutex<Box<dyn Wire>>>, err: rpc_pb::Error) -> rpc_pb::Error {
        TRANSPORT_ERRORS.click();
        self.kill_wire(wire);
        clue!(COLLECTOR, DEBUG, {
            transport_failure: {
                target: self.target.clone(),
                what: err.to_string(),
            },
        });
        err
    }
}

impl rpc_pb::Client for Client {
    fn call(&self, ctx: &Context, service: &str, method: &str, body: &[u8]) -> Status {
        if body.len() > rpc_pb::MAX_REQUEST_SIZE {
            return Err(rpc_pb::Error::RequestTooLarge {
                core: ErrorCore::default(),
                size: body.len() as u64,
            });
        }
        REQUESTS.click();
        let seq_no = self.seq_no.fetch_add(1, Ordering::Relaxed);
        let req = Request {
            service,
            method,
            seq_no,
            body,
            caller: ctx.clients(),
            trace: ctx.trace_id(),
        };
        let req_buf = stack_pack(req).to_vec();
        let wire = self.get_wire()?;
        let resp_buf = {
            let mut guard = wire.lock().unwrap();
            if let Err(err) = guard.send(&req_buf) {
                drop(guard);
                return Err(self.transport_failure(&wire, err));
            }
            match guard.recv() {
                Ok(resp_buf) => resp_buf,
                Err(err) => {
                    drop(guard);
                    return Err(self.transport_failure(&wire, err));
                }
            }
        };
        let (resp, _) = Response::unpack(&resp_buf)?;
        if resp.seq_no != seq_no {
            let err = rpc_pb::Error::TransportFailure {
                core: ErrorCore::default(),
                what: format!("response seq_no {} does not match {}", resp.seq_no, seq_no),
            };
            return Err(self.transport_failure(&wire, err));
        }
        if let Some(rpc_error) = resp.rpc_error {
            let (err, _) = <rpc_pb::Error as Unpackable>::unpack(rpc_error)?;
            Err(err)
        } else if let Some(service_error) = resp.service_error {
            Ok(Err(service_error.to_vec()))
        } else if let Some(body) = resp.body {
            Ok(Ok(body.to_vec()))
        } else {
            Err(rpc_pb::Error::TransportFailure {
                core: ErrorCore::default(),
                what: "response carried no body and no error".to_string(),
            })
        }
    }
}
