//! An in-process connector.  A [Mesh] maps addresses to service registries inside one process so
//! tests can run an entire cluster of endpoints deterministically.  Endpoints can be marked down
//! to simulate an unreachable node; wires to a down endpoint fail with a transport error the way
//! a refused TCP connection would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use zerror_core::ErrorCore;

use super::server::{dispatch, ServiceRegistry};
use super::{ClientOptions, Connector, Wire};

/////////////////////////////////////////////// Mesh ///////////////////////////////////////////////

#[derive(Default)]
struct MeshInner {
    registries: HashMap<String, Arc<ServiceRegistry>>,
    down: HashSet<String>,
}

/// A cheaply-clonable handle to an in-process mesh of endpoints.
#[derive(Clone, Default)]
pub struct Mesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl Mesh {
    /// Create an empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the services reachable at `addr`.
    pub fn register(&self, addr: &str, services: Arc<ServiceRegistry>) {
        let mut inner = self.inner.lock().unwrap();
        inner.registries.insert(addr.to_string(), services);
    }

    /// Mark `addr` unreachable (or reachable again).
    pub fn set_down(&self, addr: &str, down: bool) {
        let mut inner = self.inner.lock().unwrap();
        if down {
            inner.down.insert(addr.to_string());
        } else {
            inner.down.remove(addr);
        }
    }

    fn lookup(&self, addr: &str) -> Result<Arc<ServiceRegistry>, rpc_pb::Error> {
        let inner = self.inner.lock().unwrap();
        if inner.down.contains(addr) {
            return Err(rpc_pb::Error::TransportFailure {
                core: ErrorCore::default(),
                what: format!("{} is down", addr),
            });
        }
        match inner.registries.get(addr) {
            Some(services) => Ok(Arc::clone(services)),
            None => Err(rpc_pb::Error::TransportFailure {
                core: ErrorCore::default(),
                what: format!("nothing listens at {}", addr),
            }),
        }
    }
}

impl Connector for Mesh {
    fn connect(
        &self,
        target: &str,
        _options: &ClientOptions,
    ) -> Result<Box<dyn Wire>, rpc_pb::Error> {
        self.lookup(target)?;
        Ok(Box::new(MeshWire {
            mesh: self.clone(),
            target: target.to_string(),
            pending: None,
        }))
    }
}

////////////////////////////////////////////// MeshWire ////////////////////////////////////////////

struct MeshWire {
    mesh: Mesh,
    target: String,
    pending: Option<Vec<u8>>,
}

impl Wire for MeshWire {
    fn send(&mut self, body: &[u8]) -> Result<(), rpc_pb::Error> {
        // Re-check reachability at send time so a node taken down mid-test kills live wires.
        self.mesh.lookup(&self.target)?;
        self.pending = Some(body.to_vec());
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, rpc_pb::Error> {
        let req_buf = self.pending.take().ok_or_else(|| rpc_pb::Error::LogicError {
            core: ErrorCore::default(),
            what: "recv without a pending request".to_string(),
        })?;
        let services = self.mesh.lookup(&self.target)?;
        dispatch(&services, &req_buf)
    }
}
