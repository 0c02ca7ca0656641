//! The extent server: an in-memory map from extent id to bytes and attributes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};

use extent_pb::{
    Attributes, Error, ExtentId, ExtentService, GetAttrRequest, GetAttrResponse, GetRequest,
    GetResponse, PutRequest, PutResponse, RemoveRequest, RemoveResponse, ROOT_EXTENT,
};

use super::time_since_epoch;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static GETS: Counter = Counter::new("extentd.server.gets");
static PUTS: Counter = Counter::new("extentd.server.puts");
static REMOVES: Counter = Counter::new("extentd.server.removes");
static MISSES: Counter = Counter::new("extentd.server.misses");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&GETS);
    collector.register_counter(&PUTS);
    collector.register_counter(&REMOVES);
    collector.register_counter(&MISSES);
}

/////////////////////////////////////////////// Extent /////////////////////////////////////////////

#[derive(Clone, Debug, Default)]
struct Extent {
    data: Vec<u8>,
    attr: Attributes,
}

///////////////////////////////////////////// ExtentServer /////////////////////////////////////////

/// The in-memory extent store.  The file system above assumes the root extent exists, so a
/// fresh server seeds it empty.
pub struct ExtentServer {
    extents: Mutex<BTreeMap<ExtentId, Extent>>,
}

impl ExtentServer {
    pub fn new() -> Arc<ExtentServer> {
        let server = Arc::new(ExtentServer {
            extents: Mutex::new(BTreeMap::new()),
        });
        server.put(ROOT_EXTENT, Vec::new());
        server
    }

    /// Store `data` under `eid`, stamping fresh attributes.
    pub fn put(&self, eid: ExtentId, data: Vec<u8>) {
        PUTS.click();
        let now = time_since_epoch();
        let extent = Extent {
            attr: Attributes {
                atime: now,
                mtime: now,
                ctime: now,
                size: data.len() as u64,
            },
            data,
        };
        self.extents.lock().unwrap().insert(eid, extent);
    }

    /// Fetch the bytes under `eid`, touching its atime.
    pub fn get(&self, eid: ExtentId) -> Result<Vec<u8>, Error> {
        GETS.click();
        let mut extents = self.extents.lock().unwrap();
        match extents.get_mut(&eid) {
            Some(extent) => {
                extent.attr.atime = time_since_epoch();
                Ok(extent.data.clone())
            }
            None => {
                MISSES.click();
                Err(Error::not_found(eid))
            }
        }
    }

    /// Fetch the attributes under `eid`.
    pub fn getattr(&self, eid: ExtentId) -> Result<Attributes, Error> {
        let extents = self.extents.lock().unwrap();
        match extents.get(&eid) {
            Some(extent) => Ok(extent.attr.clone()),
            None => {
                MISSES.click();
                Err(Error::not_found(eid))
            }
        }
    }

    /// Drop the extent under `eid`.
    pub fn remove(&self, eid: ExtentId) -> Result<(), Error> {
        REMOVES.click();
        let mut extents = self.extents.lock().unwrap();
        match extents.remove(&eid) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(eid)),
        }
    }
}

//////////////////////////////////////////// the service ///////////////////////////////////////////

impl ExtentService for Arc<ExtentServer> {
    fn get(&self, _: &rpc_pb::Context, req: GetRequest) -> Result<GetResponse, Error> {
        let data = ExtentServer::get(self, req.eid)?;
        Ok(GetResponse { data })
    }

    fn getattr(
        &self,
        _: &rpc_pb::Context,
        req: GetAttrRequest,
    ) -> Result<GetAttrResponse, Error> {
        let attr = ExtentServer::getattr(self, req.eid)?;
        Ok(GetAttrResponse { attr })
    }

    fn put(&self, _: &rpc_pb::Context, req: PutRequest) -> Result<PutResponse, Error> {
        ExtentServer::put(self, req.eid, req.data);
        Ok(PutResponse {})
    }

    fn remove(&self, _: &rpc_pb::Context, req: RemoveRequest) -> Result<RemoveResponse, Error> {
        ExtentServer::remove(self, req.eid)?;
        Ok(RemoveResponse {})
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
