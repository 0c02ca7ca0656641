//! The write-back extent cache.  Reads fill from the server; writes and removals stay local,
//! marked dirty, until the lock protecting the extent is released.  The cache implements the
//! lock client's release hook, flushing an extent at the moment its lock goes back, so the
//! next holder anywhere in the system reads what this one wrote.  Callers are expected to hold
//! the distributed lock for an extent around every operation on it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR};

use extent_pb::{
    Attributes, Error, ExtentId, ExtentService, ExtentServiceClient, GetAttrRequest, GetRequest,
    PutRequest, RemoveRequest,
};
use lockd::Releaser;

use super::{time_since_epoch, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static HITS: Counter = Counter::new("extentd.cache.hits");
static FILLS: Counter = Counter::new("extentd.cache.fills");
static PUTS: Counter = Counter::new("extentd.cache.puts");
static REMOVES: Counter = Counter::new("extentd.cache.removes");
static FLUSHES: Counter = Counter::new("extentd.cache.flushes");
static FLUSH_FAILURES: Counter = Counter::new("extentd.cache.flush_failures");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&HITS);
    collector.register_counter(&FILLS);
    collector.register_counter(&PUTS);
    collector.register_counter(&REMOVES);
    collector.register_counter(&FLUSHES);
    collector.register_counter(&FLUSH_FAILURES);
}

/////////////////////////////////////////////// entry //////////////////////////////////////////////

#[derive(Clone, Debug, Default)]
struct CacheEntry {
    data: Vec<u8>,
    attr: Attributes,
    dirty: bool,
    removed: bool,
}

///////////////////////////////////////////// ExtentCache //////////////////////////////////////////

/// The caching extent client.
pub struct ExtentCache {
    service: ExtentServiceClient,
    entries: Mutex<BTreeMap<ExtentId, CacheEntry>>,
}

impl ExtentCache {
    /// Create a cache over a connection to the extent server.
    pub fn new(service: Arc<dyn rpc_pb::Client + Send + Sync + 'static>) -> ExtentCache {
        ExtentCache {
            service: ExtentServiceClient::new(service),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Read the bytes of `eid`, filling the cache on a miss.
    pub fn get(&self, eid: ExtentId) -> Result<Vec<u8>, Error> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&eid) {
            if entry.removed {
                return Err(Error::not_found(eid));
            }
            HITS.click();
            entry.attr.atime = time_since_epoch();
            return Ok(entry.data.clone());
        }
        let entry = self.fill(&mut entries, eid)?;
        Ok(entry.data)
    }

    /// Read the attributes of `eid`, filling the cache on a miss.
    pub fn getattr(&self, eid: ExtentId) -> Result<Attributes, Error> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&eid) {
            if entry.removed {
                return Err(Error::not_found(eid));
            }
            HITS.click();
            return Ok(entry.attr.clone());
        }
        let entry = self.fill(&mut entries, eid)?;
        Ok(entry.attr)
    }

    /// Replace the bytes of `eid` locally.  No server round trip; the write reaches the server
    /// when the protecting lock is released.
    pub fn put(&self, eid: ExtentId, data: Vec<u8>) {
        PUTS.click();
        let now = time_since_epoch();
        let entry = CacheEntry {
            attr: Attributes {
                atime: now,
                mtime: now,
                ctime: now,
                size: data.len() as u64,
            },
            data,
            dirty: true,
            removed: false,
        };
        self.entries.lock().unwrap().insert(eid, entry);
    }

    /// Mark `eid` removed locally.  The removal reaches the server at flush time.
    pub fn remove(&self, eid: ExtentId) {
        REMOVES.click();
        let mut entries = self.entries.lock().unwrap();
        entries.entry(eid).or_default().removed = true;
    }

    /// Push `eid`'s dirty state to the server and drop it from the cache.  Clean entries are
    /// just dropped.
    pub fn flush(&self, eid: ExtentId) -> Result<(), Error> {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            match entries.remove(&eid) {
                Some(entry) => entry,
                None => {
                    return Ok(());
                }
            }
        };
        let ctx = rpc_pb::Context::default();
        if entry.removed {
            FLUSHES.click();
            match self.service.remove(&ctx, RemoveRequest { eid }) {
                Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
                Err(err) => Err(err),
            }
        } else if entry.dirty {
            FLUSHES.click();
            self.service.put(
                &ctx,
                PutRequest {
                    eid,
                    data: entry.data,
                },
            )?;
            Ok(())
        } else {
            Ok(())
        }
    }

    fn fill(
        &self,
        entries: &mut BTreeMap<ExtentId, CacheEntry>,
        eid: ExtentId,
    ) -> Result<CacheEntry, Error> {
        FILLS.click();
        let ctx = rpc_pb::Context::default();
        let data = self.service.get(&ctx, GetRequest { eid })?.data;
        let attr = self.service.getattr(&ctx, GetAttrRequest { eid })?.attr;
        let mut entry = CacheEntry {
            data,
            attr,
            dirty: false,
            removed: false,
        };
        entry.attr.atime = time_since_epoch();
        entries.insert(eid, entry.clone());
        Ok(entry)
    }
}

impl Releaser for ExtentCache {
    fn dorelease(&self, lid: u64) {
        // The lock id doubles as the extent id it protects.
        if let Err(err) = self.flush(lid) {
            FLUSH_FAILURES.click();
            clue!(COLLECTOR, ERROR, {
                flush_failed: {
                    eid: lid,
                    what: err.to_string(),
                },
            });
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use busywire::{ClientOptions, Handles, Mesh, ServiceRegistry};
    use extent_pb::ExtentServiceServer;

    use super::super::ExtentServer;
    use super::*;

    const SERVER: &str = "127.0.0.1:3962";

    fn setup() -> (Arc<ExtentServer>, ExtentCache) {
        let mesh = Mesh::new();
        let server = ExtentServer::new();
        let mut services = ServiceRegistry::new();
        services.register("ExtentService", ExtentServiceServer::bind(Arc::clone(&server)));
        mesh.register(SERVER, Arc::new(services));
        let handles = Handles::new(ClientOptions::default(), Arc::new(mesh.clone()));
        let cache = ExtentCache::new(handles.handle(SERVER));
        (server, cache)
    }

    #[test]
    fn reads_fill_and_then_hit() {
        let (server, cache) = setup();
        server.put(7, b"on the server".to_vec());
        assert_eq!(b"on the server".to_vec(), cache.get(7).unwrap());
        // A server-side change stays invisible while the cache holds the extent.
        server.put(7, b"changed behind the cache".to_vec());
        assert_eq!(b"on the server".to_vec(), cache.get(7).unwrap());
        assert_eq!(13, cache.getattr(7).unwrap().size);
    }

    #[test]
    fn writes_stay_local_until_flush() {
        let (server, cache) = setup();
        cache.put(9, b"dirty".to_vec());
        assert!(server.get(9).is_err());
        cache.flush(9).unwrap();
        assert_eq!(b"dirty".to_vec(), server.get(9).unwrap());
        // Flushed entries leave the cache; the next read refills.
        assert_eq!(b"dirty".to_vec(), cache.get(9).unwrap());
    }

    #[test]
    fn removal_reaches_the_server_at_flush() {
        let (server, cache) = setup();
        server.put(4, b"doomed".to_vec());
        assert_eq!(b"doomed".to_vec(), cache.get(4).unwrap());
        cache.remove(4);
        assert!(cache.get(4).is_err());
        assert!(server.get(4).is_ok());
        cache.flush(4).unwrap();
        assert!(server.get(4).is_err());
    }

    #[test]
    fn clean_entries_flush_without_traffic() {
        let (server, cache) = setup();
        server.put(2, b"clean".to_vec());
        assert_eq!(b"clean".to_vec(), cache.get(2).unwrap());
        cache.flush(2).unwrap();
        assert_eq!(b"clean".to_vec(), server.get(2).unwrap());
        // Flushing something never cached is a no-op.
        cache.flush(99).unwrap();
    }
}
