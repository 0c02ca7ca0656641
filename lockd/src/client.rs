//! The caching lock client.  A granted lock stays cached in FREE after its holder lets go, so
//! a thread that re-acquires it pays no network round trip.  The server calls back over the
//! client's listener: `revoke` asks for the lock back (satisfied immediately when FREE,
//! deferred to the holder's release otherwise) and `retry` wakes an acquire that was refused.
//! One process-wide mutex guards every cached lock; transient ACQUIRING/RELEASING states hold
//! other local threads off a lock while its RPC is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use biometrics::{Collector, Counter};
use indicio::{clue, DEBUG};
use zerror_core::ErrorCore;

use busywire::{Mesh, ServiceRegistry};
use lock_pb::{
    AcquireRequest, Error, LockCallback, LockCallbackServer, LockId, LockService,
    LockServiceClient, ReleaseRequest, RetryResponse, RevokeResponse, StatRequest, Status,
};

use super::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ACQUIRES: Counter = Counter::new("lockd.client.acquires");
static ACQUIRES_CACHED: Counter = Counter::new("lockd.client.acquires.cached");
static ACQUIRE_RPCS: Counter = Counter::new("lockd.client.acquire_rpcs");
static RETRY_WAITS: Counter = Counter::new("lockd.client.retry_waits");
static RETRY_TIMEOUTS: Counter = Counter::new("lockd.client.retry_timeouts");
static RELEASES: Counter = Counter::new("lockd.client.releases");
static RELEASES_TO_SERVER: Counter = Counter::new("lockd.client.releases_to_server");
static REVOKES: Counter = Counter::new("lockd.client.revokes");
static RETRIES: Counter = Counter::new("lockd.client.retries");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ACQUIRES);
    collector.register_counter(&ACQUIRES_CACHED);
    collector.register_counter(&ACQUIRE_RPCS);
    collector.register_counter(&RETRY_WAITS);
    collector.register_counter(&RETRY_TIMEOUTS);
    collector.register_counter(&RELEASES);
    collector.register_counter(&RELEASES_TO_SERVER);
    collector.register_counter(&REVOKES);
    collector.register_counter(&RETRIES);
}

////////////////////////////////////////////// Releaser ////////////////////////////////////////////

/// The flush hook invoked at the moment a lock goes back to the server, before the release RPC
/// leaves the process.  The extent cache implements this to flush dirty data the lock protects.
pub trait Releaser: Send + Sync + 'static {
    fn dorelease(&self, lid: LockId);
}

////////////////////////////////////////////// internals ///////////////////////////////////////////

const RETRY_TIMEOUT: Duration = Duration::from_secs(3);

struct LockCvs {
    // Signaled when the status reaches FREE or NONE.
    free: Condvar,
    // Signaled when the server says a refused acquire may now succeed.
    retry: Condvar,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HoldState {
    None,
    Acquiring,
    Free,
    Locked,
    Releasing,
}

struct CachedLock {
    status: HoldState,
    revoked: bool,
    should_retry: bool,
    owner: Option<std::thread::ThreadId>,
    cvs: Arc<LockCvs>,
}

impl Default for CachedLock {
    fn default() -> Self {
        Self {
            status: HoldState::None,
            revoked: false,
            should_retry: false,
            owner: None,
            cvs: Arc::new(LockCvs {
                free: Condvar::new(),
                retry: Condvar::new(),
            }),
        }
    }
}

struct ClientState {
    locks: HashMap<LockId, CachedLock>,
    xid: u64,
}

struct ClientInner {
    id: String,
    service: LockServiceClient,
    releaser: Option<Arc<dyn Releaser>>,
    state: Mutex<ClientState>,
}

fn entry<'a>(state: &'a mut ClientState, lid: LockId) -> &'a mut CachedLock {
    state.locks.entry(lid).or_default()
}

impl ClientInner {
    /// Acquire ownership of `lid` from the server.  Requires the entry to be NONE; leaves it
    /// FREE on success and NONE on failure.  The mutex is released around each RPC.
    fn acquire_from_server<'a>(
        &'a self,
        mut state: MutexGuard<'a, ClientState>,
        lid: LockId,
    ) -> (MutexGuard<'a, ClientState>, Result<(), Error>) {
        entry(&mut state, lid).status = HoldState::Acquiring;
        let ctx = rpc_pb::Context::default();
        loop {
            state.xid += 1;
            let req = AcquireRequest {
                lid,
                client_id: self.id.clone(),
                xid: state.xid,
            };
            ACQUIRE_RPCS.click();
            drop(state);
            let result = self.service.acquire(&ctx, req);
            state = self.state.lock().unwrap();
            let resp = match result {
                Ok(resp) => resp,
                Err(err) => {
                    let lock = entry(&mut state, lid);
                    lock.status = HoldState::None;
                    lock.cvs.free.notify_one();
                    return (state, Err(err));
                }
            };
            match resp.status {
                Status::Ok => {
                    let lock = entry(&mut state, lid);
                    lock.status = HoldState::Free;
                    if resp.contention {
                        // Others are waiting; hand the lock back on the next release instead of
                        // caching it.
                        lock.revoked = true;
                    }
                    return (state, Ok(()));
                }
                Status::Retry => {
                    RETRY_WAITS.click();
                    let cvs = entry(&mut state, lid).cvs.clone();
                    let deadline = Instant::now() + RETRY_TIMEOUT;
                    while !entry(&mut state, lid).should_retry {
                        let now = Instant::now();
                        if now >= deadline {
                            // A lost retry callback must not stall this thread forever; probe
                            // the server again.
                            RETRY_TIMEOUTS.click();
                            break;
                        }
                        let (guard, _) = cvs.retry.wait_timeout(state, deadline - now).unwrap();
                        state = guard;
                    }
                    entry(&mut state, lid).should_retry = false;
                    continue;
                }
                Status::Stale => {
                    let lock = entry(&mut state, lid);
                    lock.status = HoldState::None;
                    lock.cvs.free.notify_one();
                    return (
                        state,
                        Err(Error::Stale {
                            core: ErrorCore::default(),
                        }),
                    );
                }
                other => {
                    let lock = entry(&mut state, lid);
                    lock.status = HoldState::None;
                    lock.cvs.free.notify_one();
                    return (
                        state,
                        Err(Error::protocol(format!("acquire answered {:?}", other))),
                    );
                }
            }
        }
    }

    /// Give `lid` back to the server.  Requires LOCKED or FREE; flushes through the release
    /// hook first.  Leaves the entry NONE on success and restores the prior status on failure.
    fn release_to_server<'a>(
        &'a self,
        mut state: MutexGuard<'a, ClientState>,
        lid: LockId,
    ) -> (MutexGuard<'a, ClientState>, Result<(), Error>) {
        RELEASES_TO_SERVER.click();
        let prev = entry(&mut state, lid).status;
        entry(&mut state, lid).status = HoldState::Releasing;
        if let Some(releaser) = &self.releaser {
            releaser.dorelease(lid);
        }
        state.xid += 1;
        let req = ReleaseRequest {
            lid,
            client_id: self.id.clone(),
            xid: state.xid,
        };
        let ctx = rpc_pb::Context::default();
        drop(state);
        let result = self.service.release(&ctx, req);
        state = self.state.lock().unwrap();
        match result {
            Ok(resp) if resp.status == Status::Ok => {
                let lock = entry(&mut state, lid);
                lock.status = HoldState::None;
                lock.owner = None;
                lock.revoked = false;
                (state, Ok(()))
            }
            Ok(resp) => {
                entry(&mut state, lid).status = prev;
                (
                    state,
                    Err(Error::protocol(format!("release answered {:?}", resp.status))),
                )
            }
            Err(err) => {
                entry(&mut state, lid).status = prev;
                (state, Err(err))
            }
        }
    }

    fn revoke_handler(&self, lid: LockId) -> Status {
        REVOKES.click();
        let mut state = self.state.lock().unwrap();
        if !state.locks.contains_key(&lid) {
            return Status::RpcErr;
        }
        clue!(COLLECTOR, DEBUG, {
            revoked: {
                lid: lid,
            },
        });
        if entry(&mut state, lid).status == HoldState::Free {
            // Nobody local is using it; give it back right away.
            let (mut state, result) = self.release_to_server(state, lid);
            match result {
                Ok(()) => {
                    entry(&mut state, lid).cvs.free.notify_one();
                    Status::Ok
                }
                Err(_) => Status::RpcErr,
            }
        } else {
            entry(&mut state, lid).revoked = true;
            Status::Ok
        }
    }

    fn retry_handler(&self, lid: LockId) -> Status {
        RETRIES.click();
        let mut state = self.state.lock().unwrap();
        if !state.locks.contains_key(&lid) {
            return Status::RpcErr;
        }
        let lock = entry(&mut state, lid);
        lock.should_retry = true;
        lock.cvs.retry.notify_one();
        Status::Ok
    }
}

///////////////////////////////////////////// callbacks ////////////////////////////////////////////

struct Callbacks {
    inner: Arc<ClientInner>,
}

impl LockCallback for Callbacks {
    fn revoke(
        &self,
        _: &rpc_pb::Context,
        req: lock_pb::RevokeRequest,
    ) -> Result<RevokeResponse, Error> {
        Ok(RevokeResponse {
            status: self.inner.revoke_handler(req.lid),
        })
    }

    fn retry(
        &self,
        _: &rpc_pb::Context,
        req: lock_pb::RetryRequest,
    ) -> Result<RetryResponse, Error> {
        Ok(RetryResponse {
            status: self.inner.retry_handler(req.lid),
        })
    }
}

///////////////////////////////////////////// LockClient ///////////////////////////////////////////

/// The caching lock client.
pub struct LockClient {
    inner: Arc<ClientInner>,
}

impl LockClient {
    /// Create a client whose callback listener binds an ephemeral TCP port.  `service` carries
    /// acquire/release/stat to the server, whether that is a plain connection or a replicated
    /// group client.
    pub fn new(
        service: Arc<dyn rpc_pb::Client + Send + Sync + 'static>,
        releaser: Option<Arc<dyn Releaser>>,
    ) -> Result<LockClient, Error> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let id = format!("127.0.0.1:{}", port);
        let (inner, services) = Self::assemble(id, service, releaser);
        let server = busywire::Server::from_listener(listener, services);
        std::thread::spawn(move || {
            let _ = server.serve();
        });
        Ok(LockClient { inner })
    }

    /// Create a client whose callback listener lives on an in-process mesh at `callback_addr`.
    pub fn with_mesh(
        mesh: &Mesh,
        callback_addr: &str,
        service: Arc<dyn rpc_pb::Client + Send + Sync + 'static>,
        releaser: Option<Arc<dyn Releaser>>,
    ) -> LockClient {
        let (inner, services) = Self::assemble(callback_addr.to_string(), service, releaser);
        mesh.register(callback_addr, Arc::new(services));
        LockClient { inner }
    }

    fn assemble(
        id: String,
        service: Arc<dyn rpc_pb::Client + Send + Sync + 'static>,
        releaser: Option<Arc<dyn Releaser>>,
    ) -> (Arc<ClientInner>, ServiceRegistry) {
        let inner = Arc::new(ClientInner {
            id,
            service: LockServiceClient::new(service),
            releaser,
            state: Mutex::new(ClientState {
                locks: HashMap::new(),
                xid: 0,
            }),
        });
        let mut services = ServiceRegistry::new();
        services.register(
            "LockCallback",
            LockCallbackServer::bind(Callbacks {
                inner: Arc::clone(&inner),
            }),
        );
        (inner, services)
    }

    /// The client id this client presents to the server (its callback address).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Take `lid` for the calling thread, fetching ownership from the server when the cache
    /// cannot satisfy it.  Blocks while another local thread holds the lock.
    pub fn acquire(&self, lid: LockId) -> Result<(), Error> {
        ACQUIRES.click();
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        loop {
            let status = entry(&mut state, lid).status;
            match status {
                HoldState::None => {
                    let (guard, result) = inner.acquire_from_server(state, lid);
                    state = guard;
                    result?;
                    let lock = entry(&mut state, lid);
                    lock.status = HoldState::Locked;
                    lock.owner = Some(std::thread::current().id());
                    return Ok(());
                }
                HoldState::Free => {
                    ACQUIRES_CACHED.click();
                    let lock = entry(&mut state, lid);
                    lock.status = HoldState::Locked;
                    lock.owner = Some(std::thread::current().id());
                    return Ok(());
                }
                HoldState::Locked | HoldState::Acquiring | HoldState::Releasing => {
                    let cvs = entry(&mut state, lid).cvs.clone();
                    loop {
                        state = cvs.free.wait(state).unwrap();
                        let status = entry(&mut state, lid).status;
                        if status == HoldState::Free || status == HoldState::None {
                            break;
                        }
                    }
                    // NONE restarts the loop and goes to the server; FREE is taken above.
                }
            }
        }
    }

    /// Let go of `lid`.  The lock stays cached unless the server revoked it, in which case it
    /// flows back through the release hook and the release RPC.
    pub fn release(&self, lid: LockId) -> Result<(), Error> {
        RELEASES.click();
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        if !state.locks.contains_key(&lid) {
            return Err(Error::protocol("releasing an unknown lock"));
        }
        {
            let lock = entry(&mut state, lid);
            if lock.status != HoldState::Locked {
                return Err(Error::protocol("releasing a lock that is not held"));
            }
            if lock.owner != Some(std::thread::current().id()) {
                return Err(Error::protocol("releasing another thread's lock"));
            }
        }
        if entry(&mut state, lid).revoked {
            let (mut state, result) = inner.release_to_server(state, lid);
            // Waiters learn the outcome either way: NONE sends the next thread to the server,
            // and a failed release restored LOCKED, which they re-wait on.
            entry(&mut state, lid).cvs.free.notify_one();
            result?;
        } else {
            let lock = entry(&mut state, lid);
            lock.status = HoldState::Free;
            lock.owner = None;
            lock.cvs.free.notify_one();
        }
        Ok(())
    }

    /// Ask the server how many times `lid` has been granted.
    pub fn stat(&self, lid: LockId) -> Result<u64, Error> {
        let ctx = rpc_pb::Context::default();
        let resp = self.inner.service.stat(&ctx, StatRequest { lid })?;
        match resp.status {
            Status::Ok => Ok(resp.nacquire),
            other => Err(Error::protocol(format!("stat answered {:?}", other))),
        }
    }
}
