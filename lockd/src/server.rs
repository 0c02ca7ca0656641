//! The lock server.  One mutex covers every lock and every per-client duplicate-suppression
//! context.  Outbound revoke and retry callbacks are never made under that mutex: they are
//! enqueued onto FIFOs consumed by two dedicated worker threads, and only a primary dispatches
//! them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use indicio::{clue, DEBUG, ERROR, INFO};

use busywire::Handles;
use lock_pb::{
    AcquireRequest, AcquireResponse, LockCallback, LockCallbackClient, LockId, LockState,
    ReleaseRequest, ReleaseResponse, RetryRequest, RevokeRequest, Snapshot, SnapshotContext,
    SnapshotLock, StatResponse, Status,
};
use rsm::Replica;

use super::fifo::Fifo;
use super::uniqueue::UniQueue;
use super::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ACQUIRES: Counter = Counter::new("lockd.server.acquires");
static GRANTS: Counter = Counter::new("lockd.server.grants");
static RETRIES_REPLIED: Counter = Counter::new("lockd.server.retries_replied");
static RELEASES: Counter = Counter::new("lockd.server.releases");
static DUPLICATES: Counter = Counter::new("lockd.server.duplicates");
static STALE: Counter = Counter::new("lockd.server.stale");
static REVOKES_SENT: Counter = Counter::new("lockd.server.revokes_sent");
static RETRIES_SENT: Counter = Counter::new("lockd.server.retries_sent");
static TASKS_DROPPED: Counter = Counter::new("lockd.server.tasks_dropped");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ACQUIRES);
    collector.register_counter(&GRANTS);
    collector.register_counter(&RETRIES_REPLIED);
    collector.register_counter(&RELEASES);
    collector.register_counter(&DUPLICATES);
    collector.register_counter(&STALE);
    collector.register_counter(&REVOKES_SENT);
    collector.register_counter(&RETRIES_SENT);
    collector.register_counter(&TASKS_DROPPED);
}

/////////////////////////////////////////// CallbackGate ///////////////////////////////////////////

/// Whether this server instance should contact clients.  Standalone servers always should; a
/// replicated server's backups apply the same log but must stay silent.
pub trait CallbackGate: Send + Sync + 'static {
    fn is_primary(&self) -> bool;
}

/// The gate for a standalone server.
pub struct AlwaysPrimary;

impl CallbackGate for AlwaysPrimary {
    fn is_primary(&self) -> bool {
        true
    }
}

impl CallbackGate for Replica {
    fn is_primary(&self) -> bool {
        self.amiprimary()
    }
}

////////////////////////////////////////////// ClientCtx ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct ClientCtx {
    acquire_xid: u64,
    acquire_reply: Option<AcquireResponse>,
    release_xid: u64,
    release_reply: Option<ReleaseResponse>,
}

////////////////////////////////////////////// LockEntry ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct LockEntry {
    state: LockState,
    owner: Option<String>,
    nacquire: u64,
    wait_q: UniQueue<String>,
    contexts: BTreeMap<String, ClientCtx>,
}

//////////////////////////////////////////////// Task //////////////////////////////////////////////

#[derive(Clone, Debug)]
struct Task {
    lid: LockId,
    client: String,
}

///////////////////////////////////////////// LockServer ///////////////////////////////////////////

/// The lock server.  Construct with [LockServer::new]; the returned Arc is shared with two
/// worker threads that live until the server is dropped.
pub struct LockServer {
    gate: Arc<dyn CallbackGate>,
    handles: Arc<Handles>,
    locks: Mutex<BTreeMap<LockId, LockEntry>>,
    revoke_tasks: Arc<Fifo<Task>>,
    retry_tasks: Arc<Fifo<Task>>,
}

impl LockServer {
    /// Create a server and start its revoker and retryer workers.  `handles` dials client
    /// callback listeners.
    pub fn new(gate: Arc<dyn CallbackGate>, handles: Arc<Handles>) -> Arc<LockServer> {
        let server = Arc::new(LockServer {
            gate,
            handles,
            locks: Mutex::new(BTreeMap::new()),
            revoke_tasks: Arc::new(Fifo::new()),
            retry_tasks: Arc::new(Fifo::new()),
        });
        let weak = Arc::downgrade(&server);
        let tasks = Arc::clone(&server.revoke_tasks);
        std::thread::spawn(move || Self::revoker(weak, tasks));
        let weak = Arc::downgrade(&server);
        let tasks = Arc::clone(&server.retry_tasks);
        std::thread::spawn(move || Self::retryer(weak, tasks));
        server
    }

    /// Lend `lid` to `client_id`, or queue the client and start revoking the current holder.
    pub fn acquire(&self, lid: LockId, client_id: &str, xid: u64) -> AcquireResponse {
        ACQUIRES.click();
        let mut locks = self.locks.lock().unwrap();
        let entry = locks.entry(lid).or_default();
        let ctx = entry.contexts.entry(client_id.to_string()).or_default();
        if xid < ctx.acquire_xid {
            STALE.click();
            return AcquireResponse {
                status: Status::Stale,
                contention: false,
                revoke: false,
            };
        }
        if xid == ctx.acquire_xid {
            if let Some(reply) = ctx.acquire_reply.clone() {
                DUPLICATES.click();
                if reply.revoke {
                    if let Some(owner) = entry.owner.clone() {
                        self.revoke_tasks.enq(Task {
                            lid,
                            client: owner,
                        });
                    }
                }
                return reply;
            }
        }
        ctx.acquire_xid = xid;
        let reply = match entry.state {
            LockState::Free => {
                GRANTS.click();
                entry.state = LockState::Lent;
                entry.owner = Some(client_id.to_string());
                entry.nacquire += 1;
                clue!(COLLECTOR, INFO, {
                    grant: {
                        lid: lid,
                        client: client_id.to_string(),
                    },
                });
                AcquireResponse {
                    status: Status::Ok,
                    contention: !entry.wait_q.is_empty(),
                    revoke: false,
                }
            }
            LockState::Lent | LockState::Revoked if entry.owner.as_deref() == Some(client_id) => {
                // The owner has no business acquiring what it already holds; answering RETRY
                // would queue the owner behind itself.
                clue!(COLLECTOR, ERROR, {
                    owner_reacquire: {
                        lid: lid,
                        client: client_id.to_string(),
                    },
                });
                AcquireResponse {
                    status: Status::RpcErr,
                    contention: false,
                    revoke: false,
                }
            }
            LockState::Lent => {
                RETRIES_REPLIED.click();
                entry.wait_q.push(client_id.to_string());
                entry.state = LockState::Revoked;
                let owner = entry.owner.clone().unwrap_or_default();
                self.revoke_tasks.enq(Task { lid, client: owner });
                AcquireResponse {
                    status: Status::Retry,
                    contention: false,
                    revoke: true,
                }
            }
            LockState::Revoked => {
                RETRIES_REPLIED.click();
                entry.wait_q.push(client_id.to_string());
                AcquireResponse {
                    status: Status::Retry,
                    contention: false,
                    revoke: false,
                }
            }
        };
        let ctx = entry.contexts.get_mut(client_id).expect("context just inserted");
        ctx.acquire_reply = Some(reply.clone());
        reply
    }

    /// Take `lid` back from `client_id` and wake the head waiter, if any.
    pub fn release(&self, lid: LockId, client_id: &str, xid: u64) -> ReleaseResponse {
        RELEASES.click();
        let mut locks = self.locks.lock().unwrap();
        let entry = match locks.get_mut(&lid) {
            Some(entry) => entry,
            None => {
                return ReleaseResponse {
                    status: Status::RpcErr,
                };
            }
        };
        let ctx = entry.contexts.entry(client_id.to_string()).or_default();
        if xid < ctx.release_xid {
            STALE.click();
            return ReleaseResponse {
                status: Status::Stale,
            };
        }
        if xid == ctx.release_xid {
            if let Some(reply) = ctx.release_reply.clone() {
                DUPLICATES.click();
                return reply;
            }
        }
        ctx.release_xid = xid;
        let reply = if entry.state == LockState::Free {
            ReleaseResponse {
                status: Status::RpcErr,
            }
        } else if entry.owner.as_deref() != Some(client_id) {
            ReleaseResponse {
                status: Status::RpcErr,
            }
        } else {
            entry.state = LockState::Free;
            entry.owner = None;
            if let Some(next) = entry.wait_q.pop() {
                self.retry_tasks.enq(Task { lid, client: next });
            }
            clue!(COLLECTOR, INFO, {
                release: {
                    lid: lid,
                    client: client_id.to_string(),
                },
            });
            ReleaseResponse { status: Status::Ok }
        };
        let ctx = entry.contexts.get_mut(client_id).expect("context just inserted");
        ctx.release_reply = Some(reply.clone());
        reply
    }

    /// How many times `lid` has been granted.
    pub fn stat(&self, lid: LockId) -> StatResponse {
        let locks = self.locks.lock().unwrap();
        let nacquire = locks.get(&lid).map(|e| e.nacquire).unwrap_or(0);
        StatResponse {
            status: Status::Ok,
            nacquire,
        }
    }

    /// Serialize the full server state.
    pub fn marshal_state(&self) -> Vec<u8> {
        let locks = self.locks.lock().unwrap();
        let mut snapshot = Snapshot::default();
        for (lid, entry) in locks.iter() {
            snapshot.locks.push(SnapshotLock {
                lid: *lid,
                state: entry.state.clone(),
                owner: entry.owner.clone().unwrap_or_default(),
                nacquire: entry.nacquire,
                wait_q: entry.wait_q.iter().cloned().collect(),
                contexts: entry
                    .contexts
                    .iter()
                    .map(|(client, ctx)| SnapshotContext {
                        client: client.clone(),
                        acquire_xid: ctx.acquire_xid,
                        acquire_reply: ctx.acquire_reply.clone(),
                        release_xid: ctx.release_xid,
                        release_reply: ctx.release_reply.clone(),
                    })
                    .collect(),
            });
        }
        stack_pack(&snapshot).to_vec()
    }

    /// Replace the server state with a serialized snapshot.
    pub fn unmarshal_state(&self, state: &[u8]) {
        let snapshot = match Snapshot::unpack(state) {
            Ok((snapshot, _)) => snapshot,
            Err(err) => {
                clue!(COLLECTOR, ERROR, {
                    bad_snapshot: err.to_string(),
                });
                return;
            }
        };
        let mut locks = self.locks.lock().unwrap();
        locks.clear();
        for lock in snapshot.locks.into_iter() {
            let entry = LockEntry {
                state: lock.state,
                owner: if lock.owner.is_empty() {
                    None
                } else {
                    Some(lock.owner)
                },
                nacquire: lock.nacquire,
                wait_q: lock.wait_q.into_iter().collect(),
                contexts: lock
                    .contexts
                    .into_iter()
                    .map(|ctx| {
                        (
                            ctx.client.clone(),
                            ClientCtx {
                                acquire_xid: ctx.acquire_xid,
                                acquire_reply: ctx.acquire_reply,
                                release_xid: ctx.release_xid,
                                release_reply: ctx.release_reply,
                            },
                        )
                    })
                    .collect(),
            };
            locks.insert(lock.lid, entry);
        }
    }

    /// Register this server's operations and snapshot hooks with a replica.
    pub fn attach_to_replica(self: &Arc<Self>, replica: &Replica) {
        let server = Arc::clone(self);
        replica.reg(
            "acquire",
            Box::new(move |body: &[u8]| {
                let (req, _) = AcquireRequest::unpack(body)?;
                let resp = server.acquire(req.lid, &req.client_id, req.xid);
                Ok(stack_pack(&resp).to_vec())
            }),
        );
        let server = Arc::clone(self);
        replica.reg(
            "release",
            Box::new(move |body: &[u8]| {
                let (req, _) = ReleaseRequest::unpack(body)?;
                let resp = server.release(req.lid, &req.client_id, req.xid);
                Ok(stack_pack(&resp).to_vec())
            }),
        );
        let server = Arc::clone(self);
        replica.reg(
            "stat",
            Box::new(move |body: &[u8]| {
                let (req, _) = lock_pb::StatRequest::unpack(body)?;
                let resp = server.stat(req.lid);
                Ok(stack_pack(&resp).to_vec())
            }),
        );
        replica.set_state_transfer(Arc::clone(self) as Arc<dyn rsm::StateTransfer>);
    }

    fn revoker(weak: Weak<LockServer>, tasks: Arc<Fifo<Task>>) {
        while let Some(task) = tasks.deq() {
            let server = match weak.upgrade() {
                Some(server) => server,
                None => break,
            };
            if !server.gate.is_primary() {
                TASKS_DROPPED.click();
                continue;
            }
            REVOKES_SENT.click();
            clue!(COLLECTOR, DEBUG, {
                revoke: {
                    lid: task.lid,
                    client: task.client.clone(),
                },
            });
            let client = LockCallbackClient::new(server.handles.handle(&task.client));
            let ctx = rpc_pb::Context::default();
            let req = RevokeRequest {
                lid: task.lid,
                xid: 0,
            };
            if let Err(err) = client.revoke(&ctx, req) {
                server.observe_callback_error(&task.client, &err);
            }
        }
    }

    fn retryer(weak: Weak<LockServer>, tasks: Arc<Fifo<Task>>) {
        while let Some(task) = tasks.deq() {
            let server = match weak.upgrade() {
                Some(server) => server,
                None => break,
            };
            if !server.gate.is_primary() {
                TASKS_DROPPED.click();
                continue;
            }
            RETRIES_SENT.click();
            clue!(COLLECTOR, DEBUG, {
                retry: {
                    lid: task.lid,
                    client: task.client.clone(),
                },
            });
            let client = LockCallbackClient::new(server.handles.handle(&task.client));
            let ctx = rpc_pb::Context::default();
            let req = RetryRequest {
                lid: task.lid,
                xid: 0,
            };
            if let Err(err) = client.retry(&ctx, req) {
                server.observe_callback_error(&task.client, &err);
            }
        }
    }

    fn observe_callback_error(&self, client: &str, err: &lock_pb::Error) {
        if let lock_pb::Error::RpcError { what, .. } = err {
            if busywire::is_transport_error(what) {
                self.handles.evict(client);
            }
        }
        clue!(COLLECTOR, DEBUG, {
            callback_error: {
                client: client.to_string(),
                what: err.to_string(),
            },
        });
    }
}

impl Drop for LockServer {
    fn drop(&mut self) {
        self.revoke_tasks.close();
        self.retry_tasks.close();
    }
}

impl rsm::StateTransfer for LockServer {
    fn marshal_state(&self) -> Vec<u8> {
        LockServer::marshal_state(self)
    }

    fn unmarshal_state(&self, state: &[u8]) {
        LockServer::unmarshal_state(self, state)
    }
}

//////////////////////////////////////////// the service ///////////////////////////////////////////

impl lock_pb::LockService for Arc<LockServer> {
    fn acquire(
        &self,
        _: &rpc_pb::Context,
        req: AcquireRequest,
    ) -> Result<AcquireResponse, lock_pb::Error> {
        Ok(LockServer::acquire(self, req.lid, &req.client_id, req.xid))
    }

    fn release(
        &self,
        _: &rpc_pb::Context,
        req: ReleaseRequest,
    ) -> Result<ReleaseResponse, lock_pb::Error> {
        Ok(LockServer::release(self, req.lid, &req.client_id, req.xid))
    }

    fn stat(
        &self,
        _: &rpc_pb::Context,
        req: lock_pb::StatRequest,
    ) -> Result<StatResponse, lock_pb::Error> {
        Ok(LockServer::stat(self, req.lid))
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
