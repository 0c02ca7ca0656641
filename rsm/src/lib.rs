#![doc = include_str!("../README.md")]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use guacamole::Guacamole;
use indicio::{clue, DEBUG, ERROR, INFO};
use zerror_core::ErrorCore;

use busywire::Handles;
use rsm_pb::{
    Error, HeartbeatRequest, HeartbeatResponse, InvokeRequest, InvokeResponse, JoinRequest,
    JoinResponse, LogEntry, ReplicaClient, ReplicaService, View, ViewRequest, ViewResponse,
};
use synod::{Acceptor, Commit, Proposer};

mod client;

pub use client::{RsmClient, RsmClientOptions};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static APPLIED: Counter = Counter::new("rsm.applied");
static APPLIED_INVOKE: Counter = Counter::new("rsm.applied.invoke");
static APPLIED_RECONFIGURE: Counter = Counter::new("rsm.applied.reconfigure");
static SUBMITTED: Counter = Counter::new("rsm.submitted");
static SUBMIT_RETRIES: Counter = Counter::new("rsm.submit.retries");
static VIEW_CHANGES_PROPOSED: Counter = Counter::new("rsm.view_changes.proposed");
static JOINS_SERVED: Counter = Counter::new("rsm.joins.served");
static REJOINS: Counter = Counter::new("rsm.rejoins");
static HEARTBEATS_SENT: Counter = Counter::new("rsm.heartbeats.sent");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&APPLIED);
    collector.register_counter(&APPLIED_INVOKE);
    collector.register_counter(&APPLIED_RECONFIGURE);
    collector.register_counter(&SUBMITTED);
    collector.register_counter(&SUBMIT_RETRIES);
    collector.register_counter(&VIEW_CHANGES_PROPOSED);
    collector.register_counter(&JOINS_SERVED);
    collector.register_counter(&REJOINS);
    collector.register_counter(&HEARTBEATS_SENT);
    client::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

////////////////////////////////////////////// seeding /////////////////////////////////////////////

/// A per-instance random seed.  Every randomized component seeds its own [Guacamole] from this,
/// so two replicas in one process never share a stream.
pub fn fresh_seed() -> u64 {
    static SEQUENCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos
        .wrapping_mul(0x9e3779b97f4a7c15)
        .wrapping_add(SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
        ^ (std::process::id() as u64)
}

fn jitter_ms(guac: &Mutex<Guacamole>, range_ms: u64) -> u64 {
    if range_ms == 0 {
        return 0;
    }
    let mut buf = [0u8; 8];
    guac.lock().unwrap().generate(&mut buf);
    u64::from_le_bytes(buf) % range_ms
}

///////////////////////////////////////////// Handler //////////////////////////////////////////////

/// A registered command handler.  Applied at every replica, in log order.
pub type Handler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, Error> + Send + Sync + 'static>;

/////////////////////////////////////////// StateTransfer //////////////////////////////////////////

/// The state machine's snapshot hooks, used to bring joining replicas up to date.
pub trait StateTransfer: Send + Sync + 'static {
    /// Serialize the full state machine.
    fn marshal_state(&self) -> Vec<u8>;
    /// Replace the state machine with a serialized snapshot.
    fn unmarshal_state(&self, state: &[u8]);
}

/////////////////////////////////////////// ReplicaOptions /////////////////////////////////////////

/// Tunables for a replica.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicaOptions {
    /// How often members heartbeat each other, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long a member can go unheard before it is suspected dead, in milliseconds.
    pub dead_after_ms: u64,
    /// How many agreement rounds a submission tries before giving up.
    pub propose_attempts: usize,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 250,
            dead_after_ms: 3_000,
            propose_attempts: 8,
        }
    }
}

///////////////////////////////////////////// Replica //////////////////////////////////////////////

struct ReplicaState {
    view: View,
    applied: u32,
    insync: bool,
    seq: u64,
    pending: HashMap<u64, Result<Vec<u8>, Error>>,
    backlog: BTreeMap<u32, Vec<u8>>,
    last_heard: HashMap<String, Instant>,
    peer_applied: u32,
    started: bool,
    stop: bool,
}

struct ReplicaInner {
    me: String,
    options: ReplicaOptions,
    seeds: Vec<String>,
    acceptor: Arc<Acceptor>,
    proposer: Proposer,
    handles: Arc<Handles>,
    handlers: Mutex<HashMap<String, Handler>>,
    xfer: Mutex<Option<Arc<dyn StateTransfer>>>,
    state: Mutex<ReplicaState>,
    applied_cv: Condvar,
    submit_lock: Mutex<()>,
    guac: Mutex<Guacamole>,
}

/// One member of the replicated group.  Cheap to clone; clones share the replica.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

impl Replica {
    /// Create a replica.  `seeds` is the configured bootstrap list: its first entry seeds the
    /// group (its fresh log gets view 1 containing only itself); every other node joins through
    /// whichever members it can reach.  `handles` must carry the 1-second synod call timeout.
    pub fn new<P: AsRef<Path>>(
        options: ReplicaOptions,
        me: &str,
        log_path: P,
        seeds: Vec<String>,
        handles: Arc<Handles>,
    ) -> Result<Replica, Error> {
        let bootstrap = seeds.first().map(|s| s.as_str()) == Some(me);
        let initial_view = View {
            view_id: 1,
            members: vec![me.to_string()],
        };
        let initial_value = stack_pack(&LogEntry::Reconfigure { view: initial_view }).to_vec();
        let acceptor = Arc::new(Acceptor::new(me, log_path, bootstrap, &initial_value)?);
        let proposer = Proposer::new(me, Arc::clone(&acceptor), Arc::clone(&handles));
        let inner = Arc::new(ReplicaInner {
            me: me.to_string(),
            options,
            seeds,
            acceptor: Arc::clone(&acceptor),
            proposer,
            handles,
            handlers: Mutex::new(HashMap::new()),
            xfer: Mutex::new(None),
            state: Mutex::new(ReplicaState {
                view: View::default(),
                applied: 0,
                insync: false,
                seq: 0,
                pending: HashMap::new(),
                backlog: BTreeMap::new(),
                last_heard: HashMap::new(),
                peer_applied: 0,
                started: false,
                stop: false,
            }),
            applied_cv: Condvar::new(),
            submit_lock: Mutex::new(()),
            guac: Mutex::new(Guacamole::new(fresh_seed())),
        });
        let commit: Arc<dyn Commit> = Arc::clone(&inner) as Arc<dyn Commit>;
        acceptor.set_commit_upcall(Arc::downgrade(&commit));
        drop(commit);
        Ok(Replica { inner })
    }

    /// This node's identity.
    pub fn me(&self) -> &str {
        &self.inner.me
    }

    /// Register the command `handler` under `method`.  Register everything before [start].
    pub fn reg(&self, method: &str, handler: Handler) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), handler);
    }

    /// Register the state transfer hooks.
    pub fn set_state_transfer(&self, xfer: Arc<dyn StateTransfer>) {
        *self.inner.xfer.lock().unwrap() = Some(xfer);
    }

    /// True iff this replica is the primary of its current view and in sync.  All outward
    /// side effects must be gated on this.
    pub fn amiprimary(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.insync && state.view.primary() == Some(self.inner.me.as_str())
    }

    /// The current view.
    pub fn view(&self) -> View {
        self.inner.state.lock().unwrap().view.clone()
    }

    /// The highest applied log instance.
    pub fn applied(&self) -> u32 {
        self.inner.state.lock().unwrap().applied
    }

    /// Access the proposer, for arming test-harness breakpoints.
    pub fn proposer(&self) -> &Proposer {
        &self.inner.proposer
    }

    /// Register this replica's services (the acceptor and the replica front) so peers and
    /// clients can reach them.
    pub fn register_services(&self, services: &mut busywire::ServiceRegistry) {
        services.register(
            "AcceptorService",
            synod_pb::AcceptorServer::bind(Arc::clone(&self.inner.acceptor)),
        );
        services.register("ReplicaService", rsm_pb::ReplicaServer::bind(self.clone()));
    }

    /// Replay the durable log through the registered handlers and start the heartbeat/join
    /// manager thread.  Call after every [reg] and [set_state_transfer].
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.started = true;
            for instance in 1..=self.inner.acceptor.highest_decided() {
                if instance > state.applied && !state.backlog.contains_key(&instance) {
                    if let Some(value) = self.inner.acceptor.decided_value(instance) {
                        state.backlog.insert(instance, value);
                    }
                }
            }
            self.inner.drain_locked(&mut state);
            if state.view.is_member(&self.inner.me) {
                state.insync = true;
            }
        }
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            inner.manage();
        });
    }

    /// Stop background work.  In-flight submissions drain; the manager thread exits on its next
    /// tick.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.stop = true;
        self.inner.applied_cv.notify_all();
    }
}

impl Commit for ReplicaInner {
    fn commit(&self, instance: u32, value: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if instance > state.applied {
            state.backlog.insert(instance, value.to_vec());
        }
        if state.started {
            self.drain_locked(&mut state);
        }
    }
}

impl ReplicaInner {
    fn drain_locked(&self, state: &mut ReplicaState) {
        loop {
            let next = state.applied + 1;
            let value = match state.backlog.remove(&next) {
                Some(value) => value,
                None => break,
            };
            self.apply_locked(state, next, &value);
        }
        // Anything at or below the applied watermark is subsumed.
        let applied = state.applied;
        state.backlog.retain(|instance, _| *instance > applied);
        self.applied_cv.notify_all();
    }

    fn apply_locked(&self, state: &mut ReplicaState, instance: u32, value: &[u8]) {
        APPLIED.click();
        let entry = match LogEntry::unpack(value) {
            Ok((entry, _)) => entry,
            Err(err) => {
                clue!(COLLECTOR, ERROR, {
                    unparseable_entry: {
                        instance: instance as u64,
                        what: err.to_string(),
                    },
                });
                state.applied = instance;
                return;
            }
        };
        match entry {
            LogEntry::Nop => {}
            LogEntry::Reconfigure { view } => {
                APPLIED_RECONFIGURE.click();
                if view.view_id == state.view.view_id + 1 {
                    clue!(COLLECTOR, INFO, {
                        view_change: view.to_string(),
                    });
                    let now = Instant::now();
                    state.last_heard.clear();
                    for member in view.members.iter() {
                        state.last_heard.insert(member.clone(), now);
                    }
                    state.view = view;
                }
            }
            LogEntry::Invoke {
                origin,
                seq,
                method,
                body,
            } => {
                APPLIED_INVOKE.click();
                let handlers = self.handlers.lock().unwrap();
                let result = match handlers.get(&method) {
                    Some(handler) => handler(&body),
                    None => Err(Error::UnknownMethod {
                        core: ErrorCore::default(),
                        method: method.clone(),
                    }),
                };
                drop(handlers);
                if origin == self.me {
                    state.pending.insert(seq, result);
                }
            }
        }
        state.applied = instance;
    }

    /// Propose `entry` until it lands in the log.  For invoke entries, returns the reply the
    /// state machine produced for it.
    fn submit(&self, entry: LogEntry) -> Result<Option<Vec<u8>>, Error> {
        let _submitting = self.submit_lock.lock().unwrap();
        SUBMITTED.click();
        let packed = stack_pack(&entry).to_vec();
        let origin_seq = match &entry {
            LogEntry::Invoke { seq, .. } => Some(*seq),
            _ => None,
        };
        for attempt in 0..self.options.propose_attempts {
            if attempt > 0 {
                SUBMIT_RETRIES.click();
                let backoff = 10 + jitter_ms(&self.guac, 40 << attempt.min(4));
                std::thread::sleep(Duration::from_millis(backoff));
            }
            let (instance, members) = {
                let state = self.state.lock().unwrap();
                if state.stop {
                    return Err(Error::Busy {
                        core: ErrorCore::default(),
                    });
                }
                let instance = std::cmp::max(self.acceptor.highest_decided(), state.applied) + 1;
                (instance, state.view.members.clone())
            };
            let decided = match self.proposer.run(instance, &members, &packed) {
                Ok(decided) => decided,
                Err(synod_pb::Error::AlreadyRunning { .. }) => {
                    continue;
                }
                Err(err) => {
                    return Err(err.into());
                }
            };
            if !decided {
                continue;
            }
            // The instance decided, though not necessarily with our entry.  Wait for it to
            // apply, then see whether our entry was the one that landed.
            let mut state = self.state.lock().unwrap();
            while state.applied < instance && !state.stop {
                let (guard, timeout) = self
                    .applied_cv
                    .wait_timeout(state, Duration::from_millis(1_000))
                    .unwrap();
                state = guard;
                if timeout.timed_out() {
                    break;
                }
            }
            if state.applied < instance {
                continue;
            }
            match origin_seq {
                Some(seq) => {
                    if let Some(result) = state.pending.remove(&seq) {
                        return result.map(Some);
                    }
                    // Another proposer won this instance; try the next one.
                }
                None => {
                    return Ok(None);
                }
            }
        }
        Err(Error::LostRace {
            core: ErrorCore::default(),
        })
    }

    /// Propose views until the group's membership equals `members` or someone else changes the
    /// view first.
    fn propose_reconfigure(&self, members: Vec<String>) -> Result<(), Error> {
        for _ in 0..4 {
            let current = {
                let state = self.state.lock().unwrap();
                state.view.clone()
            };
            if current.members == members {
                return Ok(());
            }
            VIEW_CHANGES_PROPOSED.click();
            let view = View {
                view_id: current.view_id + 1,
                members: members.clone(),
            };
            clue!(COLLECTOR, INFO, {
                propose_view: view.to_string(),
            });
            self.submit(LogEntry::Reconfigure { view })?;
            let state = self.state.lock().unwrap();
            if state.view.members == members {
                return Ok(());
            }
            if state.view.view_id <= current.view_id {
                // The log accepted something else for that instance and the view is unchanged;
                // go around again.
                continue;
            }
            // The view moved underneath us.  The caller re-evaluates its suspicion against the
            // new view.
            return Ok(());
        }
        Err(Error::LostRace {
            core: ErrorCore::default(),
        })
    }

    fn manage(self: Arc<Self>) {
        loop {
            let interval = self.options.heartbeat_interval_ms;
            let sleep_ms = interval + jitter_ms(&self.guac, interval / 4 + 1);
            std::thread::sleep(Duration::from_millis(sleep_ms));
            let (stop, insync, view) = {
                let state = self.state.lock().unwrap();
                (state.stop, state.insync, state.view.clone())
            };
            if stop {
                break;
            }
            if !insync || !view.is_member(&self.me) {
                self.try_join();
                continue;
            }
            self.heartbeat_members(&view);
            self.catch_up();
            self.suspect_dead(&view);
        }
    }

    /// Close any gap between our applied watermark and the group's.  Proposing a nop at the
    /// missing instance either learns the decided value through the oldinstance path or, if the
    /// instance genuinely never decided, decides something harmless.
    fn catch_up(&self) {
        for _ in 0..64 {
            let (next, target, members, stop) = {
                let state = self.state.lock().unwrap();
                (
                    state.applied + 1,
                    state.peer_applied,
                    state.view.members.clone(),
                    state.stop,
                )
            };
            if stop || next > target {
                return;
            }
            let _submitting = self.submit_lock.lock().unwrap();
            let packed = stack_pack(&LogEntry::Nop).to_vec();
            if self.proposer.run(next, &members, &packed).is_err() {
                return;
            }
            let state = self.state.lock().unwrap();
            if state.applied < next {
                // No progress this round; leave it for the next tick.
                return;
            }
        }
    }

    fn heartbeat_members(&self, view: &View) {
        let ctx = rpc_pb::Context::default();
        let mut stale = false;
        for member in view.members.iter() {
            if member == &self.me {
                continue;
            }
            HEARTBEATS_SENT.click();
            let client = ReplicaClient::new(self.handles.handle(member));
            let req = HeartbeatRequest {
                from: self.me.clone(),
                view_id: view.view_id,
            };
            match client.heartbeat(&ctx, req) {
                Ok(resp) => {
                    let mut state = self.state.lock().unwrap();
                    state.last_heard.insert(member.clone(), Instant::now());
                    state.peer_applied = std::cmp::max(state.peer_applied, resp.applied);
                    if resp.view_id > state.view.view_id {
                        stale = true;
                    }
                }
                Err(err) => {
                    if let Error::RpcError { what, .. } = &err {
                        if busywire::is_transport_error(what) {
                            self.handles.evict(member);
                        }
                    }
                }
            }
        }
        if stale {
            // The group moved on without us; catch up through a fresh snapshot.
            REJOINS.click();
            let mut state = self.state.lock().unwrap();
            state.insync = false;
        }
    }

    fn suspect_dead(&self, view: &View) {
        let dead_after = Duration::from_millis(self.options.dead_after_ms);
        let primary = view.primary().map(String::from);
        let i_am_primary = primary.as_deref() == Some(self.me.as_str());
        let mut suspects = Vec::new();
        {
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            for member in view.members.iter() {
                if member == &self.me {
                    continue;
                }
                let heard = *state
                    .last_heard
                    .entry(member.clone())
                    .or_insert(now);
                if now.duration_since(heard) > dead_after {
                    suspects.push(member.clone());
                }
            }
        }
        for suspect in suspects.into_iter() {
            let suspect_is_primary = primary.as_deref() == Some(suspect.as_str());
            // The primary prunes dead backups; backups only move against a dead primary, so a
            // view change needs one of the two to be involved.
            if !i_am_primary && !suspect_is_primary {
                continue;
            }
            clue!(COLLECTOR, INFO, {
                suspect_dead: suspect.clone(),
            });
            let members: Vec<String> = view
                .members
                .iter()
                .filter(|m| **m != suspect)
                .cloned()
                .collect();
            if let Err(err) = self.propose_reconfigure(members) {
                clue!(COLLECTOR, DEBUG, {
                    view_change_failed: err.to_string(),
                });
            }
        }
    }

    fn try_join(&self) {
        let (mut targets, view_id) = {
            let state = self.state.lock().unwrap();
            let mut targets: Vec<String> = state
                .view
                .members
                .iter()
                .filter(|m| **m != self.me)
                .cloned()
                .collect();
            for seed in self.seeds.iter() {
                if *seed != self.me && !targets.contains(seed) {
                    targets.push(seed.clone());
                }
            }
            (targets, state.view.view_id)
        };
        // A primary that bootstrapped alone has nobody to join.
        if targets.is_empty() {
            let mut state = self.state.lock().unwrap();
            if state.view.is_member(&self.me) {
                state.insync = true;
            }
            return;
        }
        let ctx = rpc_pb::Context::default();
        while let Some(target) = targets.first().cloned() {
            targets.remove(0);
            let client = ReplicaClient::new(self.handles.handle(&target));
            let req = JoinRequest {
                me: self.me.clone(),
            };
            match client.join(&ctx, req) {
                Ok(resp) => {
                    let xfer = self.xfer.lock().unwrap().clone();
                    let mut state = self.state.lock().unwrap();
                    if resp.view.view_id < view_id {
                        return;
                    }
                    if let Some(xfer) = xfer {
                        xfer.unmarshal_state(&resp.state);
                    }
                    clue!(COLLECTOR, INFO, {
                        joined: {
                            view: resp.view.to_string(),
                            applied: resp.applied as u64,
                        },
                    });
                    let now = Instant::now();
                    state.last_heard.clear();
                    for member in resp.view.members.iter() {
                        state.last_heard.insert(member.clone(), now);
                    }
                    state.view = resp.view;
                    state.applied = std::cmp::max(state.applied, resp.applied);
                    let applied = state.applied;
                    state.backlog.retain(|instance, _| *instance > applied);
                    state.insync = true;
                    self.applied_cv.notify_all();
                    return;
                }
                Err(Error::NotPrimary { view, .. }) => {
                    if let Some(primary) = view.primary() {
                        if primary != self.me && !targets.contains(&primary.to_string()) {
                            targets.insert(0, primary.to_string());
                        }
                    }
                }
                Err(err) => {
                    if let Error::RpcError { what, .. } = &err {
                        if busywire::is_transport_error(what) {
                            self.handles.evict(&target);
                        }
                    }
                }
            }
        }
    }
}

//////////////////////////////////////////// the service ///////////////////////////////////////////

impl ReplicaService for Replica {
    fn invoke(&self, _: &rpc_pb::Context, req: InvokeRequest) -> Result<InvokeResponse, Error> {
        let seq = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.insync {
                return Err(Error::Busy {
                    core: ErrorCore::default(),
                });
            }
            if state.view.primary() != Some(self.inner.me.as_str()) {
                return Err(Error::NotPrimary {
                    core: ErrorCore::default(),
                    view: state.view.clone(),
                });
            }
            state.seq += 1;
            state.seq
        };
        let entry = LogEntry::Invoke {
            origin: self.inner.me.clone(),
            seq,
            method: req.method,
            body: req.body,
        };
        match self.inner.submit(entry)? {
            Some(reply) => Ok(InvokeResponse { reply }),
            None => Err(Error::LostRace {
                core: ErrorCore::default(),
            }),
        }
    }

    fn view(&self, _: &rpc_pb::Context, _: ViewRequest) -> Result<ViewResponse, Error> {
        let state = self.inner.state.lock().unwrap();
        Ok(ViewResponse {
            view: state.view.clone(),
            applied: state.applied,
        })
    }

    fn join(&self, _: &rpc_pb::Context, req: JoinRequest) -> Result<JoinResponse, Error> {
        if !self.amiprimary() {
            let state = self.inner.state.lock().unwrap();
            return Err(Error::NotPrimary {
                core: ErrorCore::default(),
                view: state.view.clone(),
            });
        }
        let members = {
            let state = self.inner.state.lock().unwrap();
            state.view.members.clone()
        };
        if !members.contains(&req.me) {
            let mut members = members;
            members.push(req.me.clone());
            self.inner.propose_reconfigure(members)?;
        }
        JOINS_SERVED.click();
        let xfer = self.inner.xfer.lock().unwrap().clone();
        let state = self.inner.state.lock().unwrap();
        let snapshot = match xfer {
            Some(xfer) => xfer.marshal_state(),
            None => Vec::new(),
        };
        Ok(JoinResponse {
            view: state.view.clone(),
            applied: state.applied,
            state: snapshot,
        })
    }

    fn heartbeat(
        &self,
        _: &rpc_pb::Context,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, Error> {
        let mut state = self.inner.state.lock().unwrap();
        state.last_heard.insert(req.from, Instant::now());
        Ok(HeartbeatResponse {
            view_id: state.view.view_id,
            applied: state.applied,
        })
    }
}
