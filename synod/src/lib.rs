#![doc = include_str!("../README.md")]

use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use biometrics::{Collector, Counter};
use indicio::{clue, ALWAYS, DEBUG, ERROR, INFO};
use zerror_core::ErrorCore;

use busywire::Handles;
use synod_pb::{
    AcceptRequest, AcceptorClient, AcceptorService, DecideRequest, Error, PrepareRequest,
    PrepareResponse, Proposal,
};

pub mod log;

use log::{Log, LogRecord};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PREPARE_SERVED: Counter = Counter::new("synod.acceptor.prepare");
static ACCEPT_SERVED: Counter = Counter::new("synod.acceptor.accept");
static DECIDE_SERVED: Counter = Counter::new("synod.acceptor.decide");
static COMMITTED: Counter = Counter::new("synod.acceptor.committed");
static RUNS: Counter = Counter::new("synod.proposer.runs");
static RUNS_DECIDED: Counter = Counter::new("synod.proposer.runs_decided");
static RUNS_LOST: Counter = Counter::new("synod.proposer.runs_lost");
static OLD_INSTANCE: Counter = Counter::new("synod.proposer.oldinstance");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PREPARE_SERVED);
    collector.register_counter(&ACCEPT_SERVED);
    collector.register_counter(&DECIDE_SERVED);
    collector.register_counter(&COMMITTED);
    collector.register_counter(&RUNS);
    collector.register_counter(&RUNS_DECIDED);
    collector.register_counter(&RUNS_LOST);
    collector.register_counter(&OLD_INSTANCE);
    log::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Commit /////////////////////////////////////////////

/// The upcall invoked once per decided instance, in no particular order across instances.  The
/// acceptor mutex is released when this runs.
pub trait Commit: Send + Sync + 'static {
    /// `value` was decided for `instance`.
    fn commit(&self, instance: u32, value: &[u8]);
}

////////////////////////////////////////////// majority ////////////////////////////////////////////

/// True iff `subset` contains a majority of `nodes`.
pub fn majority(nodes: &[String], subset: &[String]) -> bool {
    let count = nodes.iter().filter(|n| subset.contains(n)).count();
    count >= nodes.len() / 2 + 1
}

////////////////////////////////////////////// Acceptor ////////////////////////////////////////////

struct AcceptorState {
    n_h: Proposal,
    n_a: Proposal,
    v_a: Vec<u8>,
    instance_h: u32,
    values: std::collections::BTreeMap<u32, Vec<u8>>,
    log: Log,
}

/// The acceptor half of the protocol.  One acceptor serves every instance this node
/// participates in; decided instances are immutable and the synod state resets when an
/// instance commits.
pub struct Acceptor {
    me: String,
    state: Mutex<AcceptorState>,
    upcall: Mutex<Option<Weak<dyn Commit>>>,
}

impl Acceptor {
    /// Open (or create) the acceptor whose durable state lives at `log_path`.  When the log is
    /// fresh and `first` is set, instance 1 is seeded with `initial_value`; this bootstraps a
    /// new group.
    pub fn new<P: AsRef<Path>>(
        me: &str,
        log_path: P,
        first: bool,
        initial_value: &[u8],
    ) -> Result<Acceptor, Error> {
        let (log, records) = Log::open(log_path)?;
        let fresh = records.is_empty();
        let mut state = AcceptorState {
            n_h: Proposal {
                number: 0,
                node: me.to_string(),
            },
            n_a: Proposal {
                number: 0,
                node: me.to_string(),
            },
            v_a: Vec::new(),
            instance_h: 0,
            values: std::collections::BTreeMap::new(),
            log,
        };
        for record in records.into_iter() {
            Self::replay(me, &mut state, record);
        }
        let acceptor = Acceptor {
            me: me.to_string(),
            state: Mutex::new(state),
            upcall: Mutex::new(None),
        };
        if fresh && first {
            let mut state = acceptor.state.lock().unwrap();
            state.log.append(&LogRecord::Decided {
                instance: 1,
                v: initial_value.to_vec(),
            })?;
            state.values.insert(1, initial_value.to_vec());
            state.instance_h = 1;
        }
        Ok(acceptor)
    }

    fn replay(me: &str, state: &mut AcceptorState, record: LogRecord) {
        match record {
            LogRecord::Nop => {}
            LogRecord::Prepared { n_h } => {
                state.n_h = n_h;
            }
            LogRecord::Accepted { n_a, v_a } => {
                state.n_a = n_a;
                state.v_a = v_a;
            }
            LogRecord::Decided { instance, v } => {
                state.values.insert(instance, v);
                if instance > state.instance_h {
                    state.instance_h = instance;
                    Self::reset_synod(me, state);
                }
            }
        }
    }

    fn reset_synod(me: &str, state: &mut AcceptorState) {
        state.n_h = Proposal {
            number: 0,
            node: me.to_string(),
        };
        state.n_a = Proposal {
            number: 0,
            node: me.to_string(),
        };
        state.v_a.clear();
    }

    /// Register the commit upcall.  At most one is supported.
    pub fn set_commit_upcall(&self, upcall: Weak<dyn Commit>) {
        *self.upcall.lock().unwrap() = Some(upcall);
    }

    /// This node's identity.
    pub fn me(&self) -> &str {
        &self.me
    }

    /// The highest proposal this acceptor has promised.
    pub fn highest_promised(&self) -> Proposal {
        self.state.lock().unwrap().n_h.clone()
    }

    /// The highest decided instance, or zero if nothing has decided.
    pub fn highest_decided(&self) -> u32 {
        self.state.lock().unwrap().instance_h
    }

    /// The decided value for `instance`, if this acceptor learned it.
    pub fn decided_value(&self, instance: u32) -> Option<Vec<u8>> {
        self.state.lock().unwrap().values.get(&instance).cloned()
    }

    /// Commit a value this node learned out-of-band (the proposer's oldinstance path).
    pub fn commit(&self, instance: u32, value: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let notify = self.commit_locked(&mut state, instance, value)?;
        drop(state);
        if notify {
            self.notify_upcall(instance, value);
        }
        Ok(())
    }

    fn commit_locked(
        &self,
        state: &mut AcceptorState,
        instance: u32,
        value: &[u8],
    ) -> Result<bool, Error> {
        if instance <= state.instance_h {
            return Ok(false);
        }
        COMMITTED.click();
        state.log.append(&LogRecord::Decided {
            instance,
            v: value.to_vec(),
        })?;
        state.values.insert(instance, value.to_vec());
        state.instance_h = instance;
        Self::reset_synod(&self.me, state);
        clue!(COLLECTOR, INFO, {
            committed: {
                instance: instance as u64,
            },
        });
        Ok(true)
    }

    fn notify_upcall(&self, instance: u32, value: &[u8]) {
        let upcall = self.upcall.lock().unwrap().clone();
        if let Some(upcall) = upcall {
            if let Some(upcall) = upcall.upgrade() {
                upcall.commit(instance, value);
            }
        }
    }

    fn prepare(&self, req: PrepareRequest) -> Result<PrepareResponse, Error> {
        PREPARE_SERVED.click();
        let mut state = self.state.lock().unwrap();
        let mut resp = PrepareResponse::default();
        if req.instance <= state.instance_h {
            resp.oldinstance = true;
            resp.instance_v = state.values.get(&req.instance).cloned().unwrap_or_default();
            return Ok(resp);
        }
        if req.n > state.n_h {
            state.n_h = req.n;
            let n_h = state.n_h.clone();
            state.log.append(&LogRecord::Prepared { n_h })?;
            resp.accept = true;
            resp.n_a = state.n_a.clone();
            resp.v_a = state.v_a.clone();
            return Ok(resp);
        }
        // Rejected; tell the proposer how far it is behind.
        resp.n_h = state.n_h.clone();
        Ok(resp)
    }

    fn accept(&self, req: AcceptRequest) -> Result<bool, Error> {
        ACCEPT_SERVED.click();
        let mut state = self.state.lock().unwrap();
        if req.n >= state.n_h && req.instance > state.instance_h {
            state.n_a = req.n;
            state.v_a = req.v;
            let n_a = state.n_a.clone();
            let v_a = state.v_a.clone();
            state.log.append(&LogRecord::Accepted { n_a, v_a })?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn decide(&self, req: DecideRequest) -> Result<(), Error> {
        DECIDE_SERVED.click();
        let mut state = self.state.lock().unwrap();
        if req.instance > state.instance_h + 1 {
            // This acceptor slept through earlier instances.  Jump forward; the skipped values
            // stay unknown here and the replica layer recovers them from its peers.
            clue!(COLLECTOR, ERROR, {
                decide_gap: {
                    instance: req.instance as u64,
                    instance_h: state.instance_h as u64,
                },
            });
        }
        let notify = self.commit_locked(&mut state, req.instance, &req.v)?;
        drop(state);
        if notify {
            self.notify_upcall(req.instance, &req.v);
        }
        Ok(())
    }
}

impl AcceptorService for Arc<Acceptor> {
    fn prepare(
        &self,
        _: &rpc_pb::Context,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, Error> {
        Acceptor::prepare(self, req)
    }

    fn accept(
        &self,
        _: &rpc_pb::Context,
        req: AcceptRequest,
    ) -> Result<synod_pb::AcceptResponse, Error> {
        let accepted = Acceptor::accept(self, req)?;
        Ok(synod_pb::AcceptResponse { accepted })
    }

    fn decide(
        &self,
        _: &rpc_pb::Context,
        req: DecideRequest,
    ) -> Result<synod_pb::DecideResponse, Error> {
        Acceptor::decide(self, req)?;
        Ok(synod_pb::DecideResponse {})
    }
}

///////////////////////////////////////////// Breakpoint ///////////////////////////////////////////

/// Test-harness breakpoints.  An armed breakpoint exits the process when the proposer reaches
/// it, simulating a proposer that dies between phases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Breakpoint {
    /// Between the prepare and accept phases.
    AfterPrepare,
    /// Between the accept and decide phases.
    AfterAccept,
}

////////////////////////////////////////////// Proposer ////////////////////////////////////////////

struct ProposerState {
    my_n: u64,
    running: bool,
    break_after_prepare: bool,
    break_after_accept: bool,
}

/// The proposer half of the protocol.  One run drives one instance through
/// prepare/accept/decide; at most one run is active per node at a time.
pub struct Proposer {
    me: String,
    acceptor: Arc<Acceptor>,
    handles: Arc<Handles>,
    state: Mutex<ProposerState>,
}

impl Proposer {
    /// Create a proposer for this node.  `handles` should carry the 1-second call timeout used
    /// for all synod RPCs.
    pub fn new(me: &str, acceptor: Arc<Acceptor>, handles: Arc<Handles>) -> Proposer {
        Proposer {
            me: me.to_string(),
            acceptor,
            handles,
            state: Mutex::new(ProposerState {
                my_n: 0,
                running: false,
                break_after_prepare: false,
                break_after_accept: false,
            }),
        }
    }

    /// True iff a run is in flight.
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Arm a breakpoint.
    pub fn arm_breakpoint(&self, breakpoint: Breakpoint) {
        let mut state = self.state.lock().unwrap();
        match breakpoint {
            Breakpoint::AfterPrepare => state.break_after_prepare = true,
            Breakpoint::AfterAccept => state.break_after_accept = true,
        }
    }

    /// Drive one instance.  Returns Ok(true) iff a majority of `nodes` accepted a value (not
    /// necessarily `v_new`: a previously-accepted value wins adoption).  Ok(false) means the run
    /// failed recoverably; re-run after the decided value, if any, has been observed.
    pub fn run(&self, instance: u32, nodes: &[String], v_new: &[u8]) -> Result<bool, Error> {
        let n = {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(Error::AlreadyRunning {
                    core: ErrorCore::default(),
                });
            }
            state.running = true;
            let floor = self.acceptor.highest_promised().number;
            state.my_n = std::cmp::max(state.my_n, floor) + 1;
            Proposal {
                number: state.my_n,
                node: self.me.clone(),
            }
        };
        RUNS.click();
        clue!(COLLECTOR, DEBUG, {
            run: {
                instance: instance as u64,
                n: n.to_string(),
            },
        });
        let result = self.run_phases(instance, nodes, v_new, n);
        self.state.lock().unwrap().running = false;
        result
    }

    fn run_phases(
        &self,
        instance: u32,
        nodes: &[String],
        v_new: &[u8],
        n: Proposal,
    ) -> Result<bool, Error> {
        let ctx = rpc_pb::Context::default();
        // Prepare phase.
        let mut accepts: Vec<String> = Vec::new();
        let mut highest: Option<Proposal> = None;
        let mut v: Vec<u8> = Vec::new();
        for node in nodes.iter() {
            let client = AcceptorClient::new(self.handles.handle(node));
            let req = PrepareRequest {
                instance,
                n: n.clone(),
            };
            let res = match client.prepare(&ctx, req) {
                Ok(res) => res,
                Err(err) => {
                    self.observe_error(node, &err);
                    continue;
                }
            };
            if res.oldinstance {
                OLD_INSTANCE.click();
                // An empty value means the acceptor only knows the instance was decided, not
                // what it decided; the caller recovers through state transfer instead.
                if !res.instance_v.is_empty() {
                    self.acceptor.commit(instance, &res.instance_v)?;
                }
                return Ok(false);
            }
            if res.accept {
                accepts.push(node.clone());
                if highest.as_ref().map(|h| res.n_a > *h).unwrap_or(true) {
                    highest = Some(res.n_a);
                    v = res.v_a;
                }
            } else {
                // Rejected: remember the promise we lost to so the next run starts above it.
                let mut state = self.state.lock().unwrap();
                state.my_n = std::cmp::max(state.my_n, res.n_h.number);
            }
        }
        if !majority(nodes, &accepts) {
            RUNS_LOST.click();
            return Ok(false);
        }
        if v.is_empty() {
            v = v_new.to_vec();
        }
        self.fire_breakpoint(Breakpoint::AfterPrepare);
        // Accept phase, against the nodes that promised.
        let promised = accepts;
        let mut accepts: Vec<String> = Vec::new();
        for node in promised.iter() {
            let client = AcceptorClient::new(self.handles.handle(node));
            let req = AcceptRequest {
                instance,
                n: n.clone(),
                v: v.clone(),
            };
            match client.accept(&ctx, req) {
                Ok(res) if res.accepted => accepts.push(node.clone()),
                Ok(_) => {}
                Err(err) => self.observe_error(node, &err),
            }
        }
        if !majority(nodes, &accepts) {
            RUNS_LOST.click();
            return Ok(false);
        }
        self.fire_breakpoint(Breakpoint::AfterAccept);
        // Decide phase, against the nodes that accepted.
        for node in accepts.iter() {
            let client = AcceptorClient::new(self.handles.handle(node));
            let req = DecideRequest {
                instance,
                v: v.clone(),
            };
            if let Err(err) = client.decide(&ctx, req) {
                self.observe_error(node, &err);
            }
        }
        RUNS_DECIDED.click();
        Ok(true)
    }

    fn observe_error(&self, node: &str, err: &Error) {
        if let Error::RpcError { what, .. } = err {
            if busywire::is_transport_error(what) {
                self.handles.evict(node);
            }
        }
        clue!(COLLECTOR, DEBUG, {
            rpc_error: {
                node: node.to_string(),
                what: err.to_string(),
            },
        });
    }

    fn fire_breakpoint(&self, breakpoint: Breakpoint) {
        let armed = {
            let state = self.state.lock().unwrap();
            match breakpoint {
                Breakpoint::AfterPrepare => state.break_after_prepare,
                Breakpoint::AfterAccept => state.break_after_accept,
            }
        };
        if armed {
            clue!(COLLECTOR, ALWAYS, {
                breakpoint: format!("{:?}", breakpoint),
            });
            std::process::exit(1);
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_log_path(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "synod-acceptor-{}-{}-{}",
            name,
            std::process::id(),
            TEST_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn proposal(number: u64, node: &str) -> Proposal {
        Proposal {
            number,
            node: node.to_string(),
        }
    }

    #[test]
    fn majority_counts_members_only() {
        let nodes = vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ];
        assert!(!majority(&nodes, &[]));
        assert!(!majority(&nodes, &["a".to_string()]));
        assert!(majority(&nodes, &["a".to_string(), "c".to_string()]));
        // Non-members do not help.
        assert!(!majority(&nodes, &["a".to_string(), "z".to_string()]));
    }

    #[test]
    fn acceptor_promises_in_order() {
        let path = test_log_path("promises");
        let acceptor = Acceptor::new("n1", &path, false, &[]).unwrap();
        let resp = acceptor
            .prepare(PrepareRequest {
                instance: 1,
                n: proposal(5, "n2"),
            })
            .unwrap();
        assert!(resp.accept);
        // A lower proposal is rejected and told what to beat.
        let resp = acceptor
            .prepare(PrepareRequest {
                instance: 1,
                n: proposal(4, "n3"),
            })
            .unwrap();
        assert!(!resp.accept);
        assert!(!resp.oldinstance);
        assert_eq!(proposal(5, "n2"), resp.n_h);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn acceptor_accepts_at_or_above_promise() {
        let path = test_log_path("accepts");
        let acceptor = Acceptor::new("n1", &path, false, &[]).unwrap();
        acceptor
            .prepare(PrepareRequest {
                instance: 1,
                n: proposal(5, "n2"),
            })
            .unwrap();
        assert!(!acceptor
            .accept(AcceptRequest {
                instance: 1,
                n: proposal(4, "n3"),
                v: b"lower".to_vec(),
            })
            .unwrap());
        assert!(acceptor
            .accept(AcceptRequest {
                instance: 1,
                n: proposal(5, "n2"),
                v: b"decree".to_vec(),
            })
            .unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn decide_is_idempotent_and_resets_the_synod() {
        let path = test_log_path("decide");
        let acceptor = Acceptor::new("n1", &path, false, &[]).unwrap();
        acceptor
            .prepare(PrepareRequest {
                instance: 1,
                n: proposal(5, "n2"),
            })
            .unwrap();
        acceptor
            .accept(AcceptRequest {
                instance: 1,
                n: proposal(5, "n2"),
                v: b"decree".to_vec(),
            })
            .unwrap();
        acceptor
            .decide(DecideRequest {
                instance: 1,
                v: b"decree".to_vec(),
            })
            .unwrap();
        assert_eq!(1, acceptor.highest_decided());
        assert_eq!(Some(b"decree".to_vec()), acceptor.decided_value(1));
        // Duplicate decides are no-ops.
        acceptor
            .decide(DecideRequest {
                instance: 1,
                v: b"decree".to_vec(),
            })
            .unwrap();
        assert_eq!(1, acceptor.highest_decided());
        // The synod state reset; a fresh proposal for instance 2 is acceptable.
        let resp = acceptor
            .prepare(PrepareRequest {
                instance: 2,
                n: proposal(1, "n3"),
            })
            .unwrap();
        assert!(resp.accept);
        assert!(resp.v_a.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn decided_instances_answer_oldinstance() {
        let path = test_log_path("oldinstance");
        let acceptor = Acceptor::new("n1", &path, true, b"view1").unwrap();
        let resp = acceptor
            .prepare(PrepareRequest {
                instance: 1,
                n: proposal(9, "n2"),
            })
            .unwrap();
        assert!(resp.oldinstance);
        assert_eq!(b"view1".to_vec(), resp.instance_v);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn restart_replays_the_log() {
        let path = test_log_path("restart");
        {
            let acceptor = Acceptor::new("n1", &path, false, &[]).unwrap();
            acceptor
                .prepare(PrepareRequest {
                    instance: 1,
                    n: proposal(5, "n2"),
                })
                .unwrap();
            acceptor
                .accept(AcceptRequest {
                    instance: 1,
                    n: proposal(5, "n2"),
                    v: b"decree".to_vec(),
                })
                .unwrap();
            acceptor
                .decide(DecideRequest {
                    instance: 1,
                    v: b"decree".to_vec(),
                })
                .unwrap();
        }
        let acceptor = Acceptor::new("n1", &path, false, &[]).unwrap();
        assert_eq!(1, acceptor.highest_decided());
        assert_eq!(Some(b"decree".to_vec()), acceptor.decided_value(1));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn restart_mid_synod_keeps_the_promise() {
        let path = test_log_path("mid-synod");
        {
            let acceptor = Acceptor::new("n1", &path, false, &[]).unwrap();
            acceptor
                .prepare(PrepareRequest {
                    instance: 1,
                    n: proposal(5, "n2"),
                })
                .unwrap();
        }
        let acceptor = Acceptor::new("n1", &path, false, &[]).unwrap();
        let resp = acceptor
            .prepare(PrepareRequest {
                instance: 1,
                n: proposal(4, "n3"),
            })
            .unwrap();
        assert!(!resp.accept);
        assert_eq!(proposal(5, "n2"), resp.n_h);
        let _ = std::fs::remove_file(&path);
    }
}
