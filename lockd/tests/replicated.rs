//! The lock service behind a three-member replicated group: every client call is ordered
//! through the decided log, backups apply the same state, only the primary dispatches
//! callbacks, and the service keeps its lock table across a primary failure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use busywire::{ClientOptions, Handles, Mesh, ServiceRegistry};
use lockd::{LockClient, LockServer};
use rsm::{Replica, ReplicaOptions, RsmClient};

static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

struct Member {
    addr: String,
    replica: Replica,
    server: Arc<LockServer>,
    log_path: std::path::PathBuf,
}

struct Group {
    mesh: Mesh,
    seeds: Vec<String>,
    run: u64,
    members: Vec<Member>,
}

impl Group {
    fn new(seeds: &[&str]) -> Group {
        Group {
            mesh: Mesh::new(),
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
            run: TEST_SEQ.fetch_add(1, Ordering::Relaxed),
            members: Vec::new(),
        }
    }

    fn spawn(&mut self, addr: &str) {
        let options = ReplicaOptions {
            heartbeat_interval_ms: 50,
            dead_after_ms: 500,
            propose_attempts: 8,
        };
        let log_path = std::env::temp_dir().join(format!(
            "lockd-replicated-{}-{}-{}",
            std::process::id(),
            self.run,
            addr,
        ));
        let _ = std::fs::remove_file(&log_path);
        let synod_handles = Arc::new(Handles::new(
            ClientOptions::default().with_call_timeout_ms(1_000),
            Arc::new(self.mesh.clone()),
        ));
        let replica = Replica::new(
            options,
            addr,
            &log_path,
            self.seeds.clone(),
            synod_handles,
        )
        .unwrap();
        let callback_handles = Arc::new(Handles::new(
            ClientOptions::default().with_call_timeout_ms(1_000),
            Arc::new(self.mesh.clone()),
        ));
        let server = LockServer::new(Arc::new(replica.clone()), callback_handles);
        server.attach_to_replica(&replica);
        let mut services = ServiceRegistry::new();
        replica.register_services(&mut services);
        self.mesh.register(addr, Arc::new(services));
        replica.start();
        self.members.push(Member {
            addr: addr.to_string(),
            replica,
            server,
            log_path,
        });
    }

    fn member(&self, addr: &str) -> &Member {
        self.members.iter().find(|m| m.addr == addr).unwrap()
    }

    fn lock_client(&self, callback_addr: &str) -> LockClient {
        let handles = Arc::new(Handles::new(
            ClientOptions::default().with_call_timeout_ms(1_000),
            Arc::new(self.mesh.clone()),
        ));
        let rsm_client = Arc::new(RsmClient::new(handles, self.seeds.clone()));
        LockClient::with_mesh(&self.mesh, callback_addr, rsm_client, None)
    }

    fn wait_until<F: FnMut() -> bool>(&self, what: &str, mut predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        panic!("timed out waiting for {}", what);
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        for member in self.members.iter() {
            member.replica.stop();
            let _ = std::fs::remove_file(&member.log_path);
        }
    }
}

#[test]
fn locks_flow_through_the_replicated_group() {
    let mut group = Group::new(&["node1", "node2", "node3"]);
    group.spawn("node1");
    group.spawn("node2");
    group.spawn("node3");
    group.wait_until("three members", || {
        group.member("node1").replica.view().members.len() == 3
    });
    let client = group.lock_client("127.0.0.1:4000");
    client.acquire(7).unwrap();
    client.release(7).unwrap();
    assert_eq!(1, client.stat(7).unwrap());
    // Backups applied the same log entries as the primary.
    group.wait_until("backups to apply the grant", || {
        group
            .members
            .iter()
            .all(|m| m.server.stat(7).nacquire == 1)
    });
}

#[test]
fn contention_is_served_by_the_primary_only() {
    let mut group = Group::new(&["node1", "node2", "node3"]);
    group.spawn("node1");
    group.spawn("node2");
    group.spawn("node3");
    group.wait_until("three members", || {
        group.member("node1").replica.view().members.len() == 3
    });
    let a = Arc::new(group.lock_client("127.0.0.1:4000"));
    let b = Arc::new(group.lock_client("127.0.0.1:4001"));
    a.acquire(9).unwrap();
    let b_acquired = Arc::new(AtomicBool::new(false));
    let b_thread = {
        let b = Arc::clone(&b);
        let b_acquired = Arc::clone(&b_acquired);
        std::thread::spawn(move || {
            b.acquire(9).unwrap();
            b_acquired.store(true, Ordering::SeqCst);
            b.release(9).unwrap();
        })
    };
    std::thread::sleep(Duration::from_millis(300));
    assert!(!b_acquired.load(Ordering::SeqCst));
    a.release(9).unwrap();
    b_thread.join().unwrap();
    assert!(b_acquired.load(Ordering::SeqCst));
}

#[test]
fn lock_state_survives_primary_failure() {
    let mut group = Group::new(&["node1", "node2", "node3"]);
    group.spawn("node1");
    group.spawn("node2");
    group.spawn("node3");
    group.wait_until("three members", || {
        group.member("node1").replica.view().members.len() == 3
    });
    let a = Arc::new(group.lock_client("127.0.0.1:4000"));
    let b = Arc::new(group.lock_client("127.0.0.1:4001"));
    a.acquire(5).unwrap();
    // The primary dies while a client holds the lock.
    group.mesh.set_down("node1", true);
    group.wait_until("a new primary", || {
        group
            .members
            .iter()
            .filter(|m| m.addr != "node1")
            .any(|m| m.replica.amiprimary())
    });
    // The new primary remembers who owns lock 5, revokes it from a, and hands it to b.
    let b_thread = {
        let b = Arc::clone(&b);
        std::thread::spawn(move || {
            b.acquire(5).unwrap();
            b.release(5).unwrap();
        })
    };
    std::thread::sleep(Duration::from_millis(300));
    a.release(5).unwrap();
    b_thread.join().unwrap();
    assert!(a.stat(5).unwrap() >= 2);
}
