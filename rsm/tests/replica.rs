//! A three-replica group on an in-process mesh, exercised through the view-following client:
//! bootstrap and join, ordered application at every replica, primary failover, and snapshot
//! state transfer for a late joiner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use busywire::{ClientOptions, Handles, Mesh, ServiceRegistry};
use rsm::{Replica, ReplicaOptions, RsmClient, StateTransfer};

static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

//////////////////////////////////////////// the machine ///////////////////////////////////////////

/// A counter: every "add" bumps it and replies with the new total, little-endian.
#[derive(Default)]
struct CounterMachine {
    count: Mutex<u64>,
}

impl CounterMachine {
    fn get(&self) -> u64 {
        *self.count.lock().unwrap()
    }
}

impl StateTransfer for CounterMachine {
    fn marshal_state(&self) -> Vec<u8> {
        self.count.lock().unwrap().to_le_bytes().to_vec()
    }

    fn unmarshal_state(&self, state: &[u8]) {
        let mut bytes = [0u8; 8];
        if state.len() == 8 {
            bytes.copy_from_slice(state);
        }
        *self.count.lock().unwrap() = u64::from_le_bytes(bytes);
    }
}

//////////////////////////////////////////// the harness ///////////////////////////////////////////

struct TestNode {
    addr: String,
    replica: Replica,
    machine: Arc<CounterMachine>,
    log_path: std::path::PathBuf,
}

struct Harness {
    mesh: Mesh,
    name: String,
    seeds: Vec<String>,
    run: u64,
    nodes: Vec<TestNode>,
}

fn fast_options() -> ReplicaOptions {
    ReplicaOptions {
        heartbeat_interval_ms: 50,
        dead_after_ms: 500,
        propose_attempts: 8,
    }
}

impl Harness {
    fn new(name: &str, seeds: &[&str]) -> Harness {
        Harness {
            mesh: Mesh::new(),
            name: name.to_string(),
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
            run: TEST_SEQ.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
        }
    }

    fn log_path(&self, addr: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "rsm-replica-{}-{}-{}-{}",
            self.name,
            std::process::id(),
            self.run,
            addr,
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn spawn(&mut self, addr: &str) {
        let handles = Arc::new(Handles::new(
            ClientOptions::default().with_call_timeout_ms(1_000),
            Arc::new(self.mesh.clone()),
        ));
        let log_path = self.log_path(addr);
        let replica = Replica::new(
            fast_options(),
            addr,
            &log_path,
            self.seeds.clone(),
            handles,
        )
        .unwrap();
        let machine = Arc::new(CounterMachine::default());
        let handler_machine = Arc::clone(&machine);
        replica.reg(
            "add",
            Box::new(move |_body: &[u8]| {
                let mut count = handler_machine.count.lock().unwrap();
                *count += 1;
                Ok(count.to_le_bytes().to_vec())
            }),
        );
        replica.set_state_transfer(Arc::clone(&machine) as Arc<dyn StateTransfer>);
        let mut services = ServiceRegistry::new();
        replica.register_services(&mut services);
        self.mesh.register(addr, Arc::new(services));
        replica.start();
        self.nodes.push(TestNode {
            addr: addr.to_string(),
            replica,
            machine,
            log_path,
        });
    }

    fn node(&self, addr: &str) -> &TestNode {
        self.nodes.iter().find(|n| n.addr == addr).unwrap()
    }

    fn client(&self) -> RsmClient {
        let handles = Arc::new(Handles::new(
            ClientOptions::default().with_call_timeout_ms(1_000),
            Arc::new(self.mesh.clone()),
        ));
        RsmClient::new(handles, self.seeds.clone())
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

impl Drop for Harness {
    fn drop(&mut self) {
        for node in self.nodes.iter() {
            node.replica.stop();
            let _ = std::fs::remove_file(&node.log_path);
        }
    }
}

fn add(client: &RsmClient) -> u64 {
    let ctx = rpc_pb::Context::default();
    let reply = client.call(&ctx, "add", &[]).unwrap();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&reply);
    u64::from_le_bytes(bytes)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[test]
fn single_node_group_serves() {
    let mut harness = Harness::new("single", &["node1"]);
    harness.spawn("node1");
    harness.wait_until("node1 to become primary", || {
        harness.node("node1").replica.amiprimary()
    });
    let client = harness.client();
    assert_eq!(1, add(&client));
    assert_eq!(2, add(&client));
    assert_eq!(2, harness.node("node1").machine.get());
}

#[test]
fn members_join_and_apply_in_order() {
    let mut harness = Harness::new("join", &["node1", "node2", "node3"]);
    harness.spawn("node1");
    harness.spawn("node2");
    harness.spawn("node3");
    harness.wait_until("the view to reach three members", || {
        harness.node("node1").replica.view().members.len() == 3
    });
    let client = harness.client();
    for i in 1..=8u64 {
        assert_eq!(i, add(&client));
    }
    // Every replica applies the same log, so every counter converges.
    harness.wait_until("counters to converge", || {
        harness.nodes.iter().all(|n| n.machine.get() == 8)
    });
}

#[test]
fn primary_failover() {
    let mut harness = Harness::new("failover", &["node1", "node2", "node3"]);
    harness.spawn("node1");
    harness.spawn("node2");
    harness.spawn("node3");
    harness.wait_until("the view to reach three members", || {
        harness.node("node1").replica.view().members.len() == 3
    });
    let client = harness.client();
    assert_eq!(1, add(&client));
    // Kill the primary.  The survivors suspect it, agree on a new view, and keep serving.
    harness.mesh.set_down("node1", true);
    harness.wait_until("a new primary to take over", || {
        harness
            .nodes
            .iter()
            .filter(|n| n.addr != "node1")
            .any(|n| n.replica.amiprimary())
    });
    let count = add(&client);
    assert!(count >= 2);
    // The old primary comes back, notices it is stale, and rejoins the group.
    harness.mesh.set_down("node1", false);
    harness.wait_until("node1 to rejoin", || {
        let view = harness.node("node2").replica.view();
        view.is_member("node1") && harness.node("node1").replica.view().view_id == view.view_id
    });
    let count_after = add(&client);
    harness.wait_until("node1 to catch up", || {
        harness.node("node1").machine.get() == count_after
    });
}

#[test]
fn late_joiner_catches_up_through_a_snapshot() {
    let mut harness = Harness::new("snapshot", &["node1", "node2", "node3"]);
    harness.spawn("node1");
    harness.spawn("node2");
    harness.wait_until("the view to reach two members", || {
        harness.node("node1").replica.view().members.len() == 2
    });
    let client = harness.client();
    for _ in 0..5 {
        add(&client);
    }
    // node3 starts from nothing and must receive the counter through state transfer, not by
    // replaying commands it never saw.
    harness.spawn("node3");
    harness.wait_until("node3 to join", || {
        harness.node("node3").replica.view().members.len() == 3
    });
    harness.wait_until("node3's state to arrive", || {
        harness.node("node3").machine.get() == 5
    });
    let count = add(&client);
    assert_eq!(6, count);
    harness.wait_until("node3 to apply new commands", || {
        harness.node("node3").machine.get() == 6
    });
}
