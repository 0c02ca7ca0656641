//! End-to-end lock exchanges over an in-process mesh: one standalone server, real caching
//! clients with callback listeners, and the full revoke/retry protocol between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use busywire::{ClientOptions, Handles, Mesh, ServiceRegistry};
use lock_pb::LockServiceServer;
use lockd::{AlwaysPrimary, LockClient, LockServer, Releaser};

const SERVER: &str = "127.0.0.1:3772";

fn standalone_server(mesh: &Mesh) -> Arc<LockServer> {
    let handles = Arc::new(Handles::new(
        ClientOptions::default(),
        Arc::new(mesh.clone()),
    ));
    let server = LockServer::new(Arc::new(AlwaysPrimary), handles);
    let mut services = ServiceRegistry::new();
    services.register("LockService", LockServiceServer::bind(Arc::clone(&server)));
    mesh.register(SERVER, Arc::new(services));
    server
}

fn lock_client(mesh: &Mesh, callback_addr: &str, releaser: Option<Arc<dyn Releaser>>) -> LockClient {
    let handles = Handles::new(ClientOptions::default(), Arc::new(mesh.clone()));
    LockClient::with_mesh(mesh, callback_addr, handles.handle(SERVER), releaser)
}

#[test]
fn single_client_caches_the_lock() {
    let mesh = Mesh::new();
    let _server = standalone_server(&mesh);
    let client = lock_client(&mesh, "127.0.0.1:4000", None);
    client.acquire(7).unwrap();
    client.release(7).unwrap();
    // The second acquire is served from cache; the server still counts one grant.
    client.acquire(7).unwrap();
    client.release(7).unwrap();
    assert_eq!(1, client.stat(7).unwrap());
}

#[test]
fn contended_lock_moves_between_clients() {
    let mesh = Mesh::new();
    let _server = standalone_server(&mesh);
    let a = Arc::new(lock_client(&mesh, "127.0.0.1:4000", None));
    let b = Arc::new(lock_client(&mesh, "127.0.0.1:4001", None));
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
    // B cannot get the lock while A holds it.
    std::thread::sleep(Duration::from_millis(300));
    assert!(!b_acquired.load(Ordering::SeqCst));
    // A's release flows back to the server (it was revoked), and B's turn comes.
    a.release(9).unwrap();
    b_thread.join().unwrap();
    assert!(b_acquired.load(Ordering::SeqCst));
    assert_eq!(2, a.stat(9).unwrap());
}

#[test]
fn two_threads_one_client_arbitrate_locally() {
    let mesh = Mesh::new();
    let _server = standalone_server(&mesh);
    let c = Arc::new(lock_client(&mesh, "127.0.0.1:4000", None));
    let d = Arc::new(lock_client(&mesh, "127.0.0.1:4001", None));
    c.acquire(2).unwrap();
    // A second local thread waits on the cached lock, not on the server.
    let t2 = {
        let c = Arc::clone(&c);
        std::thread::spawn(move || {
            c.acquire(2).unwrap();
            c.release(2).unwrap();
        })
    };
    // Another client contends, so the server revokes c while t1 still holds the lock.
    let d_thread = {
        let d = Arc::clone(&d);
        std::thread::spawn(move || {
            d.acquire(2).unwrap();
            d.release(2).unwrap();
        })
    };
    std::thread::sleep(Duration::from_millis(200));
    c.release(2).unwrap();
    t2.join().unwrap();
    d_thread.join().unwrap();
    // Everyone got a turn; the lock was granted to each client at least once.
    assert!(c.stat(2).unwrap() >= 2);
}

struct Recorder {
    flushes: Mutex<Vec<u64>>,
}

impl Releaser for Recorder {
    fn dorelease(&self, lid: u64) {
        self.flushes.lock().unwrap().push(lid);
    }
}

#[test]
fn dirty_state_flushes_before_the_lock_moves() {
    let mesh = Mesh::new();
    let _server = standalone_server(&mesh);
    let recorder = Arc::new(Recorder {
        flushes: Mutex::new(Vec::new()),
    });
    let a = Arc::new(lock_client(
        &mesh,
        "127.0.0.1:4000",
        Some(Arc::clone(&recorder) as Arc<dyn Releaser>),
    ));
    let b = Arc::new(lock_client(&mesh, "127.0.0.1:4001", None));
    a.acquire(7).unwrap();
    let b_thread = {
        let b = Arc::clone(&b);
        std::thread::spawn(move || {
            b.acquire(7).unwrap();
            b.release(7).unwrap();
        })
    };
    std::thread::sleep(Duration::from_millis(200));
    assert!(recorder.flushes.lock().unwrap().is_empty());
    a.release(7).unwrap();
    // The release hook ran before the lock left this client.
    assert_eq!(vec![7], recorder.flushes.lock().unwrap().clone());
    b_thread.join().unwrap();
}

#[test]
fn locks_move_over_real_tcp() {
    let handles = Arc::new(Handles::new(
        ClientOptions::default(),
        Arc::new(busywire::TcpConnector),
    ));
    let server = LockServer::new(Arc::new(AlwaysPrimary), Arc::clone(&handles));
    let mut services = ServiceRegistry::new();
    services.register("LockService", LockServiceServer::bind(Arc::clone(&server)));
    let listener = busywire::Server::new(busywire::ServerOptions::default(), services).unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let _ = listener.serve();
    });
    let a = Arc::new(LockClient::new(handles.handle(&addr), None).unwrap());
    let b = Arc::new(LockClient::new(handles.handle(&addr), None).unwrap());
    a.acquire(6).unwrap();
    let b_thread = {
        let b = Arc::clone(&b);
        std::thread::spawn(move || {
            b.acquire(6).unwrap();
            b.release(6).unwrap();
        })
    };
    std::thread::sleep(Duration::from_millis(200));
    a.release(6).unwrap();
    b_thread.join().unwrap();
    assert_eq!(2, a.stat(6).unwrap());
}

#[test]
fn idle_cached_lock_is_revoked_in_place() {
    let mesh = Mesh::new();
    let _server = standalone_server(&mesh);
    let recorder = Arc::new(Recorder {
        flushes: Mutex::new(Vec::new()),
    });
    let a = Arc::new(lock_client(
        &mesh,
        "127.0.0.1:4000",
        Some(Arc::clone(&recorder) as Arc<dyn Releaser>),
    ));
    let b = Arc::new(lock_client(&mesh, "127.0.0.1:4001", None));
    a.acquire(3).unwrap();
    a.release(3).unwrap();
    assert!(recorder.flushes.lock().unwrap().is_empty());
    // The lock sits cached FREE at a; b's acquire revokes it out from under a without any
    // thread at a noticing.
    b.acquire(3).unwrap();
    b.release(3).unwrap();
    assert_eq!(vec![3], recorder.flushes.lock().unwrap().clone());
}
