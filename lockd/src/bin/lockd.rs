use std::path::PathBuf;
use std::sync::Arc;

use arrrg::CommandLine;
use indicio::{
    clue,
    stdio::StdioEmitter,
    {ALWAYS, DEBUG, INFO},
};
use rpc_pb::IoToZ;

use busywire::{ClientOptions, Handles, Server, ServerOptions, ServiceRegistry, TcpConnector};
use lock_pb::LockServiceServer;
use lockd::{AlwaysPrimary, LockServer};
use rsm::{Replica, ReplicaOptions};

#[derive(Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(required, "host:port to listen on.")]
    listen: String,
    #[arrrg(
        optional,
        "Comma-separated replica addresses; the first one bootstraps the group.  Empty runs standalone."
    )]
    group: String,
    #[arrrg(optional, "Directory for the durable agreement log.")]
    data_dir: String,
    #[arrrg(flag, "Log at DEBUG verbosity.")]
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3772".to_string(),
            group: String::new(),
            data_dir: ".".to_string(),
            verbose: false,
        }
    }
}

fn main() {
    minimal_signals::block();
    let (options, free) = Options::from_command_line("Usage: lockd [OPTIONS]");
    if !free.is_empty() {
        eprintln!("command takes no arguments");
        std::process::exit(1);
    }
    // indicio
    let emitter = Arc::new(StdioEmitter);
    let verbosity = if options.verbose { DEBUG } else { INFO };
    busywire::COLLECTOR.register(Arc::clone(&emitter));
    busywire::COLLECTOR.set_verbosity(verbosity);
    synod::COLLECTOR.register(Arc::clone(&emitter));
    synod::COLLECTOR.set_verbosity(verbosity);
    rsm::COLLECTOR.register(Arc::clone(&emitter));
    rsm::COLLECTOR.set_verbosity(verbosity);
    lockd::COLLECTOR.register(Arc::clone(&emitter));
    lockd::COLLECTOR.set_verbosity(verbosity);
    clue!(lockd::COLLECTOR, ALWAYS, {
        new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
    // shutdown is process exit
    std::thread::spawn(move || {
        loop {
            let signal_set = minimal_signals::SignalSet::new().fill();
            let signal = minimal_signals::wait(signal_set);
            if signal != Some(minimal_signals::SIGCHLD) {
                break;
            }
        }
        std::process::exit(0);
    });
    // the lock service
    let handles = Arc::new(Handles::new(
        ClientOptions::default().with_call_timeout_ms(1_000),
        Arc::new(TcpConnector),
    ));
    let mut services = ServiceRegistry::new();
    if options.group.is_empty() {
        let ls = LockServer::new(Arc::new(AlwaysPrimary), handles);
        services.register("LockService", LockServiceServer::bind(Arc::clone(&ls)));
        let server = Server::new(
            ServerOptions::default().with_bind_to(&options.listen),
            services,
        )
        .as_z()
        .pretty_unwrap();
        server.serve().as_z().pretty_unwrap();
    } else {
        let group: Vec<String> = options.group.split(',').map(String::from).collect();
        std::fs::create_dir_all(&options.data_dir).expect("data directory should be writable");
        let log_path = PathBuf::from(&options.data_dir).join(format!(
            "lockd-{}.synod",
            options.listen.replace(':', "-"),
        ));
        let replica = Replica::new(
            ReplicaOptions::default(),
            &options.listen,
            log_path,
            group,
            Arc::clone(&handles),
        )
        .expect("replica should construct");
        let ls = LockServer::new(Arc::new(replica.clone()), handles);
        ls.attach_to_replica(&replica);
        replica.register_services(&mut services);
        let server = Server::new(
            ServerOptions::default().with_bind_to(&options.listen),
            services,
        )
        .as_z()
        .pretty_unwrap();
        replica.start();
        server.serve().as_z().pretty_unwrap();
    }
}
