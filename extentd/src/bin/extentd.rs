use std::sync::Arc;

use arrrg::CommandLine;
use indicio::{
    clue,
    stdio::StdioEmitter,
    {ALWAYS, DEBUG, INFO},
};
use rpc_pb::IoToZ;

use busywire::{Server, ServerOptions, ServiceRegistry};
use extent_pb::ExtentServiceServer;
use extentd::ExtentServer;

#[derive(Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(required, "host:port to listen on.")]
    listen: String,
    #[arrrg(flag, "Log at DEBUG verbosity.")]
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3962".to_string(),
            verbose: false,
        }
    }
}

fn main() {
    minimal_signals::block();
    let (options, free) = Options::from_command_line("Usage: extentd [OPTIONS]");
    if !free.is_empty() {
        eprintln!("command takes no arguments");
        std::process::exit(1);
    }
    // indicio
    let emitter = Arc::new(StdioEmitter);
    let verbosity = if options.verbose { DEBUG } else { INFO };
    busywire::COLLECTOR.register(Arc::clone(&emitter));
    busywire::COLLECTOR.set_verbosity(verbosity);
    extentd::COLLECTOR.register(Arc::clone(&emitter));
    extentd::COLLECTOR.set_verbosity(verbosity);
    clue!(extentd::COLLECTOR, ALWAYS, {
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
    // the extent service
    let server = ExtentServer::new();
    let mut services = ServiceRegistry::new();
    services.register("ExtentService", ExtentServiceServer::bind(server));
    let server = Server::new(
        ServerOptions::default().with_bind_to(&options.listen),
        services,
    )
    .as_z()
    .pretty_unwrap();
    server.serve().as_z().pretty_unwrap();
}
