//! The client side of the replicated group.  An [RsmClient] remembers the view it last heard
//! and routes every call to the primary, following NotPrimary redirections, backing off a busy
//! group, and rotating through seeds when the transport fails.  It implements [rpc_pb::Client],
//! so typed service clients ride it unchanged.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use guacamole::Guacamole;
use indicio::{clue, DEBUG};
use zerror_core::ErrorCore;

use busywire::Handles;
use rsm_pb::{Error, InvokeRequest, ReplicaClient, ReplicaService, View};

use super::{fresh_seed, jitter_ms, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CALLS: Counter = Counter::new("rsm.client.calls");
static REDIRECTS: Counter = Counter::new("rsm.client.redirects");
static BUSY_BACKOFFS: Counter = Counter::new("rsm.client.busy_backoffs");
static ROTATIONS: Counter = Counter::new("rsm.client.rotations");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CALLS);
    collector.register_counter(&REDIRECTS);
    collector.register_counter(&BUSY_BACKOFFS);
    collector.register_counter(&ROTATIONS);
}

//////////////////////////////////////// RsmClientOptions //////////////////////////////////////////

/// Tunables for the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RsmClientOptions {
    /// How many times to re-route a call before giving up.
    pub attempts: usize,
    /// Base backoff between re-routes, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RsmClientOptions {
    fn default() -> Self {
        Self {
            attempts: 16,
            backoff_ms: 50,
        }
    }
}

///////////////////////////////////////////// RsmClient ////////////////////////////////////////////

struct ClientState {
    view: View,
    cursor: usize,
}

/// A view-following client to the replicated group.
pub struct RsmClient {
    options: RsmClientOptions,
    handles: Arc<Handles>,
    seeds: Vec<String>,
    state: Mutex<ClientState>,
    guac: Mutex<Guacamole>,
}

impl RsmClient {
    /// Create a client that discovers the group through `seeds`.
    pub fn new(handles: Arc<Handles>, seeds: Vec<String>) -> RsmClient {
        Self::with_options(RsmClientOptions::default(), handles, seeds)
    }

    /// Create a client with explicit options.
    pub fn with_options(
        options: RsmClientOptions,
        handles: Arc<Handles>,
        seeds: Vec<String>,
    ) -> RsmClient {
        RsmClient {
            options,
            handles,
            seeds,
            state: Mutex::new(ClientState {
                view: View::default(),
                cursor: 0,
            }),
            guac: Mutex::new(Guacamole::new(fresh_seed())),
        }
    }

    fn target(&self) -> String {
        let state = self.state.lock().unwrap();
        if let Some(primary) = state.view.primary() {
            return primary.to_string();
        }
        if self.seeds.is_empty() {
            return String::new();
        }
        self.seeds[state.cursor % self.seeds.len()].clone()
    }

    fn rotate(&self, failed: &str) {
        ROTATIONS.click();
        self.handles.evict(failed);
        let mut state = self.state.lock().unwrap();
        // Forget a view whose primary cannot be reached; fall back to the seed list.
        if state.view.primary() == Some(failed) {
            state.view = View::default();
        }
        state.cursor += 1;
    }

    /// Invoke `method` with `body` at the current primary, re-routing as needed.
    pub fn call(
        &self,
        ctx: &rpc_pb::Context,
        method: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, Error> {
        CALLS.click();
        let mut last_err = Error::Busy {
            core: ErrorCore::default(),
        };
        for attempt in 0..self.options.attempts {
            if attempt > 0 {
                let backoff = self.options.backoff_ms + jitter_ms(&self.guac, self.options.backoff_ms);
                std::thread::sleep(Duration::from_millis(backoff));
            }
            let target = self.target();
            if target.is_empty() {
                return Err(Error::Busy {
                    core: ErrorCore::default(),
                });
            }
            let client = ReplicaClient::new(self.handles.handle(&target));
            let req = InvokeRequest {
                method: method.to_string(),
                body: body.to_vec(),
            };
            match client.invoke(ctx, req) {
                Ok(resp) => {
                    return Ok(resp.reply);
                }
                Err(Error::NotPrimary { view, .. }) => {
                    REDIRECTS.click();
                    let mut state = self.state.lock().unwrap();
                    if view.view_id >= state.view.view_id && view.primary().is_some() {
                        state.view = view;
                    } else {
                        state.view = View::default();
                        state.cursor += 1;
                    }
                    last_err = Error::NotPrimary {
                        core: ErrorCore::default(),
                        view: state.view.clone(),
                    };
                }
                Err(Error::Busy { .. }) | Err(Error::LostRace { .. }) => {
                    BUSY_BACKOFFS.click();
                    last_err = Error::Busy {
                        core: ErrorCore::default(),
                    };
                }
                Err(Error::RpcError { what, core }) => {
                    if busywire::is_transport_error(&what) {
                        self.rotate(&target);
                    }
                    last_err = Error::RpcError { what, core };
                }
                Err(err) => {
                    return Err(err);
                }
            }
            clue!(COLLECTOR, DEBUG, {
                reroute: {
                    attempt: attempt as u64,
                    target: target,
                },
            });
        }
        Err(last_err)
    }
}

impl rpc_pb::Client for RsmClient {
    fn call(&self, ctx: &rpc_pb::Context, _: &str, method: &str, body: &[u8]) -> rpc_pb::Status {
        match RsmClient::call(self, ctx, method, body) {
            Ok(reply) => Ok(Ok(reply)),
            Err(Error::RpcError { what, .. }) => Err(what),
            Err(Error::UnknownMethod { method, .. }) => Err(rpc_pb::Error::UnknownMethodName {
                core: ErrorCore::default(),
                name: method,
            }),
            Err(Error::SerializationError { what, .. }) => Err(rpc_pb::Error::SerializationError {
                core: ErrorCore::default(),
                err: what,
                context: "invoking through the replicated group".to_string(),
            }),
            Err(err) => Err(rpc_pb::Error::TransportFailure {
                core: ErrorCore::default(),
                what: err.to_string(),
            }),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
