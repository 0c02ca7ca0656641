#![doc = include_str!("../README.md")]

use prototk_derive::Message;

use rpc_pb::service;

use zerror_core::ErrorCore;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type shared by the replica service and its clients.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(516096, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(516097, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: prototk::Error,
    },
    /// There was an error at the RPC layer.
    #[prototk(516098, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// The receiving replica is not the primary of its view.  The view hints where to go.
    #[prototk(516099, message)]
    NotPrimary {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The receiver's current view.
        #[prototk(2, message)]
        view: View,
    },
    /// The receiving replica is recovering and cannot serve yet.
    #[prototk(516100, message)]
    Busy {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// The replica lost the agreement race too many times in a row.
    #[prototk(516101, message)]
    LostRace {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// No method is registered under the invoked name.
    #[prototk(516102, message)]
    UnknownMethod {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The method requested.
        #[prototk(2, string)]
        method: String,
    },
    /// An error from the synod layer.
    #[prototk(516103, message)]
    SynodError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(what: buffertk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<rpc_pb::Error> for Error {
    fn from(what: rpc_pb::Error) -> Self {
        Self::RpcError {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<synod_pb::Error> for Error {
    fn from(what: synod_pb::Error) -> Self {
        Self::SynodError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

/////////////////////////////////////////////// View ///////////////////////////////////////////////

/// A view of the group.  The first member is the primary.  Views change only through decided
/// reconfiguration entries, and view_id increases by one per change.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct View {
    #[prototk(1, uint64)]
    pub view_id: u64,
    #[prototk(2, string)]
    pub members: Vec<String>,
}

impl View {
    /// The primary of this view.
    pub fn primary(&self) -> Option<&str> {
        self.members.first().map(|s| s.as_str())
    }

    /// True iff `node` is a member.
    pub fn is_member(&self, node: &str) -> bool {
        self.members.iter().any(|m| m == node)
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "view {} [{}]", self.view_id, self.members.join(","))
    }
}

///////////////////////////////////////////// LogEntry /////////////////////////////////////////////

/// One entry of the replicated command log.  Entries are the values decided by the synod layer,
/// applied at every replica in instance order.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum LogEntry {
    /// Decide something harmless; used to flush the pipeline.
    #[prototk(1, message)]
    #[default]
    Nop,
    /// Apply a command to the registered state machine.
    #[prototk(2, message)]
    Invoke {
        /// The replica that proposed this entry.
        #[prototk(1, string)]
        origin: String,
        /// The origin-local sequence number matching the entry to its waiting caller.
        #[prototk(2, uint64)]
        seq: u64,
        /// The method to invoke.
        #[prototk(3, string)]
        method: String,
        /// The packed request.
        #[prototk(4, bytes)]
        body: Vec<u8>,
    },
    /// Install a new view.
    #[prototk(3, message)]
    Reconfigure {
        #[prototk(1, message)]
        view: View,
    },
}

/////////////////////////////////////////// InvokeRequest //////////////////////////////////////////

/// Ask the primary to order and apply one command.
#[derive(Clone, Debug, Default, Message)]
pub struct InvokeRequest {
    #[prototk(1, string)]
    pub method: String,
    #[prototk(2, bytes)]
    pub body: Vec<u8>,
}

/////////////////////////////////////////// InvokeResponse /////////////////////////////////////////

/// The reply produced by applying the command.
#[derive(Clone, Debug, Default, Message)]
pub struct InvokeResponse {
    #[prototk(1, bytes)]
    pub reply: Vec<u8>,
}

//////////////////////////////////////////// ViewRequest ///////////////////////////////////////////

/// Ask a replica for its current view.
#[derive(Clone, Debug, Default, Message)]
pub struct ViewRequest {}

/////////////////////////////////////////// ViewResponse ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct ViewResponse {
    #[prototk(1, message)]
    pub view: View,
    /// The highest applied log instance at the replica.
    #[prototk(2, uint32)]
    pub applied: u32,
}

//////////////////////////////////////////// JoinRequest ///////////////////////////////////////////

/// Ask the primary to add `me` to the view and hand over a snapshot.
#[derive(Clone, Debug, Default, Message)]
pub struct JoinRequest {
    #[prototk(1, string)]
    pub me: String,
}

/////////////////////////////////////////// JoinResponse ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct JoinResponse {
    #[prototk(1, message)]
    pub view: View,
    /// The log instance the snapshot covers through.
    #[prototk(2, uint32)]
    pub applied: u32,
    /// The state machine snapshot.
    #[prototk(3, bytes)]
    pub state: Vec<u8>,
}

////////////////////////////////////////// HeartbeatRequest ////////////////////////////////////////

/// Liveness probe between members.
#[derive(Clone, Debug, Default, Message)]
pub struct HeartbeatRequest {
    #[prototk(1, string)]
    pub from: String,
    #[prototk(2, uint64)]
    pub view_id: u64,
}

////////////////////////////////////////// HeartbeatResponse ///////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct HeartbeatResponse {
    /// The responder's view id, so a stale sender knows to refresh.
    #[prototk(1, uint64)]
    pub view_id: u64,
    /// The responder's applied watermark, so a lagging sender knows to catch up.
    #[prototk(2, uint32)]
    pub applied: u32,
}

////////////////////////////////////////////// Replica /////////////////////////////////////////////

// The replica service fronts the whole group: clients invoke commands at the primary, members
// heartbeat each other, and recovering nodes join through it.
service! {
    name = ReplicaService;
    server = ReplicaServer;
    client = ReplicaClient;
    error = Error;

    rpc invoke(InvokeRequest) -> InvokeResponse;
    rpc view(ViewRequest) -> ViewResponse;
    rpc join(JoinRequest) -> JoinResponse;
    rpc heartbeat(HeartbeatRequest) -> HeartbeatResponse;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
