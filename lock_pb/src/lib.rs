#![doc = include_str!("../README.md")]

use prototk_derive::Message;

use rpc_pb::service;

use zerror_core::ErrorCore;

////////////////////////////////////////////// LockId //////////////////////////////////////////////

/// Locks are named by opaque 64-bit identifiers.
pub type LockId = u64;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type shared by the lock protocol and its implementations.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(524288, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(524289, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: prototk::Error,
    },
    /// There was an error at the RPC layer.
    #[prototk(524290, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// One side of the protocol misused it (releasing a free lock, releasing another client's
    /// lock, releasing a lock the calling thread does not hold).
    #[prototk(524291, message)]
    ProtocolError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// The server saw a sequence number below the one it already recorded.
    #[prototk(524292, message)]
    Stale {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
}

impl Error {
    /// Construct a protocol error.
    pub fn protocol(what: impl Into<String>) -> Self {
        Self::ProtocolError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
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

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Self {
        Self::RpcError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
}

////////////////////////////////////////////// Status //////////////////////////////////////////////

/// The status carried by every lock reply.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum Status {
    /// The operation took effect.
    #[prototk(1, message)]
    #[default]
    Ok,
    /// The lock is lent elsewhere; wait for a retry callback and reissue.
    #[prototk(2, message)]
    Retry,
    /// The caller misused the protocol.
    #[prototk(3, message)]
    RpcErr,
    /// The named object does not exist.
    #[prototk(4, message)]
    NoEnt,
    /// An I/O failure.
    #[prototk(5, message)]
    IoErr,
    /// The request's sequence number is older than one already served.
    #[prototk(6, message)]
    Stale,
}

/////////////////////////////////////////// AcquireRequest /////////////////////////////////////////

/// Ask the server to lend a lock.  `client_id` is the host:port of the caller's callback
/// listener; `xid` must strictly increase per client per operation kind.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct AcquireRequest {
    #[prototk(1, uint64)]
    pub lid: LockId,
    #[prototk(2, string)]
    pub client_id: String,
    #[prototk(3, uint64)]
    pub xid: u64,
}

/////////////////////////////////////////// AcquireResponse ////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct AcquireResponse {
    #[prototk(1, message)]
    pub status: Status,
    /// Set when other clients were already waiting at grant time; the holder should hand the
    /// lock back promptly rather than cache it.
    #[prototk(2, Bool)]
    pub contention: bool,
    /// Set when producing this reply enqueued a revoke; a duplicate of the request re-enqueues
    /// it.
    #[prototk(3, Bool)]
    pub revoke: bool,
}

/////////////////////////////////////////// ReleaseRequest /////////////////////////////////////////

/// Give a lent lock back.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ReleaseRequest {
    #[prototk(1, uint64)]
    pub lid: LockId,
    #[prototk(2, string)]
    pub client_id: String,
    #[prototk(3, uint64)]
    pub xid: u64,
}

/////////////////////////////////////////// ReleaseResponse ////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ReleaseResponse {
    #[prototk(1, message)]
    pub status: Status,
}

///////////////////////////////////////////// StatRequest //////////////////////////////////////////

/// Ask how many times a lock has been acquired.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct StatRequest {
    #[prototk(1, uint64)]
    pub lid: LockId,
}

//////////////////////////////////////////// StatResponse //////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct StatResponse {
    #[prototk(1, message)]
    pub status: Status,
    #[prototk(2, uint64)]
    pub nacquire: u64,
}

/////////////////////////////////////////// RevokeRequest //////////////////////////////////////////

/// Server-to-client: give the named lock back once local users are done with it.  The xid is
/// carried for symmetry with the client-to-server calls; no correctness obligation rides on it.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct RevokeRequest {
    #[prototk(1, uint64)]
    pub lid: LockId,
    #[prototk(2, uint64)]
    pub xid: u64,
}

/////////////////////////////////////////// RevokeResponse /////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct RevokeResponse {
    #[prototk(1, message)]
    pub status: Status,
}

//////////////////////////////////////////// RetryRequest //////////////////////////////////////////

/// Server-to-client: a previously-refused acquire may now succeed.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct RetryRequest {
    #[prototk(1, uint64)]
    pub lid: LockId,
    #[prototk(2, uint64)]
    pub xid: u64,
}

//////////////////////////////////////////// RetryResponse /////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct RetryResponse {
    #[prototk(1, message)]
    pub status: Status,
}

///////////////////////////////////////////// LockState ////////////////////////////////////////////

/// The server-side state of one lock.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum LockState {
    /// The server holds the lock.
    #[prototk(1, message)]
    #[default]
    Free,
    /// The lock is lent to its owner.
    #[prototk(2, message)]
    Lent,
    /// The lock is lent and a revoke is outstanding.
    #[prototk(3, message)]
    Revoked,
}

////////////////////////////////////////// SnapshotContext /////////////////////////////////////////

/// The duplicate-suppression state the server keeps per (lock, client).
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct SnapshotContext {
    #[prototk(1, string)]
    pub client: String,
    #[prototk(2, uint64)]
    pub acquire_xid: u64,
    #[prototk(3, message)]
    pub acquire_reply: Option<AcquireResponse>,
    #[prototk(4, uint64)]
    pub release_xid: u64,
    #[prototk(5, message)]
    pub release_reply: Option<ReleaseResponse>,
}

//////////////////////////////////////////// SnapshotLock //////////////////////////////////////////

/// One lock's full server-side state.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct SnapshotLock {
    #[prototk(1, uint64)]
    pub lid: LockId,
    #[prototk(2, message)]
    pub state: LockState,
    /// Empty means unowned.
    #[prototk(3, string)]
    pub owner: String,
    #[prototk(4, uint64)]
    pub nacquire: u64,
    #[prototk(5, string)]
    pub wait_q: Vec<String>,
    #[prototk(6, message)]
    pub contexts: Vec<SnapshotContext>,
}

////////////////////////////////////////////// Snapshot ////////////////////////////////////////////

/// The server's full state, as shipped to recovering replicas.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Snapshot {
    #[prototk(1, message)]
    pub locks: Vec<SnapshotLock>,
}

//////////////////////////////////////////// LockService ///////////////////////////////////////////

// The calls clients make against the lock server.
service! {
    name = LockService;
    server = LockServiceServer;
    client = LockServiceClient;
    error = Error;

    rpc acquire(AcquireRequest) -> AcquireResponse;
    rpc release(ReleaseRequest) -> ReleaseResponse;
    rpc stat(StatRequest) -> StatResponse;
}

/////////////////////////////////////////// LockCallback ///////////////////////////////////////////

// The calls the server makes against a client's callback listener.
service! {
    name = LockCallback;
    server = LockCallbackServer;
    client = LockCallbackClient;
    error = Error;

    rpc revoke(RevokeRequest) -> RevokeResponse;
    rpc retry(RetryRequest) -> RetryResponse;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use buffertk::{stack_pack, Unpackable};

    use super::*;

    #[test]
    fn acquire_response_round_trip() {
        let resp = AcquireResponse {
            status: Status::Retry,
            contention: false,
            revoke: true,
        };
        let buf = stack_pack(&resp).to_vec();
        let (got, _) = AcquireResponse::unpack(&buf).unwrap();
        assert_eq!(resp, got);
    }

    #[test]
    fn snapshot_round_trip() {
        let snapshot = Snapshot {
            locks: vec![SnapshotLock {
                lid: 7,
                state: LockState::Revoked,
                owner: "127.0.0.1:4000".to_string(),
                nacquire: 3,
                wait_q: vec!["127.0.0.1:4001".to_string(), "127.0.0.1:4002".to_string()],
                contexts: vec![SnapshotContext {
                    client: "127.0.0.1:4000".to_string(),
                    acquire_xid: 5,
                    acquire_reply: Some(AcquireResponse {
                        status: Status::Ok,
                        contention: true,
                        revoke: false,
                    }),
                    release_xid: 4,
                    release_reply: Some(ReleaseResponse { status: Status::Ok }),
                }],
            }],
        };
        let buf = stack_pack(&snapshot).to_vec();
        let (got, _) = Snapshot::unpack(&buf).unwrap();
        assert_eq!(snapshot, got);
    }
}
