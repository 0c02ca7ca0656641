#![doc = include_str!("../README.md")]

use prototk_derive::Message;

use rpc_pb::service;

use zerror_core::ErrorCore;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type shared by the synod protocol and its implementation.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(507904, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(507905, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: prototk::Error,
    },
    /// There was an error at the RPC layer.
    #[prototk(507906, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// An OS/IO error, usually from the durable log.
    #[prototk(507907, message)]
    IoError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
    /// The durable log could not be replayed.
    #[prototk(507908, message)]
    Corruption {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// A proposer was already running on this node.
    #[prototk(507909, message)]
    AlreadyRunning {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
}

impl Error {
    /// Construct a corruption error.
    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption {
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

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Self {
        Self::IoError {
            core: ErrorCore::default(),
            what: what.to_string(),
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

///////////////////////////////////////////// Proposal /////////////////////////////////////////////

/// A proposal number.  Proposals pair a sequence number with the proposing node so that no two
/// nodes ever issue the same proposal.  Comparison is lexicographic by (number, node); a proposer
/// whose proposal is superseded can always pick a number that supersedes both.
#[derive(Clone, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct Proposal {
    #[prototk(1, uint64)]
    pub number: u64,
    #[prototk(2, string)]
    pub node: String,
}

impl Proposal {
    /// The smallest possible proposal.
    pub const fn bottom() -> Self {
        Proposal {
            number: 0,
            node: String::new(),
        }
    }
}

impl std::fmt::Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "({},{})", self.number, self.node)
    }
}

////////////////////////////////////////// PrepareRequest //////////////////////////////////////////

/// Phase-one request: rally support for a proposal on one instance.
#[derive(Clone, Debug, Default, Message)]
pub struct PrepareRequest {
    #[prototk(1, uint32)]
    pub instance: u32,
    #[prototk(2, message)]
    pub n: Proposal,
}

////////////////////////////////////////// PrepareResponse /////////////////////////////////////////

/// Phase-one response.  `oldinstance` and `accept` cannot both be true.
#[derive(Clone, Debug, Default, Message)]
pub struct PrepareResponse {
    /// The instance was already decided; `instance_v` carries the decided value.
    #[prototk(1, Bool)]
    pub oldinstance: bool,
    /// The acceptor promises not to accept proposals below `n`; `n_a`/`v_a` carry its
    /// highest-accepted proposal and value.
    #[prototk(2, Bool)]
    pub accept: bool,
    /// Valid iff oldinstance.
    #[prototk(3, bytes)]
    pub instance_v: Vec<u8>,
    /// Valid iff accept.
    #[prototk(4, message)]
    pub n_a: Proposal,
    /// Valid iff accept.  Empty means the acceptor has accepted nothing yet.
    #[prototk(5, bytes)]
    pub v_a: Vec<u8>,
    /// Valid iff the request was rejected; the acceptor's highest promise, so the proposer can
    /// catch up quickly.
    #[prototk(6, message)]
    pub n_h: Proposal,
}

/////////////////////////////////////////// AcceptRequest //////////////////////////////////////////

/// Phase-two request: ask the acceptor to accept a value under a rallied proposal.
#[derive(Clone, Debug, Default, Message)]
pub struct AcceptRequest {
    #[prototk(1, uint32)]
    pub instance: u32,
    #[prototk(2, message)]
    pub n: Proposal,
    #[prototk(3, bytes)]
    pub v: Vec<u8>,
}

/////////////////////////////////////////// AcceptResponse /////////////////////////////////////////

/// Phase-two response.
#[derive(Clone, Debug, Default, Message)]
pub struct AcceptResponse {
    #[prototk(1, Bool)]
    pub accepted: bool,
}

/////////////////////////////////////////// DecideRequest //////////////////////////////////////////

/// Inform an acceptor that a value was decided for an instance.
#[derive(Clone, Debug, Default, Message)]
pub struct DecideRequest {
    #[prototk(1, uint32)]
    pub instance: u32,
    #[prototk(2, bytes)]
    pub v: Vec<u8>,
}

/////////////////////////////////////////// DecideResponse /////////////////////////////////////////

/// Acknowledge a decide.
#[derive(Clone, Debug, Default, Message)]
pub struct DecideResponse {}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

// The acceptor service is the mutable memory of the protocol.  Every value gets decided by
// talking to a majority of acceptors.
service! {
    name = AcceptorService;
    server = AcceptorServer;
    client = AcceptorClient;
    error = Error;

    rpc prepare(PrepareRequest) -> PrepareResponse;
    rpc accept(AcceptRequest) -> AcceptResponse;
    rpc decide(DecideRequest) -> DecideResponse;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use buffertk::{stack_pack, Unpackable};

    use super::*;

    #[test]
    fn proposal_ordering() {
        let small = Proposal {
            number: 1,
            node: "127.0.0.1:2045".to_string(),
        };
        let medium = Proposal {
            number: 1,
            node: "127.0.0.1:2046".to_string(),
        };
        let large = Proposal {
            number: 2,
            node: "127.0.0.1:2045".to_string(),
        };
        assert!(Proposal::bottom() < small);
        assert!(small < medium);
        assert!(medium < large);
        assert!(small < large);
    }

    #[test]
    fn prepare_response_round_trip() {
        let resp = PrepareResponse {
            oldinstance: false,
            accept: true,
            instance_v: Vec::new(),
            n_a: Proposal {
                number: 7,
                node: "127.0.0.1:2045".to_string(),
            },
            v_a: b"decree".to_vec(),
            n_h: Proposal::bottom(),
        };
        let buf = stack_pack(&resp).to_vec();
        let (got, _) = PrepareResponse::unpack(&buf).unwrap();
        assert!(got.accept);
        assert_eq!(7, got.n_a.number);
        assert_eq!(b"decree".to_vec(), got.v_a);
    }
}
