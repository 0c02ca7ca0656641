#![doc = include_str!("../README.md")]

use prototk_derive::Message;

use rpc_pb::service;

use zerror_core::ErrorCore;

///////////////////////////////////////////// ExtentId /////////////////////////////////////////////

/// Extents are named by opaque 64-bit identifiers that double as inode numbers in the file
/// system above.
pub type ExtentId = u64;

/// The extent holding the file-system root.
pub const ROOT_EXTENT: ExtentId = 1;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type shared by the extent protocol and its implementations.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(532480, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(532481, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: prototk::Error,
    },
    /// There was an error at the RPC layer.
    #[prototk(532482, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// No extent exists under the requested id.
    #[prototk(532483, message)]
    NotFound {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The id requested.
        #[prototk(2, uint64)]
        eid: ExtentId,
    },
}

impl Error {
    /// Construct a not-found error.
    pub fn not_found(eid: ExtentId) -> Self {
        Self::NotFound {
            core: ErrorCore::default(),
            eid,
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

//////////////////////////////////////////// Attributes ////////////////////////////////////////////

/// Per-extent attributes, kept by the server and cached alongside data.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Attributes {
    #[prototk(1, uint64)]
    pub atime: u64,
    #[prototk(2, uint64)]
    pub mtime: u64,
    #[prototk(3, uint64)]
    pub ctime: u64,
    #[prototk(4, uint64)]
    pub size: u64,
}

///////////////////////////////////////////// GetRequest ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct GetRequest {
    #[prototk(1, uint64)]
    pub eid: ExtentId,
}

//////////////////////////////////////////// GetResponse ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct GetResponse {
    #[prototk(1, bytes)]
    pub data: Vec<u8>,
}

/////////////////////////////////////////// GetAttrRequest /////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct GetAttrRequest {
    #[prototk(1, uint64)]
    pub eid: ExtentId,
}

////////////////////////////////////////// GetAttrResponse /////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct GetAttrResponse {
    #[prototk(1, message)]
    pub attr: Attributes,
}

///////////////////////////////////////////// PutRequest ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct PutRequest {
    #[prototk(1, uint64)]
    pub eid: ExtentId,
    #[prototk(2, bytes)]
    pub data: Vec<u8>,
}

//////////////////////////////////////////// PutResponse ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct PutResponse {}

/////////////////////////////////////////// RemoveRequest //////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct RemoveRequest {
    #[prototk(1, uint64)]
    pub eid: ExtentId,
}

////////////////////////////////////////// RemoveResponse //////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
pub struct RemoveResponse {}

//////////////////////////////////////////// the service ///////////////////////////////////////////

service! {
    name = ExtentService;
    server = ExtentServiceServer;
    client = ExtentServiceClient;
    error = Error;

    rpc get(GetRequest) -> GetResponse;
    rpc getattr(GetAttrRequest) -> GetAttrResponse;
    rpc put(PutRequest) -> PutResponse;
    rpc remove(RemoveRequest) -> RemoveResponse;
}
