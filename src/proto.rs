//! Request, response, and event payloads.
//!
//! Payload structs carry the stable field names used on the wire (`rootseq`,
//! `rootdir`, `key`, `flags`, `val`, `name`, `nprocs`, `ops`). The broker
//! codec itself lives outside this crate; these types define what it
//! transports.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::blobref::BlobRef;
use crate::dirent::DirEntry;

/// Force an initial watch response even when the value is unchanged.
pub const FLAG_FIRST: u32 = 1;
/// Respond at most once; do not re-register the watch.
pub const FLAG_ONCE: u32 = 2;
/// Require the terminal entry to be a directory and return it.
pub const FLAG_READDIR: u32 = 4;
/// Return a link's target without following it.
pub const FLAG_READLINK: u32 = 8;

/// Fence flag: exclude this fence from ready-commit merging.
pub const FENCE_NO_MERGE: u32 = 1;

/// Read a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    /// Optional root to resolve against instead of the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootdir: Option<DirEntry>,
    /// Hierarchical key, `.`-separated.
    pub key: String,
    /// Lookup flag bits.
    #[serde(default)]
    pub flags: u32,
}

/// Successful read: the resolved value and the root it was resolved against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    /// Root directory entry actually used for the lookup.
    pub rootdir: DirEntry,
    /// Resolved value.
    pub val: Value,
}

/// Watch a key for changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRequest {
    /// Hierarchical key, `.`-separated.
    pub key: String,
    /// Value the caller last observed; no response is sent while the key
    /// still resolves to this (unless `FLAG_FIRST` is set).
    #[serde(default)]
    pub val: Value,
    /// Watch flag bits.
    #[serde(default)]
    pub flags: u32,
}

/// Watch notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchResponse {
    /// Current value of the watched key.
    pub val: Value,
}

/// Cancel watches on a key from the requesting sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwatchRequest {
    /// Key whose watches are cancelled.
    pub key: String,
}

/// One operation inside a fence: set `key` to `dirent`, or delete `key` when
/// `dirent` is absent. List order defines apply order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeOp {
    /// Target key.
    pub key: String,
    /// New entry, or `None` to delete.
    #[serde(default)]
    pub dirent: Option<DirEntry>,
}

/// Submit one participant's share of a named fence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FenceRequest {
    /// Fence name, unique until finalized.
    pub name: String,
    /// Number of participants expected before the fence is commit-ready.
    pub nprocs: u32,
    /// Fence flag bits.
    #[serde(default)]
    pub flags: u32,
    /// This participant's operations.
    pub ops: Vec<TreeOp>,
}

/// Wait until the root has reached a minimum version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Minimum root sequence number to wait for.
    pub rootseq: u64,
}

/// Current root state, returned by sync and getroot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootResponse {
    /// Root sequence number.
    pub rootseq: u64,
    /// Blob reference of the root directory.
    pub rootdir: String,
}

/// Event payload announcing a new authoritative root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRootEvent {
    /// New root sequence number.
    pub rootseq: u64,
    /// Blob reference of the new root directory.
    pub rootdir: String,
    /// The root directory object itself, inlined so consumers can avoid a
    /// content load. Optional; consumers must handle absence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Value>,
    /// Names of the fences finalized by this root.
    pub names: Vec<String>,
}

/// Event payload announcing a failed commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Names of the fences that failed.
    pub names: Vec<String>,
    /// Failure errno.
    pub errnum: i32,
}

/// A request dispatched to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Read a key.
    Get(GetRequest),
    /// Watch a key.
    Watch(WatchRequest),
    /// Cancel watches.
    Unwatch(UnwatchRequest),
    /// Submit a fence share.
    Fence(FenceRequest),
    /// Fence share relayed from another rank (root only, no response).
    RelayFence(FenceRequest),
    /// Wait for a root version.
    Sync(SyncRequest),
    /// Report the current root.
    GetRoot,
    /// Expire every unreferenced clean cache entry.
    DropCache,
    /// Purge all waiters registered by the requesting sender.
    Disconnect,
    /// Report service statistics.
    StatsGet,
    /// Zero the resettable counters.
    StatsClear,
}

/// Generic response: an errno plus an optional payload. `errnum` zero means
/// success; fatal errors carry no payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Zero on success.
    pub errnum: i32,
    /// Response payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    /// Successful response with a payload.
    pub fn ok(payload: Value) -> Self {
        Response {
            errnum: 0,
            payload: Some(payload),
        }
    }

    /// Successful response without a payload.
    pub fn ok_empty() -> Self {
        Response {
            errnum: 0,
            payload: None,
        }
    }

    /// Error response.
    pub fn error(errnum: i32) -> Self {
        Response {
            errnum,
            payload: None,
        }
    }
}

/// Channel a response travels back on. Watches may send more than one
/// response over the lifetime of a registration, hence a stream rather than
/// a oneshot.
pub type ReplySender = mpsc::UnboundedSender<Response>;

/// A request together with its originating sender identity and reply route.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Identity of the sending client, used for disconnect/unwatch matching.
    pub sender: String,
    /// Where responses go.
    pub reply: ReplySender,
    /// The request itself.
    pub request: Request,
}

impl RequestEnvelope {
    /// Wrap a request for dispatch.
    pub fn new(sender: impl Into<String>, reply: ReplySender, request: Request) -> Self {
        RequestEnvelope {
            sender: sender.into(),
            reply,
            request,
        }
    }
}

/// Events consumed and published by the service.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Heartbeat from the broker; advances the epoch clock.
    Heartbeat {
        /// New epoch value.
        epoch: u64,
    },
    /// A new authoritative root was published.
    SetRoot(SetRootEvent),
    /// A commit failed.
    Error(ErrorEvent),
    /// Drop unreferenced clean cache entries on every rank.
    DropCache,
    /// Zero resettable counters on every rank.
    StatsClear,
}

/// Inputs the service state machine consumes.
#[derive(Debug)]
pub enum Input {
    /// A client request.
    Request(RequestEnvelope),
    /// A broker event.
    Event(Event),
    /// Completion of a `content.load` issued earlier.
    LoadReply {
        /// Reference the load was for.
        blobref: BlobRef,
        /// Decoded object, or an errno on failure.
        result: Result<Value, i32>,
    },
    /// Completion of a `content.store` issued earlier.
    StoreReply {
        /// Reference the store was expected to produce.
        blobref: BlobRef,
        /// Reference the store reported, or an errno on failure.
        result: Result<BlobRef, i32>,
    },
}

/// Effects the service state machine emits for its driver to carry out.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a response to the request's reply route.
    Respond {
        /// The request being answered.
        envelope: RequestEnvelope,
        /// The response.
        response: Response,
    },
    /// Publish an event on the broker's event channel.
    Publish(Event),
    /// Issue a `content.load` for a reference.
    Load {
        /// Reference to load.
        blobref: BlobRef,
    },
    /// Issue a `content.store` for an object already hashed to `blobref`.
    Store {
        /// Reference the canonical encoding hashes to.
        blobref: BlobRef,
        /// The object to store.
        value: Value,
    },
    /// Forward a fence share to the root rank.
    Relay {
        /// The fence payload to relay.
        request: FenceRequest,
    },
}
