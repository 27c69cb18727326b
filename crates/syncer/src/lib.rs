//! Peer-to-peer synchronization of a replication channel: a leader serves
//! the channel's bytes over the streaming `replica.Replica/Sync` RPC, and a
//! follower drives a negotiate/snapshot/tail state machine to mirror them
//! into its own channel.

use std::sync::{Arc, RwLock};
use std::time::Duration;

mod follower;
mod leader;
pub mod pipe;
pub mod scope;

pub use follower::ReplicaFollower;
pub use leader::ReplicaLeader;

use proto_redrelay::replica::sync_response::Code;

// Chunk size of leader CONTINUE frames.
pub(crate) const SEND_CHUNK: usize = 4 * 1024;
// Gap beyond which stale local data is discarded in favor of a fresh
// snapshot.
pub(crate) const MAX_RESUME_GAP: i64 = 100 * 1024 * 1024;
// Capacity of the pipe between the frame puller and the channel writer;
// the sole backpressure path toward the leader.
pub(crate) const PIPE_CAPACITY: usize = 10 * 1024 * 1024;
// Buffered-reader size in front of channel writers.
pub(crate) const WRITE_BUFFER: usize = 64 * 1024;
// Pause between follower restart attempts.
pub(crate) const RESTART_BACKOFF: Duration = Duration::from_secs(3);
// Blocking-dial timeout toward the leader.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport failure")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc failure")]
    Grpc(#[from] tonic::Status),
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// The peer reported a retriable problem (codes ERROR and FAULT).
    #[error("peer replied {code}: {msg}")]
    Peer { code: Code, msg: String },
    /// Systemic failure: the whole sync pipeline should restart.
    #[error("restart required: {0}")]
    Restart(String),
    /// The peer is ahead of this leader; it takes over leadership.
    #[error("peer takes over leadership from offset {offset}")]
    LeaderTakeover { offset: i64 },
    /// This leader surrendered leadership to a follower which is ahead.
    #[error("leadership handed over at offset {offset}")]
    LeaderHandover { offset: i64 },
    #[error("handshake returned an empty run id")]
    EmptyRunId,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("follower disconnected")]
    Disconnected,
    #[error("stopped")]
    Stopped,
}

impl Error {
    /// Errors which terminate a follower rather than restarting it: a role
    /// change, or an explicit stop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::LeaderTakeover { .. } | Error::LeaderHandover { .. } | Error::Stopped
        )
    }

    /// Whether this error carries the restart marker: destructive recovery
    /// happened (or is needed) and the surrounding pipeline should observe
    /// it.
    pub fn needs_restart(&self) -> bool {
        matches!(self, Error::Restart(_))
    }
}

/// The upstream-side view of current and recent run ids, most current
/// first. Fed by whatever consumes the upstream Redis (an external
/// collaborator of this crate).
pub trait Input: Send + Sync + 'static {
    fn run_ids(&self) -> Vec<String>;
}

/// An [`Input`] whose run ids are pushed in from outside, e.g. by topology
/// discovery or the upstream consumer.
pub struct SharedInput {
    ids: RwLock<Vec<String>>,
}

impl SharedInput {
    pub fn new(ids: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            ids: RwLock::new(ids),
        })
    }

    pub fn update(&self, ids: Vec<String>) {
        *self.ids.write().unwrap() = ids;
    }
}

impl Input for SharedInput {
    fn run_ids(&self) -> Vec<String> {
        self.ids.read().unwrap().clone()
    }
}
