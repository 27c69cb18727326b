//! The durable replication channel: a single-writer, multi-reader append log
//! addressed by `(run_id, offset)`. A channel holds at most one current run,
//! which is an optional RDB snapshot anchored at some offset plus a
//! contiguous AOF suffix growing from that anchor. Readers may position
//! anywhere within the retained range and follow the AOF tail; writers are
//! exclusive per run.

use std::path::PathBuf;
use std::sync::Arc;

mod reader;
mod state;
mod writer;

pub use reader::Reader;
pub use writer::{AofWriter, RdbWriter};

use state::{RunState, Shared};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o failure on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run id {0:?} is not usable as a storage name")]
    InvalidRunId(String),
    #[error("run id {0:?} is not held by the channel")]
    UnknownRunId(String),
    #[error("the channel has no current run")]
    NoRun,
    #[error("offset {offset} of run {run_id:?} is outside the retained range")]
    InvalidOffset { run_id: String, offset: i64 },
    #[error("a writer is already live for run {0:?}")]
    WriterLive(String),
    #[error("run {0:?} already holds a complete snapshot")]
    SnapshotExists(String),
    #[error("run {0:?} has no snapshot prefix")]
    NoSnapshot(String),
    #[error("append at {offset} does not meet the head {head} of run {run_id:?}")]
    NotAtHead {
        run_id: String,
        offset: i64,
        head: i64,
    },
    #[error("run {0:?} was discarded while in use")]
    Discarded(String),
    #[error("snapshot source produced {got} bytes, expected {expected}")]
    SnapshotSize { expected: i64, got: i64 },
    #[error("source stream failed")]
    Source(#[source] std::io::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("the channel is closed")]
    Closed,
}

impl Error {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// The offset at which a run with no bytes (or no run at all) begins:
/// replay must start from the snapshot.
pub const INITIAL_OFFSET: i64 = -1;

/// A `(run_id, offset)` pair naming where replay of a run would begin.
/// The initial start point (empty run id, offset -1) means "no data yet".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPoint {
    pub run_id: String,
    pub offset: i64,
}

impl StartPoint {
    pub fn initial() -> Self {
        Self {
            run_id: String::new(),
            offset: INITIAL_OFFSET,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.run_id.is_empty()
    }
}

impl std::fmt::Display for StartPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.run_id, self.offset)
    }
}

/// A byte position within a specific run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub run_id: String,
    pub offset: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Directory under which run data is persisted.
    pub dir: PathBuf,
}

/// Handle to a replication channel. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Open the channel rooted at `config.dir`, rebuilding in-memory state
    /// from whatever a prior process persisted there. Run directories other
    /// than the current one are swept away.
    pub async fn recover(config: Config) -> Result<Self, Error> {
        let shared = state::recover(config.dir).await?;
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// The current run id, or empty if none is set.
    pub fn run_id(&self) -> String {
        let state = self.shared.state.lock().unwrap();
        state
            .current
            .as_ref()
            .map(|run| run.id.clone())
            .unwrap_or_default()
    }

    /// Make `run_id` the current run, creating empty run state when it's
    /// new. Switching away from a different run supplants it: its readers
    /// fail terminally and its files await removal. Rejected while a writer
    /// is live on the current run.
    pub async fn set_run_id(&self, run_id: &str) -> Result<(), Error> {
        valid_run_name(run_id)?;

        {
            let state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }
            match &state.current {
                Some(run) if run.id == run_id => return Ok(()),
                Some(run) if run.writer_live => {
                    return Err(Error::WriterLive(run.id.clone()))
                }
                _ => (),
            }
        }

        let dir = self.shared.run_dir(run_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| Error::io(&dir, err))?;
        state::write_current(&self.shared.dir, run_id).await?;

        let supplanted = {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }
            if let Some(run) = &state.current {
                if run.id == run_id {
                    return Ok(());
                }
                if run.writer_live {
                    return Err(Error::WriterLive(run.id.clone()));
                }
            }
            let supplanted = state.current.take().map(|run| run.id);
            let epoch = state.next_epoch();
            state.current = Some(RunState::empty(run_id.to_string(), epoch));
            supplanted
        };
        if let Some(old) = supplanted {
            tracing::info!(old = %old, new = %run_id, "run id supplanted");
        }
        // Wake readers of the supplanted run so they observe the discard.
        self.shared.tail.notify_waiters();
        Ok(())
    }

    /// Remove all bytes held for `run_id`. Idempotent: unknown runs and
    /// missing directories succeed.
    pub async fn del_run_id(&self, run_id: &str) -> Result<(), Error> {
        valid_run_name(run_id)?;

        let was_current = {
            let mut state = self.shared.state.lock().unwrap();
            match &state.current {
                Some(run) if run.id == run_id => {
                    if run.writer_live {
                        return Err(Error::WriterLive(run.id.clone()));
                    }
                    state.current = None;
                    true
                }
                _ => false,
            }
        };
        if was_current {
            state::write_current(&self.shared.dir, "").await?;
            self.shared.tail.notify_waiters();
        }

        let dir = self.shared.run_dir(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(&dir, err)),
        }
    }

    /// The start point at which replay of the current run would begin:
    /// its head, or offset -1 when the run holds no bytes yet. Returns the
    /// initial start point when there is no current run, or when `accepted`
    /// is given and doesn't contain it.
    pub fn start_point(&self, accepted: Option<&[String]>) -> StartPoint {
        let state = self.shared.state.lock().unwrap();
        let Some(run) = &state.current else {
            return StartPoint::initial();
        };
        if let Some(accepted) = accepted {
            if !accepted.iter().any(|id| *id == run.id) {
                return StartPoint::initial();
            }
        }
        StartPoint {
            run_id: run.id.clone(),
            offset: run.right().unwrap_or(INITIAL_OFFSET),
        }
    }

    /// Whether `pos` addresses a byte the channel retains: its run is
    /// current and `left <= offset <= right` (signed).
    pub fn is_valid_offset(&self, pos: &Position) -> bool {
        let state = self.shared.state.lock().unwrap();
        let Some(run) = &state.current else {
            return false;
        };
        if run.id != pos.run_id {
            return false;
        }
        match (run.left(), run.right()) {
            (Some(left), Some(right)) => left <= pos.offset && pos.offset <= right,
            _ => false,
        }
    }

    /// Open a reader at `pos`. An offset of -1 (or any offset preceding AOF
    /// coverage) yields a snapshot reader: the run's RDB bytes, continuing
    /// into the AOF if it already has bytes, else EOF. An offset within the
    /// AOF range yields a tail reader that blocks at the head.
    pub async fn new_reader(&self, pos: Position) -> Result<Reader, Error> {
        reader::open(self.shared.clone(), pos).await
    }

    /// Create the writer recording the current run's RDB snapshot, anchored
    /// at `offset` with `size` total bytes read from `src`. On completion
    /// the run becomes AOF-writable at the anchor.
    pub async fn new_rdb_writer<R>(
        &self,
        src: R,
        offset: i64,
        size: i64,
    ) -> Result<RdbWriter<R>, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        writer::new_rdb(self.shared.clone(), src, offset, size).await
    }

    /// Create the writer appending AOF bytes from `src` at `offset`, which
    /// must equal the current head. Requires a complete snapshot prefix.
    pub async fn new_aof_writer<R>(&self, src: R, offset: i64) -> Result<AofWriter<R>, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        writer::new_aof(self.shared.clone(), src, offset).await
    }

    /// Close the channel: blocked readers return EOF, writers stop at their
    /// next append.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.shared.tail.notify_waiters();
    }
}

// Run ids become directory names; restrict them to the alphabet upstream
// Redis actually uses (hex run ids) plus separators.
fn valid_run_name(id: &str) -> Result<(), Error> {
    if id.is_empty()
        || !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(Error::InvalidRunId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> Config {
        Config {
            dir: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn set_and_del_run_id_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel::recover(config(&dir)).await.unwrap();

        assert_eq!(channel.run_id(), "");
        assert!(channel.start_point(None).is_initial());

        channel.set_run_id("run-a").await.unwrap();
        assert_eq!(channel.run_id(), "run-a");
        let sp = channel.start_point(None);
        assert_eq!(sp.run_id, "run-a");
        assert_eq!(sp.offset, INITIAL_OFFSET);

        // Idempotent for the same id.
        channel.set_run_id("run-a").await.unwrap();
        assert_eq!(channel.run_id(), "run-a");

        channel.del_run_id("run-a").await.unwrap();
        assert!(channel.start_point(None).is_initial());

        // Discards are idempotent.
        channel.del_run_id("run-a").await.unwrap();

        // set; del; set is equivalent to set on an empty channel.
        channel.set_run_id("run-a").await.unwrap();
        channel.del_run_id("run-a").await.unwrap();
        channel.set_run_id("run-a").await.unwrap();
        let sp = channel.start_point(None);
        assert_eq!((sp.run_id.as_str(), sp.offset), ("run-a", INITIAL_OFFSET));
    }

    #[tokio::test]
    async fn start_point_restricted_to_accepted_runs() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel::recover(config(&dir)).await.unwrap();
        channel.set_run_id("run-a").await.unwrap();

        let accepted = vec!["run-b".to_string()];
        assert!(channel.start_point(Some(&accepted)).is_initial());

        let accepted = vec!["run-b".to_string(), "run-a".to_string()];
        assert_eq!(channel.start_point(Some(&accepted)).run_id, "run-a");
    }

    #[tokio::test]
    async fn rejects_path_like_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel::recover(config(&dir)).await.unwrap();

        for id in ["", "..", "a/b", "a\\b", "a b"] {
            assert!(matches!(
                channel.set_run_id(id).await,
                Err(Error::InvalidRunId(_))
            ));
        }
    }

    #[tokio::test]
    async fn offsets_are_valid_only_within_retained_range() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel::recover(config(&dir)).await.unwrap();
        channel.set_run_id("run-a").await.unwrap();

        let at = |offset| Position {
            run_id: "run-a".to_string(),
            offset,
        };

        // An empty run retains nothing; -1 is deliberately not valid so
        // that serving peers rewind it to the snapshot.
        assert!(!channel.is_valid_offset(&at(INITIAL_OFFSET)));
        assert!(!channel.is_valid_offset(&at(0)));

        let mut writer = channel
            .new_rdb_writer(&b"0123456789"[..], 1000, 10)
            .await
            .unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        writer.run(&cancel).await.unwrap();

        assert!(!channel.is_valid_offset(&at(999)));
        assert!(channel.is_valid_offset(&at(1000)));
        assert!(!channel.is_valid_offset(&at(1001)));
        assert!(!channel.is_valid_offset(&Position {
            run_id: "run-b".to_string(),
            offset: 1000,
        }));
    }
}
