//! In-memory channel state and the on-disk layout it is recovered from.
//!
//! Layout under the channel directory:
//! ```text
//! CURRENT                    run id of the current run (possibly empty)
//! <run_id>/<anchor>-<size>.rdb    complete snapshot (tmp-renamed on finish)
//! <run_id>/<left>.aof             append-only suffix; head = left + len
//! ```
//! A `.rdb.tmp` file is an abandoned snapshot write and is deleted on
//! recovery; the rename to `.rdb` is the completeness marker.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::Error;

pub(crate) struct Shared {
    pub dir: PathBuf,
    pub state: Mutex<State>,
    // Signalled on every append, close, and run discard. Readers blocked at
    // the head re-check state on each signal.
    pub tail: Notify,
}

impl Shared {
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.dir.join(run_id)
    }

    pub fn rdb_path(&self, run_id: &str, anchor: i64, size: i64) -> PathBuf {
        self.run_dir(run_id).join(format!("{anchor}-{size}.rdb"))
    }

    pub fn aof_path(&self, run_id: &str, left: i64) -> PathBuf {
        self.run_dir(run_id).join(format!("{left}.aof"))
    }
}

pub(crate) struct State {
    pub closed: bool,
    pub current: Option<RunState>,
    epoch: u64,
}

impl State {
    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}

pub(crate) struct RunState {
    pub id: String,
    // Distinguishes this run from a later recreation under the same id;
    // readers and writers carry the epoch they were created against.
    pub epoch: u64,
    pub rdb: Option<Snapshot>,
    pub aof: Option<Aof>,
    pub writer_live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub anchor: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Aof {
    pub left: i64,
    pub head: i64,
}

impl RunState {
    pub fn empty(id: String, epoch: u64) -> Self {
        Self {
            id,
            epoch,
            rdb: None,
            aof: None,
            writer_live: false,
        }
    }

    /// Lowest retained offset, if any bytes are held.
    pub fn left(&self) -> Option<i64> {
        self.rdb
            .map(|rdb| rdb.anchor)
            .or(self.aof.map(|aof| aof.left))
    }

    /// The write head: the next offset to be appended.
    pub fn right(&self) -> Option<i64> {
        self.aof
            .map(|aof| aof.head)
            .or(self.rdb.map(|rdb| rdb.anchor))
    }
}

pub(crate) async fn write_current(dir: &Path, run_id: &str) -> Result<(), Error> {
    let tmp = dir.join("CURRENT.tmp");
    let path = dir.join("CURRENT");
    tokio::fs::write(&tmp, run_id.as_bytes())
        .await
        .map_err(|err| Error::io(&tmp, err))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|err| Error::io(&path, err))
}

pub(crate) async fn recover(dir: PathBuf) -> Result<Shared, Error> {
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| Error::io(&dir, err))?;

    let current_path = dir.join("CURRENT");
    let current = match tokio::fs::read_to_string(&current_path).await {
        Ok(contents) => contents.trim().to_string(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(Error::io(&current_path, err)),
    };

    // Sweep run directories which are not current: they were supplanted or
    // partially discarded by a prior process.
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|err| Error::io(&dir, err))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| Error::io(&dir, err))?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "CURRENT" || name == "CURRENT.tmp" || (!current.is_empty() && name == current)
        {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            tracing::debug!(run = %name, "sweeping stale run directory");
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|err| Error::io(&path, err))?;
        }
    }

    let mut state = State {
        closed: false,
        current: None,
        epoch: 0,
    };

    if !current.is_empty() {
        let run_dir = dir.join(&current);
        match scan_run(&run_dir, &current).await? {
            Some(mut run) => {
                run.epoch = state.next_epoch();
                tracing::info!(
                    run = %run.id,
                    left = run.left(),
                    right = run.right(),
                    "recovered replication channel",
                );
                state.current = Some(run);
            }
            None => {
                tracing::warn!(run = %current, "discarding damaged run directory");
                if let Err(err) = tokio::fs::remove_dir_all(&run_dir).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        return Err(Error::io(&run_dir, err));
                    }
                }
                write_current(&dir, "").await?;
            }
        }
    }

    Ok(Shared {
        dir,
        state: Mutex::new(state),
        tail: Notify::new(),
    })
}

// Reconstruct a RunState from its directory, or None if the contents are
// not a state any writer sequence could have left behind.
async fn scan_run(run_dir: &Path, id: &str) -> Result<Option<RunState>, Error> {
    let mut rdb: Option<Snapshot> = None;
    let mut aof: Option<Aof> = None;

    let mut entries = match tokio::fs::read_dir(run_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::io(run_dir, err)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| Error::io(run_dir, err))?
    {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name.ends_with(".rdb.tmp") {
            tracing::debug!(file = %name, "removing abandoned snapshot write");
            tokio::fs::remove_file(&path)
                .await
                .map_err(|err| Error::io(&path, err))?;
        } else if let Some(stem) = name.strip_suffix(".rdb") {
            let Some(snapshot) = parse_rdb_name(stem) else {
                return Ok(None);
            };
            let len = entry
                .metadata()
                .await
                .map_err(|err| Error::io(&path, err))?
                .len();
            if rdb.is_some() || len as i64 != snapshot.size {
                return Ok(None);
            }
            rdb = Some(snapshot);
        } else if let Some(stem) = name.strip_suffix(".aof") {
            let Ok(left) = stem.parse::<i64>() else {
                return Ok(None);
            };
            let len = entry
                .metadata()
                .await
                .map_err(|err| Error::io(&path, err))?
                .len();
            if aof.is_some() {
                return Ok(None);
            }
            aof = Some(Aof {
                left,
                head: left + len as i64,
            });
        }
    }

    match (rdb, aof) {
        // Crashed between the snapshot rename and materializing its AOF.
        (Some(snapshot), None) => {
            let aof_path = run_dir.join(format!("{}.aof", snapshot.anchor));
            tokio::fs::File::create(&aof_path)
                .await
                .map_err(|err| Error::io(&aof_path, err))?;
            aof = Some(Aof {
                left: snapshot.anchor,
                head: snapshot.anchor,
            });
        }
        (Some(snapshot), Some(suffix)) if suffix.left != snapshot.anchor => return Ok(None),
        // An AOF with no snapshot prefix cannot be replayed.
        (None, Some(_)) => return Ok(None),
        _ => (),
    }

    Ok(Some(RunState {
        id: id.to_string(),
        epoch: 0,
        rdb,
        aof,
        writer_live: false,
    }))
}

// "<anchor>-<size>" where anchor may itself be negative.
fn parse_rdb_name(stem: &str) -> Option<Snapshot> {
    let (anchor, size) = stem.rsplit_once('-')?;
    Some(Snapshot {
        anchor: anchor.parse().ok()?,
        size: size.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdb_names_round_trip_signed_anchors() {
        for (anchor, size) in [(0i64, 10i64), (1000, 500), (-7, 3)] {
            let stem = format!("{anchor}-{size}");
            assert_eq!(parse_rdb_name(&stem), Some(Snapshot { anchor, size }));
        }
        assert_eq!(parse_rdb_name("garbage"), None);
    }
}
