use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::state::Shared;
use crate::{Error, Position, INITIAL_OFFSET};

/// A positioned reader over one run of the channel.
///
/// Snapshot readers (`is_aof() == false`) yield the run's RDB bytes and, if
/// the AOF already has bytes once the snapshot is consumed, continue into it
/// without a seam; an RDB-only stream ends with EOF instead. Tail readers
/// (`is_aof() == true`) yield AOF bytes from their start position and block
/// at the write head until more arrive or the channel closes.
pub struct Reader {
    shared: Arc<Shared>,
    run_id: String,
    epoch: u64,
    left: i64,
    size: i64,
    is_aof: bool,
    mode: Mode,
    file: tokio::fs::File,
    path: PathBuf,
}

enum Mode {
    Snapshot { remaining: i64 },
    Tail { offset: i64 },
}

// What the next read should do, decided under the state lock.
enum Step {
    Read { cap: usize },
    // The snapshot is consumed and the AOF has bytes: switch over.
    Seam { path: PathBuf, offset: i64 },
    Wait,
    Eof,
}

pub(crate) async fn open(shared: Arc<Shared>, pos: Position) -> Result<Reader, Error> {
    enum Open {
        Snapshot { anchor: i64, size: i64 },
        Tail { aof_left: i64 },
    }

    // Note a closed channel still serves its retained bytes; closure only
    // turns blocking tail reads into EOF.
    let (epoch, open) = {
        let state = shared.state.lock().unwrap();
        let run = state
            .current
            .as_ref()
            .filter(|run| run.id == pos.run_id)
            .ok_or_else(|| Error::UnknownRunId(pos.run_id.clone()))?;

        let covered = run
            .aof
            .filter(|aof| aof.left <= pos.offset && pos.offset <= aof.head);

        let open = if let Some(aof) = covered {
            Open::Tail { aof_left: aof.left }
        } else if pos.offset != INITIAL_OFFSET
            && run.right().map_or(false, |right| pos.offset > right)
        {
            return Err(Error::InvalidOffset {
                run_id: pos.run_id.clone(),
                offset: pos.offset,
            });
        } else {
            // Below AOF coverage (or the -1 sentinel): replay starts from
            // the snapshot.
            let rdb = run
                .rdb
                .ok_or_else(|| Error::NoSnapshot(pos.run_id.clone()))?;
            Open::Snapshot {
                anchor: rdb.anchor,
                size: rdb.size,
            }
        };
        (run.epoch, open)
    };

    let (path, seek_to, mode, left, size, is_aof) = match open {
        Open::Snapshot { anchor, size } => (
            shared.rdb_path(&pos.run_id, anchor, size),
            0,
            Mode::Snapshot { remaining: size },
            anchor,
            size,
            false,
        ),
        Open::Tail { aof_left } => (
            shared.aof_path(&pos.run_id, aof_left),
            (pos.offset - aof_left) as u64,
            Mode::Tail { offset: pos.offset },
            pos.offset,
            -1,
            true,
        ),
    };

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|err| Error::io(&path, err))?;
    if seek_to != 0 {
        file.seek(std::io::SeekFrom::Start(seek_to))
            .await
            .map_err(|err| Error::io(&path, err))?;
    }

    Ok(Reader {
        shared,
        run_id: pos.run_id,
        epoch,
        left,
        size,
        is_aof,
        mode,
        file,
        path,
    })
}

impl Reader {
    /// Whether this reader yields AOF bytes (true) or snapshot bytes (false).
    pub fn is_aof(&self) -> bool {
        self.is_aof
    }

    /// The offset this reader began at: the snapshot anchor, or the
    /// requested tail position.
    pub fn left(&self) -> i64 {
        self.left
    }

    /// Total snapshot bytes for a snapshot reader; -1 (unbounded) for a
    /// tail reader.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Read up to `buf.len()` bytes. Returns 0 at EOF: a fully-consumed
    /// RDB-only stream, or channel closure once the tail is drained. Fails
    /// with [`Error::Discarded`] if the run was deleted or supplanted.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let shared = self.shared.clone();

        loop {
            // Arm the tail signal before inspecting state, so an append
            // between the check and the await is not lost.
            let notified = shared.tail.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.plan(buf.len())? {
                Step::Read { cap } => {
                    let n = self
                        .file
                        .read(&mut buf[..cap])
                        .await
                        .map_err(|err| Error::io(&self.path, err))?;
                    if n == 0 {
                        // The state machine said `cap` bytes exist; a short
                        // file means the segment is gone or truncated.
                        return Err(Error::io(
                            &self.path,
                            std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
                        ));
                    }
                    match &mut self.mode {
                        Mode::Snapshot { remaining } => *remaining -= n as i64,
                        Mode::Tail { offset } => *offset += n as i64,
                    }
                    return Ok(n);
                }
                Step::Seam { path, offset } => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .map_err(|err| Error::io(&path, err))?;
                    self.file = file;
                    self.path = path;
                    self.mode = Mode::Tail { offset };
                }
                Step::Wait => notified.await,
                Step::Eof => return Ok(0),
            }
        }
    }

    fn plan(&self, want: usize) -> Result<Step, Error> {
        let state = self.shared.state.lock().unwrap();
        let run = state
            .current
            .as_ref()
            .filter(|run| run.id == self.run_id && run.epoch == self.epoch)
            .ok_or_else(|| Error::Discarded(self.run_id.clone()))?;

        match self.mode {
            Mode::Snapshot { remaining } if remaining > 0 => Ok(Step::Read {
                cap: want.min(remaining as usize),
            }),
            Mode::Snapshot { .. } => match run.aof {
                Some(aof) if aof.head > aof.left => Ok(Step::Seam {
                    path: self.shared.aof_path(&self.run_id, aof.left),
                    offset: aof.left,
                }),
                _ => Ok(Step::Eof),
            },
            Mode::Tail { offset } => {
                let head = run.aof.map(|aof| aof.head).unwrap_or(offset);
                let avail = head - offset;
                if avail > 0 {
                    Ok(Step::Read {
                        cap: want.min(avail as usize),
                    })
                } else if state.closed {
                    Ok(Step::Eof)
                } else {
                    Ok(Step::Wait)
                }
            }
        }
    }
}
