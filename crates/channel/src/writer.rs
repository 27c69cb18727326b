use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::state::{Aof, Shared, Snapshot};
use crate::Error;

const COPY_BUFFER: usize = 64 * 1024;

// Holds the run's writer-exclusivity flag, releasing it on drop so that
// every exit path (success, error, cancellation, panic) frees the run for
// the next writer.
struct WriterGuard {
    shared: Arc<Shared>,
    run_id: String,
    epoch: u64,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(run) = &mut state.current {
            if run.id == self.run_id && run.epoch == self.epoch {
                run.writer_live = false;
            }
        }
    }
}

/// Records the current run's RDB snapshot: copies exactly `size` bytes from
/// its source into a temporary file, then atomically publishes it and
/// materializes the empty AOF at the anchor.
pub struct RdbWriter<R> {
    src: R,
    guard: WriterGuard,
    anchor: i64,
    size: i64,
    written: i64,
    file: tokio::fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

pub(crate) async fn new_rdb<R>(
    shared: Arc<Shared>,
    src: R,
    offset: i64,
    size: i64,
) -> Result<RdbWriter<R>, Error>
where
    R: AsyncRead + Unpin,
{
    let (run_id, epoch) = {
        let mut state = shared.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        let run = state.current.as_mut().ok_or(Error::NoRun)?;
        if run.writer_live {
            return Err(Error::WriterLive(run.id.clone()));
        }
        if run.rdb.is_some() {
            return Err(Error::SnapshotExists(run.id.clone()));
        }
        run.writer_live = true;
        (run.id.clone(), run.epoch)
    };
    let guard = WriterGuard {
        shared: shared.clone(),
        run_id: run_id.clone(),
        epoch,
    };

    let final_path = shared.rdb_path(&run_id, offset, size);
    let tmp_path = final_path.with_extension("rdb.tmp");
    let file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|err| Error::io(&tmp_path, err))?;

    Ok(RdbWriter {
        src,
        guard,
        anchor: offset,
        size,
        written: 0,
        file,
        tmp_path,
        final_path,
    })
}

impl<R: AsyncRead + Unpin> RdbWriter<R> {
    /// Drive the copy to completion. Returns once `size` bytes are recorded
    /// and published, or with an error on a short source, cancellation, or
    /// a discarded run.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut buf = vec![0u8; COPY_BUFFER];

        while self.written < self.size {
            let n = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                read = self.src.read(&mut buf) => read.map_err(Error::Source)?,
            };
            if n == 0 {
                return Err(Error::SnapshotSize {
                    expected: self.size,
                    got: self.written,
                });
            }
            if self.written + n as i64 > self.size {
                return Err(Error::SnapshotSize {
                    expected: self.size,
                    got: self.written + n as i64,
                });
            }
            self.file
                .write_all(&buf[..n])
                .await
                .map_err(|err| Error::io(&self.tmp_path, err))?;
            self.written += n as i64;
        }

        self.file
            .sync_all()
            .await
            .map_err(|err| Error::io(&self.tmp_path, err))?;
        // The rename publishes the snapshot: recovery treats a bare .rdb
        // file as complete.
        tokio::fs::rename(&self.tmp_path, &self.final_path)
            .await
            .map_err(|err| Error::io(&self.final_path, err))?;

        let aof_path = self.guard.shared.aof_path(&self.guard.run_id, self.anchor);
        tokio::fs::File::create(&aof_path)
            .await
            .map_err(|err| Error::io(&aof_path, err))?;

        {
            let mut state = self.guard.shared.state.lock().unwrap();
            let run = state
                .current
                .as_mut()
                .filter(|run| run.id == self.guard.run_id && run.epoch == self.guard.epoch)
                .ok_or_else(|| Error::Discarded(self.guard.run_id.clone()))?;
            run.rdb = Some(Snapshot {
                anchor: self.anchor,
                size: self.size,
            });
            run.aof = Some(Aof {
                left: self.anchor,
                head: self.anchor,
            });
        }
        self.guard.shared.tail.notify_waiters();

        tracing::info!(
            run_id = %self.guard.run_id,
            anchor = self.anchor,
            size = self.size,
            "snapshot recorded",
        );
        Ok(())
    }
}

/// Appends AOF bytes at the current run's head, indefinitely: runs until
/// its source ends, an error occurs, or it is cancelled. Each append is
/// synced before the head advances, so readers never observe torn writes.
pub struct AofWriter<R> {
    src: R,
    guard: WriterGuard,
    path: PathBuf,
    file: tokio::fs::File,
}

pub(crate) async fn new_aof<R>(
    shared: Arc<Shared>,
    src: R,
    offset: i64,
) -> Result<AofWriter<R>, Error>
where
    R: AsyncRead + Unpin,
{
    let (run_id, epoch, left) = {
        let mut state = shared.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        let run = state.current.as_mut().ok_or(Error::NoRun)?;
        if run.writer_live {
            return Err(Error::WriterLive(run.id.clone()));
        }
        if run.rdb.is_none() {
            return Err(Error::NoSnapshot(run.id.clone()));
        }
        let aof = run.aof.ok_or_else(|| Error::NoSnapshot(run.id.clone()))?;
        if offset != aof.head {
            return Err(Error::NotAtHead {
                run_id: run.id.clone(),
                offset,
                head: aof.head,
            });
        }
        run.writer_live = true;
        (run.id.clone(), run.epoch, aof.left)
    };
    let guard = WriterGuard {
        shared: shared.clone(),
        run_id: run_id.clone(),
        epoch,
    };

    let path = shared.aof_path(&run_id, left);
    let file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .await
        .map_err(|err| Error::io(&path, err))?;

    Ok(AofWriter {
        src,
        guard,
        path,
        file,
    })
}

impl<R: AsyncRead + Unpin> AofWriter<R> {
    /// Drive appends until the source ends (Ok), fails, or `cancel` fires.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut buf = vec![0u8; COPY_BUFFER];

        loop {
            let n = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                read = self.src.read(&mut buf) => read.map_err(Error::Source)?,
            };
            if n == 0 {
                return Ok(());
            }
            self.file
                .write_all(&buf[..n])
                .await
                .map_err(|err| Error::io(&self.path, err))?;
            self.file
                .sync_data()
                .await
                .map_err(|err| Error::io(&self.path, err))?;

            {
                let mut state = self.guard.shared.state.lock().unwrap();
                let run = state
                    .current
                    .as_mut()
                    .filter(|run| run.id == self.guard.run_id && run.epoch == self.guard.epoch)
                    .ok_or_else(|| Error::Discarded(self.guard.run_id.clone()))?;
                if let Some(aof) = &mut run.aof {
                    aof.head += n as i64;
                }
            }
            self.guard.shared.tail.notify_waiters();
        }
    }
}
