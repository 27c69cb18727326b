use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proto_grpc::replica::replica_server::Replica;
use proto_redrelay::replica::{sync_response, SyncRequest, SyncResponse};
use tokio_stream::wrappers::ReceiverStream;

use channel::Position;

use crate::scope::Scope;
use crate::{Error, Input, SEND_CHUNK};

use sync_response::Code;

/// Serves the local channel to follower peers over `replica.Replica/Sync`.
///
/// Each accepted session inspects the leader's own health, negotiates the
/// follower's start point against what the channel retains, and pumps
/// snapshot or tail bytes until the stream ends. A follower which is ahead
/// of this leader is answered with a single HANDOVER frame instead.
pub struct ReplicaLeader {
    started: AtomicBool,
    input: Arc<dyn Input>,
    channel: channel::Channel,
    scope: Scope,
}

impl ReplicaLeader {
    pub fn new(input: Arc<dyn Input>, channel: channel::Channel, scope: Scope) -> Self {
        Self {
            started: AtomicBool::new(false),
            input,
            channel,
            scope,
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.scope.cancel();
    }
}

#[tonic::async_trait]
impl Replica for ReplicaLeader {
    type SyncStream =
        Pin<Box<dyn futures::Stream<Item = Result<SyncResponse, tonic::Status>> + Send>>;

    async fn sync(
        &self,
        request: tonic::Request<SyncRequest>,
    ) -> Result<tonic::Response<Self::SyncStream>, tonic::Status> {
        let req = request.into_inner();
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        let session = Session {
            started: self.started.load(Ordering::SeqCst),
            input: self.input.clone(),
            channel: self.channel.clone(),
            scope: self.scope.child(),
            tx,
        };
        tokio::spawn(session.run(req));

        Ok(tonic::Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

// One Sync session: frames are pushed through a bounded queue which the
// transport drains, so a slow or gone follower backpressures (or ends) the
// pump rather than buffering without limit.
struct Session {
    started: bool,
    input: Arc<dyn Input>,
    channel: channel::Channel,
    scope: Scope,
    tx: tokio::sync::mpsc::Sender<Result<SyncResponse, tonic::Status>>,
}

impl Session {
    async fn run(self, req: SyncRequest) {
        match self.serve(req).await {
            Ok(()) => tracing::debug!("sync session ended"),
            Err(Error::LeaderHandover { offset }) => {
                tracing::info!(offset, "handed leadership over to follower");
            }
            Err(Error::Disconnected) => tracing::debug!("follower disconnected"),
            Err(Error::Stopped) => tracing::debug!("sync session stopped"),
            Err(err) => tracing::warn!(error = %err, "sync session failed"),
        }
    }

    async fn serve(&self, req: SyncRequest) -> Result<(), Error> {
        self.inspect().await?;

        let node = req.node.unwrap_or_default();
        let sp = self.channel.start_point(None);

        // Handshake: a follower with no run id learns ours and hangs up.
        if node.run_id.is_empty() || node.run_id == "?" {
            self.send(meta_frame(&sp.run_id, false, sp.offset, 0)).await?;
            return Ok(());
        }

        if self.input.run_ids().first() != Some(&node.run_id) {
            // TODO(corner case): the follower may hold a newer run id than
            // a stale upstream of ours; today it restarts and renegotiates.
            return Err(self
                .reply_error(
                    Code::Error,
                    "internal error",
                    Error::Protocol(format!("stale follower run id {:?}", node.run_id)),
                )
                .await);
        }

        // The follower is ahead of us (signed compare): surrender
        // leadership and let the surrounding system re-elect.
        if req.offset - sp.offset > 0 {
            tracing::info!(
                peer = req.offset,
                leader = sp.offset,
                "peer's offset is newer; handing over leadership",
            );
            self.send(SyncResponse {
                code: Code::Handover as i32,
                meta: Some(sync_response::Meta {
                    run_id: sp.run_id.clone(),
                    ..Default::default()
                }),
                offset: sp.offset,
                ..Default::default()
            })
            .await?;
            return Err(Error::LeaderHandover { offset: sp.offset });
        }

        self.send_data(node.run_id, req.offset).await
    }

    // Self inspection, in escalating severity: fault -> error -> failure.
    async fn inspect(&self) -> Result<(), Error> {
        if !self.started {
            return Err(self
                .reply_error(
                    Code::Failure,
                    "internal error",
                    Error::Restart("replica leader is not started".to_string()),
                )
                .await);
        }
        let run_ids = self.input.run_ids();
        if run_ids.is_empty() {
            return Err(self
                .reply_error(
                    Code::Failure,
                    "internal error",
                    Error::Restart("input has no run ids".to_string()),
                )
                .await);
        }
        let channel_run = self.channel.run_id();
        if run_ids.first() != Some(&channel_run) || !run_ids.contains(&channel_run) {
            return Err(self
                .reply_error(
                    Code::Failure,
                    "internal error",
                    Error::Restart(format!(
                        "channel run id is stale: input({run_ids:?}), channel({channel_run:?})",
                    )),
                )
                .await);
        }
        Ok(())
    }

    async fn send_data(&self, run_id: String, offset: i64) -> Result<(), Error> {
        let mut pos = Position { run_id, offset };
        if !self.channel.is_valid_offset(&pos) {
            // Forgive stale or unknown offsets by rewinding to the
            // snapshot: the follower re-anchors at whatever we retain.
            tracing::info!(
                run_id = %pos.run_id,
                offset = pos.offset,
                "offset is not retained; rewinding to the snapshot",
            );
            pos.offset = channel::INITIAL_OFFSET;
        }

        let mut reader = match self.channel.new_reader(pos).await {
            Ok(reader) => reader,
            Err(err) => {
                return Err(self
                    .reply_error(Code::Error, "internal error", err.into())
                    .await);
            }
        };

        self.send(meta_frame("", reader.is_aof(), reader.left(), reader.size()))
            .await?;
        tracing::info!(
            offset = reader.left(),
            size = reader.size(),
            aof = reader.is_aof(),
            "started sending data to follower",
        );

        let mut offset = reader.left();
        let mut remaining = match reader.size() {
            size if size < 0 => i64::MAX,
            size => size,
        };
        let mut buf = vec![0u8; SEND_CHUNK];

        while remaining > 0 {
            let read = tokio::select! {
                () = self.scope.cancelled() => return Err(Error::Stopped),
                read = reader.read(&mut buf) => read,
            };
            let n = match read {
                // EOF: a finite snapshot stream is fully consumed.
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(err) => {
                    return Err(self.reply_error(Code::Fault, "reader error", err.into()).await);
                }
            };

            offset += n as i64;
            self.send(SyncResponse {
                code: Code::Continue as i32,
                offset,
                size: n as i64,
                data: buf[..n].to_vec().into(),
                ..Default::default()
            })
            .await?;
            remaining -= n as i64;
        }
        Ok(())
    }

    async fn send(&self, resp: SyncResponse) -> Result<(), Error> {
        self.tx
            .send(Ok(resp))
            .await
            .map_err(|_| Error::Disconnected)
    }

    // Log `err` at the severity its code implies, report `msg` to the peer,
    // and hand the error back for propagation.
    async fn reply_error(&self, code: Code, msg: &str, err: Error) -> Error {
        if code >= Code::Error {
            tracing::error!(error = %err, "sync session error");
        } else {
            tracing::warn!(error = %err, "sync session error");
        }
        let _ = self
            .send(SyncResponse {
                code: code as i32,
                meta: Some(sync_response::Meta {
                    msg: msg.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await;
        err
    }
}

fn meta_frame(run_id: &str, aof: bool, offset: i64, size: i64) -> SyncResponse {
    SyncResponse {
        code: Code::Meta as i32,
        meta: Some(sync_response::Meta {
            run_id: run_id.to_string(),
            aof,
            ..Default::default()
        }),
        offset,
        size,
        ..Default::default()
    }
}
