use proto_grpc::replica::replica_client::ReplicaClient;
use proto_redrelay::replica::{sync_response, Node, SyncRequest, SyncResponse};
use tokio::io::{AsyncWriteExt, BufReader};
use tonic::codec::Streaming;

use channel::StartPoint;

use crate::pipe::{pipe, PipeWriter};
use crate::scope::Scope;
use crate::{
    Error, DIAL_TIMEOUT, MAX_RESUME_GAP, PIPE_CAPACITY, RESTART_BACKOFF, WRITE_BUFFER,
};

use sync_response::Code;

type Client = ReplicaClient<tonic::transport::Channel>;

/// Mirrors a leader's channel into the local one.
///
/// The follower walks handshake -> pre-sync -> meta, then streams either the
/// snapshot or the AOF tail into the channel. Any retriable failure resets
/// it to the handshake after a short pause; a leadership takeover or an
/// explicit stop ends it.
pub struct ReplicaFollower {
    scope: Scope,
    input_address: String,
    leader_address: String,
    channel: channel::Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshake,
    PreSync,
    MetaSync,
    Rdb,
    Aof,
}

impl ReplicaFollower {
    pub fn new(
        leader_address: impl Into<String>,
        input_address: impl Into<String>,
        channel: channel::Channel,
        scope: Scope,
    ) -> Self {
        Self {
            scope,
            input_address: input_address.into(),
            leader_address: leader_address.into(),
            channel,
        }
    }

    /// Ask the follower to stop; its `run()` then returns `Ok`.
    pub fn stop(&self) {
        self.scope.cancel();
    }

    pub async fn run(&self) -> Result<(), Error> {
        let mut client = self.connect().await?;

        let mut state = State::Handshake;
        let mut leader_sp = StartPoint::initial();
        let mut follower_sp = StartPoint::initial();
        let mut stream: Option<Streaming<SyncResponse>> = None;
        let mut meta: Option<SyncResponse> = None;

        while !self.scope.is_cancelled() {
            let step = match state {
                State::Handshake => self.handshake(&mut client).await.map(|sp| {
                    leader_sp = sp;
                    State::PreSync
                }),
                State::PreSync => self.pre_sync(&leader_sp).await.map(|sp| {
                    follower_sp = sp;
                    State::MetaSync
                }),
                State::MetaSync => match self.meta_sync(&follower_sp, &mut client).await {
                    Ok((new_stream, resp)) => {
                        let aof = resp.meta.as_ref().map_or(false, |meta| meta.aof);
                        stream = Some(new_stream);
                        meta = Some(resp);
                        Ok(if aof { State::Aof } else { State::Rdb })
                    }
                    Err(err) => Err(err),
                },
                State::Rdb => match (stream.take(), meta.take()) {
                    (Some(stream), Some(meta)) => {
                        self.rdb_sync(&follower_sp, stream, meta).await.map(|()| {
                            follower_sp = self
                                .channel
                                .start_point(Some(std::slice::from_ref(&leader_sp.run_id)));
                            State::MetaSync
                        })
                    }
                    _ => Err(Error::Protocol("rdb stage entered without a stream".into())),
                },
                State::Aof => match (stream.take(), meta.take()) {
                    (Some(stream), Some(meta)) => self
                        .aof_sync(&follower_sp, stream, meta)
                        .await
                        .map(|()| State::Handshake),
                    _ => Err(Error::Protocol("aof stage entered without a stream".into())),
                },
            };

            match step {
                Ok(next) => state = next,
                Err(Error::Stopped) => break,
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    if self.scope.is_cancelled() {
                        break;
                    }
                    tracing::error!(state = ?state, error = %err, "sync failed; renegotiating");
                    state = State::Handshake;
                    if !self.scope.sleep(RESTART_BACKOFF).await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn connect(&self) -> Result<Client, Error> {
        let target = if self.leader_address.contains("://") {
            self.leader_address.clone()
        } else {
            format!("http://{}", self.leader_address)
        };
        let endpoint =
            tonic::transport::Endpoint::from_shared(target)?.connect_timeout(DIAL_TIMEOUT);

        let transport = tokio::select! {
            () = self.scope.cancelled() => return Err(Error::Stopped),
            conn = endpoint.connect() => conn.map_err(|err| {
                tracing::error!(leader = %self.leader_address, error = %err, "dial failed");
                Error::Transport(err)
            })?,
        };
        Ok(ReplicaClient::new(transport))
    }

    // S1: learn the leader's current start point.
    async fn handshake(&self, client: &mut Client) -> Result<StartPoint, Error> {
        let req = SyncRequest {
            node: Some(Node {
                run_id: String::new(),
                address: self.input_address.clone(),
            }),
            offset: 0,
        };
        let mut stream = self.open_stream(client, req).await?;
        let resp = self.recv(&mut stream).await?;

        let meta = resp.meta.unwrap_or_default();
        if meta.run_id.is_empty() {
            return Err(Error::EmptyRunId);
        }
        Ok(StartPoint {
            run_id: meta.run_id,
            offset: resp.offset,
        })
    }

    // S2: reconcile the local channel with the leader's run and offset.
    async fn pre_sync(&self, leader_sp: &StartPoint) -> Result<StartPoint, Error> {
        let accepted = std::slice::from_ref(&leader_sp.run_id);
        let local_sp = self.channel.start_point(Some(accepted));
        tracing::info!(leader = %leader_sp, local = %local_sp, "negotiated start points");

        if local_sp.is_initial() {
            self.channel
                .set_run_id(&leader_sp.run_id)
                .await
                .map_err(restart)?;
            return Ok(StartPoint {
                run_id: leader_sp.run_id.clone(),
                offset: local_sp.offset,
            });
        }

        let gap = leader_sp.offset - local_sp.offset;
        if gap > MAX_RESUME_GAP {
            // Too far behind to catch up from the tail: drop what we hold
            // and re-anchor at the leader's snapshot.
            tracing::warn!(gap, run_id = %local_sp.run_id, "gap exceeds resume limit; discarding local run");
            self.channel
                .del_run_id(&local_sp.run_id)
                .await
                .map_err(restart)?;
            self.channel
                .set_run_id(&leader_sp.run_id)
                .await
                .map_err(restart)?;
            return Ok(StartPoint {
                run_id: leader_sp.run_id.clone(),
                offset: channel::INITIAL_OFFSET,
            });
        }

        self.channel
            .set_run_id(&leader_sp.run_id)
            .await
            .map_err(restart)?;
        Ok(local_sp)
    }

    // S3: announce our start point; the reply routes to RDB or AOF.
    async fn meta_sync(
        &self,
        sp: &StartPoint,
        client: &mut Client,
    ) -> Result<(Streaming<SyncResponse>, SyncResponse), Error> {
        let req = SyncRequest {
            node: Some(Node {
                run_id: sp.run_id.clone(),
                address: self.input_address.clone(),
            }),
            offset: sp.offset,
        };
        let mut stream = self.open_stream(client, req).await?;
        let resp = self.recv(&mut stream).await?;
        Ok((stream, resp))
    }

    // S4: pull the snapshot into the channel's RDB writer.
    async fn rdb_sync(
        &self,
        follower_sp: &StartPoint,
        stream: Streaming<SyncResponse>,
        meta: SyncResponse,
    ) -> Result<(), Error> {
        if meta.meta.as_ref().map_or(false, |meta| meta.aof) {
            return Ok(());
        }
        let left = meta.offset;
        let size = meta.size;

        if follower_sp.offset >= 0 && left > follower_sp.offset {
            // Retained bytes predate the snapshot about to arrive; they
            // can never be served again.
            self.discard(&follower_sp.run_id).await?;
        }

        tracing::info!(offset = left, size, "starting snapshot sync from leader");

        let stage = self.scope.child();
        let (sink, source) = pipe(PIPE_CAPACITY);
        let buffered = BufReader::with_capacity(WRITE_BUFFER, source);
        let mut writer = self.channel.new_rdb_writer(buffered, left, size).await?;

        let (pulled, wrote) = tokio::join!(
            async {
                let result = self.pull(&stage, stream, sink, size).await;
                if result.is_err() {
                    stage.cancel();
                }
                result
            },
            async {
                let result = writer.run(stage.token()).await.map_err(writer_error);
                if result.is_err() {
                    stage.cancel();
                }
                result
            },
        );
        join_results(pulled, wrote)
    }

    // S5: append the tail into the channel's AOF writer, indefinitely.
    async fn aof_sync(
        &self,
        follower_sp: &StartPoint,
        stream: Streaming<SyncResponse>,
        meta: SyncResponse,
    ) -> Result<(), Error> {
        let accepted = std::slice::from_ref(&follower_sp.run_id);
        let local_sp = self.channel.start_point(Some(accepted));
        if local_sp.is_initial() {
            return Err(Error::Restart(format!(
                "run {:?} vanished before aof sync",
                follower_sp.run_id,
            )));
        }

        let left = meta.offset;
        if local_sp.offset < 0 {
            return Err(Error::Restart(format!(
                "run {:?} has no snapshot prefix to append after",
                local_sp.run_id,
            )));
        }
        if left > local_sp.offset {
            // The leader's tail begins past our head; the hole cannot be
            // filled from this session.
            self.discard(&follower_sp.run_id).await?;
            return Err(Error::Restart(format!(
                "aof resumes at {left} but the local head is {}",
                local_sp.offset,
            )));
        }
        if left < local_sp.offset {
            // The leader rewound behind our head. Appending would fork
            // retained bytes; rejected rather than silently truncated.
            return Err(Error::Protocol(format!(
                "aof overlaps retained bytes: {left} < {}",
                local_sp.offset,
            )));
        }

        tracing::info!(offset = left, "starting aof sync from leader");

        let stage = self.scope.child();
        let (sink, source) = pipe(PIPE_CAPACITY);
        let buffered = BufReader::with_capacity(WRITE_BUFFER, source);
        let mut writer = self.channel.new_aof_writer(buffered, left).await?;

        let (pulled, wrote) = tokio::join!(
            async {
                // The tail is unbounded; only an error or a stop ends it.
                let result = self.pull(&stage, stream, sink, -1).await;
                if result.is_err() {
                    stage.cancel();
                }
                result
            },
            async {
                let result = writer.run(stage.token()).await.map_err(writer_error);
                if result.is_err() {
                    stage.cancel();
                }
                result
            },
        );
        join_results(pulled, wrote)
    }

    // Receive frames and feed their payload into `sink` until `size` bytes
    // arrived (size < 0: forever), closing the pipe on every exit path.
    async fn pull(
        &self,
        stage: &Scope,
        mut stream: Streaming<SyncResponse>,
        mut sink: PipeWriter,
        size: i64,
    ) -> Result<(), Error> {
        let mut remaining = size;

        let result = loop {
            if remaining == 0 {
                break Ok(());
            }
            let msg = tokio::select! {
                () = stage.cancelled() => break Err(Error::Stopped),
                msg = stream.message() => msg,
            };
            let resp = match msg {
                Ok(Some(resp)) => match classify(resp) {
                    Ok(resp) => resp,
                    Err(err) => break Err(err),
                },
                Ok(None) => break Err(Error::Protocol("stream ended mid-transfer".into())),
                Err(status) => break Err(status.into()),
            };

            let data = resp.data;
            if data.is_empty() {
                continue;
            }
            if remaining > 0 && data.len() as i64 > remaining {
                break Err(Error::Protocol(format!(
                    "peer delivered {} bytes past the declared size",
                    data.len() as i64 - remaining,
                )));
            }
            if sink.write_all(&data).await.is_err() {
                // The writer half died; its own result carries the cause.
                break Err(Error::Stopped);
            }
            if remaining > 0 {
                remaining -= data.len() as i64;
            }
        };

        if let Err(err) = &result {
            sink.close_with_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ));
        }
        result
    }

    async fn discard(&self, run_id: &str) -> Result<(), Error> {
        self.channel.del_run_id(run_id).await.map_err(restart)?;
        self.channel.set_run_id(run_id).await.map_err(restart)?;
        Ok(())
    }

    async fn open_stream(
        &self,
        client: &mut Client,
        req: SyncRequest,
    ) -> Result<Streaming<SyncResponse>, Error> {
        let resp = tokio::select! {
            () = self.scope.cancelled() => return Err(Error::Stopped),
            resp = client.sync(req) => resp?,
        };
        Ok(resp.into_inner())
    }

    async fn recv(&self, stream: &mut Streaming<SyncResponse>) -> Result<SyncResponse, Error> {
        let msg = tokio::select! {
            () = self.scope.cancelled() => return Err(Error::Stopped),
            msg = stream.message() => msg?,
        };
        match msg {
            Some(resp) => classify(resp),
            None => Err(Error::Protocol("stream ended during negotiation".into())),
        }
    }
}

// Sort a frame into the follower's error taxonomy; non-error frames pass
// through.
fn classify(resp: SyncResponse) -> Result<SyncResponse, Error> {
    fn msg(resp: &SyncResponse) -> String {
        resp.meta
            .as_ref()
            .map(|meta| meta.msg.clone())
            .unwrap_or_default()
    }

    match Code::try_from(resp.code) {
        Ok(Code::Failure) => Err(Error::Restart(format!("peer failure: {}", msg(&resp)))),
        Ok(code @ (Code::Error | Code::Fault)) => Err(Error::Peer {
            code,
            msg: msg(&resp),
        }),
        Ok(Code::Handover) => Err(Error::LeaderTakeover {
            offset: resp.offset,
        }),
        Ok(_) => Ok(resp),
        // Unknown codes are faults of this session.
        Err(_) => Err(Error::Peer {
            code: Code::Fault,
            msg: format!("unknown response code {}", resp.code),
        }),
    }
}

fn restart(err: channel::Error) -> Error {
    Error::Restart(err.to_string())
}

fn writer_error(err: channel::Error) -> Error {
    match err {
        channel::Error::Cancelled => Error::Stopped,
        err => Error::Channel(err),
    }
}

// Prefer whichever side failed for a real reason; cancellation artifacts
// rank last.
fn join_results(pulled: Result<(), Error>, wrote: Result<(), Error>) -> Result<(), Error> {
    match (pulled, wrote) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(pulled), Err(wrote)) => {
            if matches!(pulled, Error::Stopped) {
                Err(wrote)
            } else {
                Err(pulled)
            }
        }
        (Err(pulled), Ok(())) => Err(pulled),
        (Ok(()), Err(wrote)) => Err(wrote),
    }
}
