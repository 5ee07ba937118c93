//! Transaction dispatch: one stream carries exactly one transaction.
//!
//! The session hands every accepted stream to [`serve_stream`], which reads
//! the request, enforces registration and rate limits, runs the engine or
//! registrar operation and writes the typed reply. Domain failures are
//! answered with `Failed{kind, reason}`; only a broken stream is returned as
//! an error.

use crate::codec::{read_message, write_message};
use crate::error::{ProtocolError, ProtocolResult, SyncError, SyncResult};
use crate::peer::PeerHandle;
use crate::server::SyncServer;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use sync_types::{
    ClientUuid, ConflictListResponse, DisconnectAck, Failed, HistoryList, Message,
    PleaseSyncMeta, RegisterClient, RegisterClientAck, RootDirAck, RootDirList,
    ShareLinkIssued,
};
use tokio::io::{AsyncRead, AsyncWrite};

/// State shared by every stream of one connection.
pub struct ConnectionContext {
    server: Arc<SyncServer>,
    peer: PeerHandle,
    client: OnceLock<ClientUuid>,
}

impl ConnectionContext {
    /// Context for a freshly accepted connection.
    pub fn new(server: Arc<SyncServer>, peer: PeerHandle) -> Self {
        Self {
            server,
            peer,
            client: OnceLock::new(),
        }
    }

    /// The uuid this connection registered as, if any.
    pub fn client(&self) -> Option<&ClientUuid> {
        self.client.get()
    }

    /// The connection handle.
    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    /// The server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    fn describe(&self) -> String {
        match self.client.get() {
            Some(uuid) => uuid.to_string(),
            None => self.peer.remote(),
        }
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The stream closed before carrying a request.
    Empty,
    /// A transaction ran (successfully or answered with `Failed`).
    Done,
    /// REGISTERCLIENT bound the connection to this uuid.
    Registered(ClientUuid),
    /// DISCONNECT removed the client; the connection should close.
    Disconnected,
}

struct Reply {
    message: Option<Message>,
    outcome: Outcome,
}

impl Reply {
    fn done(message: Message) -> Self {
        Self {
            message: Some(message),
            outcome: Outcome::Done,
        }
    }
}

struct Transaction<'a, R: ?Sized, W: ?Sized> {
    ctx: &'a ConnectionContext,
    recv: &'a mut R,
    send: &'a mut W,
    max_frame: usize,
    timeout: Duration,
}

impl<R, W> Transaction<'_, R, W>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    async fn read(&mut self, waiting_for: &'static str) -> ProtocolResult<Option<Message>> {
        tokio::time::timeout(self.timeout, read_message(self.recv, self.max_frame))
            .await
            .map_err(|_| ProtocolError::Timeout {
                waiting_for,
                secs: self.timeout.as_secs(),
            })?
    }

    async fn write(&mut self, message: &Message) -> ProtocolResult<()> {
        let written = write_message(self.send, message).await?;
        self.ctx
            .server
            .metrics()
            .bytes_sent
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Require a registered connection acting as `uuid`, then charge the rate limits.
    fn authorize(&self, uuid: &ClientUuid) -> SyncResult<()> {
        match self.ctx.client.get() {
            None => Err(ProtocolError::NotRegistered.into()),
            Some(bound) if bound != uuid => Err(SyncError::Authentication(format!(
                "connection is registered as {bound}, request names {uuid}"
            ))),
            Some(_) => self.charge(uuid),
        }
    }

    fn charge(&self, uuid: &ClientUuid) -> SyncResult<()> {
        self.ctx
            .server
            .rate_limits()
            .check_transaction(uuid)
            .map_err(|e| {
                self.ctx
                    .server
                    .metrics()
                    .rate_limit_hits
                    .fetch_add(1, Ordering::Relaxed);
                SyncError::Validation(e.to_string())
            })
    }

    async fn dispatch(&mut self, request: Message) -> SyncResult<Reply> {
        let server = self.ctx.server.clone();
        match request {
            Message::RegisterClient(req) => self.register(req).await,

            Message::RegisterRootDir(req) => {
                self.authorize(&req.uuid)?;
                server.registrar().register_root_dir(&req).await?;
                Ok(Reply::done(Message::RootDirAck(RootDirAck { uuid: req.uuid })))
            }

            Message::SyncRootDir(req) => {
                self.authorize(&req.uuid)?;
                server.registrar().sync_root_dir(&req).await?;
                Ok(Reply::done(Message::RootDirAck(RootDirAck { uuid: req.uuid })))
            }

            Message::GetRootDirs(req) => {
                self.authorize(&req.uuid)?;
                let after_paths = server.registrar().root_dirs(&req.uuid).await?;
                Ok(Reply::done(Message::RootDirList(RootDirList { after_paths })))
            }

            Message::PleaseSyncMeta(req) => self.please_sync(req).await,

            Message::PleaseSyncContent(_) => Err(SyncError::Validation(
                "PleaseSyncContent must follow PleaseSyncMeta on the same stream".to_string(),
            )),

            Message::ConflictList(req) => {
                self.authorize(&req.uuid)?;
                let conflicts = server.engine().conflict_list(&req).await?;
                Ok(Reply::done(Message::ConflictListResponse(
                    ConflictListResponse { conflicts },
                )))
            }

            Message::ChooseOne(req) => {
                self.authorize(&req.uuid)?;
                let (ack, _deliveries) = server.engine().choose_one(&req).await?;
                Ok(Reply::done(Message::ChooseOneAck(ack)))
            }

            Message::FullScan(req) => {
                self.authorize(&req.uuid)?;
                let report = server.engine().full_scan(&req).await?;
                Ok(Reply::done(Message::ScanReport(report)))
            }

            Message::GiveYou(req) => {
                self.authorize(&req.uuid)?;
                let content = server.engine().give_you(&req).await?;
                Ok(Reply::done(Message::FileContent(content)))
            }

            Message::ListHistory(req) => {
                self.authorize(&req.uuid)?;
                server
                    .registrar()
                    .resolve_root(&req.uuid, &req.after_path)
                    .await?;
                let entries = server.history().list_history(&req.after_path).await?;
                Ok(Reply::done(Message::HistoryList(HistoryList { entries })))
            }

            Message::ShareHistory(req) => {
                self.authorize(&req.uuid)?;
                server
                    .registrar()
                    .resolve_root(&req.uuid, &req.after_path)
                    .await?;
                let sharing = server
                    .history()
                    .create_share(&req.uuid, &req.after_path, req.timestamp, req.max_count)
                    .await?;
                Ok(Reply::done(Message::ShareLinkIssued(ShareLinkIssued {
                    link: sharing.link,
                })))
            }

            Message::Disconnect(req) => {
                self.authorize(&req.uuid)?;
                server.registrar().disconnect(&req.uuid).await?;
                Ok(Reply {
                    message: Some(Message::DisconnectAck(DisconnectAck { uuid: req.uuid })),
                    outcome: Outcome::Disconnected,
                })
            }

            other => Err(SyncError::ProtocolDecode(format!(
                "{} ({}) is not a client request",
                other.transaction_name(),
                message_type(&other)
            ))),
        }
    }

    async fn register(&mut self, req: RegisterClient) -> SyncResult<Reply> {
        if let Some(bound) = self.ctx.client.get() {
            if *bound != req.uuid {
                return Err(SyncError::Authentication(format!(
                    "connection is already registered as {bound}"
                )));
            }
        }
        self.ctx
            .server
            .rate_limits()
            .check_global()
            .map_err(|e| SyncError::Validation(e.to_string()))?;

        let client = self
            .ctx
            .server
            .registrar()
            .register_client(&req.uuid, &req.client_password, self.ctx.peer.clone())
            .await?;
        let _ = self.ctx.client.set(client.uuid.clone());

        Ok(Reply {
            message: Some(Message::RegisterClientAck(RegisterClientAck {
                uuid: client.uuid.clone(),
            })),
            outcome: Outcome::Registered(client.uuid),
        })
    }

    async fn please_sync(&mut self, meta: PleaseSyncMeta) -> SyncResult<Reply> {
        self.authorize(&meta.uuid)?;
        let server = self.ctx.server.clone();

        let file_meta = server.engine().file_meta(&meta).await?;
        self.write(&Message::FileMeta(file_meta)).await?;

        let content = match self.read("PleaseSyncContent").await? {
            None => {
                tracing::debug!("{} checked {} without pushing", meta.uuid, meta.after_path);
                return Ok(Reply {
                    message: None,
                    outcome: Outcome::Done,
                });
            }
            Some(Message::PleaseSyncContent(content)) => content,
            Some(other) => {
                return Err(SyncError::ProtocolDecode(format!(
                    "expected PleaseSyncContent, got {}",
                    message_type(&other)
                )))
            }
        };

        if content.uuid != meta.uuid || content.after_path != meta.after_path {
            return Err(SyncError::Validation(format!(
                "PleaseSyncContent for {} {} does not match PleaseSyncMeta for {} {}",
                content.uuid, content.after_path, meta.uuid, meta.after_path
            )));
        }
        server
            .metrics()
            .bytes_received
            .fetch_add(content.file_bytes.len() as u64, Ordering::Relaxed);

        let (ack, _deliveries) = server.engine().please_sync(content).await?;
        Ok(Reply::done(Message::PleaseSyncAck(ack)))
    }
}

/// Serve one transaction stream.
///
/// Returns an error only if the stream broke or the first request never
/// arrived in time.
pub async fn serve_stream<R, W>(
    ctx: &ConnectionContext,
    recv: &mut R,
    send: &mut W,
) -> ProtocolResult<Outcome>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let server = ctx.server.clone();
    let mut tx = Transaction {
        ctx,
        recv,
        send,
        max_frame: server.config().max_frame_size(),
        timeout: Duration::from_secs(server.config().limits.transaction_timeout_secs),
    };

    let request = match tx.read("request").await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(Outcome::Empty),
        Err(ProtocolError::Codec(e)) => {
            let err = SyncError::ProtocolDecode(e.to_string());
            fail(&mut tx, "request", err).await?;
            return Ok(Outcome::Done);
        }
        Err(e) => return Err(e),
    };

    let name = request.transaction_name();
    server
        .metrics()
        .transactions_total
        .fetch_add(1, Ordering::Relaxed);
    tracing::debug!("{} from {}", name, ctx.describe());

    match tx.dispatch(request).await {
        Ok(reply) => {
            if let Some(message) = &reply.message {
                tx.write(message).await?;
            }
            Ok(reply.outcome)
        }
        Err(err) => {
            fail(&mut tx, name, err).await?;
            Ok(Outcome::Done)
        }
    }
}

async fn fail<R, W>(
    tx: &mut Transaction<'_, R, W>,
    name: &str,
    err: SyncError,
) -> ProtocolResult<()>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    tx.ctx
        .server
        .metrics()
        .errors_total
        .fetch_add(1, Ordering::Relaxed);
    if err.is_client_error() {
        tracing::warn!("{} from {} failed: {}", name, tx.ctx.describe(), err);
    } else {
        tracing::error!("{} from {} failed: {}", name, tx.ctx.describe(), err);
    }

    tx.write(&Message::Failed(Failed {
        kind: err.kind(),
        reason: err.to_string(),
    }))
    .await
}

fn message_type(message: &Message) -> &'static str {
    match message {
        Message::RegisterClient(_) => "RegisterClient",
        Message::RegisterClientAck(_) => "RegisterClientAck",
        Message::RegisterRootDir(_) => "RegisterRootDir",
        Message::SyncRootDir(_) => "SyncRootDir",
        Message::RootDirAck(_) => "RootDirAck",
        Message::GetRootDirs(_) => "GetRootDirs",
        Message::RootDirList(_) => "RootDirList",
        Message::PleaseSyncMeta(_) => "PleaseSyncMeta",
        Message::FileMeta(_) => "FileMeta",
        Message::PleaseSyncContent(_) => "PleaseSyncContent",
        Message::PleaseSyncAck(_) => "PleaseSyncAck",
        Message::MustSync(_) => "MustSync",
        Message::ForceSync(_) => "ForceSync",
        Message::SyncAck(_) => "SyncAck",
        Message::ConflictList(_) => "ConflictList",
        Message::ConflictListResponse(_) => "ConflictListResponse",
        Message::ChooseOne(_) => "ChooseOne",
        Message::ChooseOneAck(_) => "ChooseOneAck",
        Message::FullScan(_) => "FullScan",
        Message::ScanReport(_) => "ScanReport",
        Message::Rescan(_) => "Rescan",
        Message::GiveYou(_) => "GiveYou",
        Message::FileContent(_) => "FileContent",
        Message::ListHistory(_) => "ListHistory",
        Message::HistoryList(_) => "HistoryList",
        Message::ShareHistory(_) => "ShareHistory",
        Message::ShareLinkIssued(_) => "ShareLinkIssued",
        Message::Disconnect(_) => "Disconnect",
        Message::DisconnectAck(_) => "DisconnectAck",
        Message::Failed(_) => "Failed",
    }
}
