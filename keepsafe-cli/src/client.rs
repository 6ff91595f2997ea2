//! Client operations: accounts over HTTP, sync and file transfer over
//! the framed RPC connection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::BytesMut;
use keepsafe_core::model::{CardPayload, CredentialPayload, DataItem, DataKind};
use keepsafe_core::proto::{
    self, CallBody, CallEnvelope, Chunk, ClientFrame, DownloadRequest, Reply,
    SyncRecordsRequest, MAX_CHUNK_SIZE,
};
use keepsafe_core::Error;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::session::Session;
use crate::store::LocalStore;

/// Deadline for one whole sync, file transfers included.
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for registration and login requests.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    http: reqwest::Client,
    server_url: String,
    rpc_addr: String,
    store: LocalStore,
    session: Session,
    session_path: PathBuf,
    files_dir: PathBuf,
}

/// Outcome of one sync round, for CLI reporting.
#[derive(Debug)]
pub struct SyncSummary {
    pub records: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub failed_transfers: usize,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
    user_id: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

impl Client {
    pub fn new(
        server_url: String,
        rpc_addr: String,
        db_path: &Path,
        session_path: PathBuf,
        files_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(AUTH_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            rpc_addr,
            store: LocalStore::open(db_path)?,
            session: Session::load(&session_path),
            session_path,
            files_dir,
        })
    }

    // --- accounts ---

    pub async fn register(&self, username: &str, password: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(format!("{}/register", self.server_url))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .context("registration request failed")?;

        if resp.status() != reqwest::StatusCode::CREATED {
            bail!("registration failed: {}", error_body(resp).await);
        }
        Ok(())
    }

    /// Log in and cache the bearer token for subsequent syncs.
    pub async fn login(&mut self, username: &str, password: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .context("login request failed")?;

        if !resp.status().is_success() {
            bail!("login failed: {}", error_body(resp).await);
        }

        let body: LoginResponse = resp.json().await.context("invalid login response")?;
        self.session = Session {
            token: body.token,
            user_id: body.user_id,
        };
        self.session.save(&self.session_path)?;
        Ok(())
    }

    // --- local record commands ---

    pub fn save_text(&self, text: &str, meta: &str) -> anyhow::Result<String> {
        let item = DataItem::new(
            new_id(),
            DataKind::Text,
            text.to_string(),
            meta.to_string(),
        );
        self.store.save_item(&item)?;
        Ok(item.id)
    }

    pub fn save_credential(
        &self,
        login: &str,
        password: &str,
        meta: &str,
    ) -> anyhow::Result<String> {
        let payload = CredentialPayload {
            login: login.to_string(),
            password: password.to_string(),
        };
        let item = DataItem::new(
            new_id(),
            DataKind::Credential,
            serde_json::to_string(&payload)?,
            meta.to_string(),
        );
        self.store.save_item(&item)?;
        Ok(item.id)
    }

    pub fn save_card(&self, payload: &CardPayload, meta: &str) -> anyhow::Result<String> {
        payload.validate()?;
        let item = DataItem::new(
            new_id(),
            DataKind::Card,
            serde_json::to_string(payload)?,
            meta.to_string(),
        );
        self.store.save_item(&item)?;
        Ok(item.id)
    }

    /// Copy the source file into the blob directory under a fresh id and
    /// record its original name.
    pub fn save_file(&self, source: &Path, meta: &str) -> anyhow::Result<String> {
        let base_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("file path has no file name")?;

        let item = DataItem::new(
            new_id(),
            DataKind::Binary,
            base_name,
            meta.to_string(),
        );

        std::fs::create_dir_all(&self.files_dir)?;
        let dest = self.files_dir.join(item.blob_file_name());
        std::fs::copy(source, &dest)
            .with_context(|| format!("failed to copy {} into the blob store", source.display()))?;

        self.store.save_item(&item)?;
        Ok(item.id)
    }

    pub fn list_items(&self) -> anyhow::Result<Vec<DataItem>> {
        let mut items = self.store.load_all()?;
        items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(items)
    }

    /// Remove a record locally; binary records lose their blob too.
    /// Removal is never propagated to the server.
    pub fn delete_item(&self, id: &str) -> anyhow::Result<()> {
        let item = self
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("no record with id {id}")))?;

        if item.kind == DataKind::Binary {
            let blob = self.files_dir.join(item.blob_file_name());
            match std::fs::remove_file(&blob) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to remove blob {}", blob.display())
                    })
                }
            }
        }

        self.store.delete(id)?;
        Ok(())
    }

    // --- sync ---

    /// One full sync round under a single deadline: exchange records,
    /// overwrite the local store with the merged set, then run all
    /// binary transfers to completion.
    pub async fn sync(&mut self) -> anyhow::Result<SyncSummary> {
        if self.session.is_empty() {
            bail!("no session found, please login first");
        }
        match tokio::time::timeout(SYNC_TIMEOUT, self.sync_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled).context("sync deadline exceeded"),
        }
    }

    async fn sync_inner(&mut self) -> anyhow::Result<SyncSummary> {
        tracing::debug!("gathering local records");
        let local = self.store.load_all()?;

        let mut stream = TcpStream::connect(&self.rpc_addr)
            .await
            .with_context(|| format!("cannot reach sync server at {}", self.rpc_addr))?;
        let envelope = CallEnvelope::new(
            CallBody::SyncRecords(SyncRecordsRequest {
                items: proto::records_from_items(&local),
            }),
            &self.session.token,
        );
        proto::write_message(&mut stream, &envelope).await?;

        tracing::debug!("awaiting server acknowledgement");
        let mut buf = BytesMut::new();
        let reply: Reply = proto::read_message(&mut stream, &mut buf)
            .await?
            .ok_or_else(|| Error::Transient("server closed the connection".into()))?;
        let response = match reply {
            Reply::SyncRecords(response) => response,
            Reply::Error(status) => return Err(Error::from_status(status).into()),
            other => bail!("unexpected sync reply: {other:?}"),
        };

        // The merged set is the source of truth from here on; rows with
        // ids outside it are retained (removals do not propagate).
        let merged = proto::items_from_records(response.merged, "")?;
        self.store.save_all(&merged)?;

        tracing::debug!("transferring files");
        let uploads = binary_items(response.upload_list)?;
        let downloads = binary_items(response.download_list)?;
        let upload_count = uploads.len();
        let download_count = downloads.len();

        let mut transfers = JoinSet::new();
        for item in uploads {
            let rpc_addr = self.rpc_addr.clone();
            let token = self.session.token.clone();
            let path = self.files_dir.join(item.blob_file_name());
            transfers.spawn(async move {
                let id = item.id.clone();
                (id, upload_blob(rpc_addr, token, item.id, path).await)
            });
        }
        for item in downloads {
            let rpc_addr = self.rpc_addr.clone();
            let token = self.session.token.clone();
            let path = self.files_dir.join(item.blob_file_name());
            transfers.spawn(async move {
                let id = item.id.clone();
                (id, download_blob(rpc_addr, token, item.id, path).await)
            });
        }

        // Every transfer runs to completion; failures are logged and
        // retried on the next sync because the work lists are recomputed.
        let mut failed_transfers = 0;
        while let Some(joined) = transfers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    failed_transfers += 1;
                    tracing::warn!(id = %id, error = %e, "file transfer failed");
                }
                Err(e) => {
                    failed_transfers += 1;
                    tracing::warn!(error = %e, "file transfer task failed");
                }
            }
        }

        Ok(SyncSummary {
            records: merged.len(),
            uploads: upload_count,
            downloads: download_count,
            failed_transfers,
        })
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn binary_items(records: Vec<proto::Record>) -> anyhow::Result<Vec<DataItem>> {
    let items = proto::items_from_records(records, "")?;
    Ok(items
        .into_iter()
        .filter(|item| item.kind == DataKind::Binary)
        .collect())
}

async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    }
}

/// Stream one local blob to the server and wait for its acknowledgement.
async fn upload_blob(
    rpc_addr: String,
    token: String,
    id: String,
    path: PathBuf,
) -> keepsafe_core::Result<()> {
    let mut file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::NotFound(format!("local blob {} is missing", path.display()))
        }
        _ => Error::Transient(e.to_string()),
    })?;

    let mut stream = TcpStream::connect(&rpc_addr).await?;
    proto::write_message(&mut stream, &CallEnvelope::new(CallBody::UploadFile, &token)).await?;

    let mut chunk_buf = vec![0u8; MAX_CHUNK_SIZE];
    let mut sent_any = false;
    loop {
        let n = file.read(&mut chunk_buf).await?;
        if n == 0 {
            break;
        }
        sent_any = true;
        proto::write_message(
            &mut stream,
            &ClientFrame::Chunk(Chunk {
                id: id.clone(),
                bytes: chunk_buf[..n].to_vec(),
            }),
        )
        .await?;
    }
    if !sent_any {
        // A zero-byte file still needs one chunk to name the blob.
        proto::write_message(
            &mut stream,
            &ClientFrame::Chunk(Chunk {
                id: id.clone(),
                bytes: Vec::new(),
            }),
        )
        .await?;
    }
    // Half-close tells the server the stream is complete.
    stream.shutdown().await?;

    let mut buf = BytesMut::new();
    match proto::read_message::<_, Reply>(&mut stream, &mut buf).await? {
        Some(Reply::UploadResult(result)) if result.success => Ok(()),
        Some(Reply::UploadResult(result)) => Err(Error::Internal(result.message)),
        Some(Reply::Error(status)) => Err(Error::from_status(status)),
        _ => Err(Error::Transient("upload acknowledgement missing".into())),
    }
}

/// Fetch one blob from the server into the local blob path.
async fn download_blob(
    rpc_addr: String,
    token: String,
    id: String,
    path: PathBuf,
) -> keepsafe_core::Result<()> {
    let mut stream = TcpStream::connect(&rpc_addr).await?;
    proto::write_message(
        &mut stream,
        &CallEnvelope::new(CallBody::DownloadFile(DownloadRequest { id: id.clone() }), &token),
    )
    .await?;

    // The blob file is only created once the first frame proves the
    // download is real, so a NotFound never leaves an empty file behind.
    let mut file = None;
    let mut buf = BytesMut::new();
    loop {
        match proto::read_message::<_, Reply>(&mut stream, &mut buf).await? {
            Some(Reply::Chunk(chunk)) => {
                if chunk.id != id {
                    return Err(Error::MalformedInput(format!(
                        "download for {id:?} carried chunk for {:?}",
                        chunk.id
                    )));
                }
                if file.is_none() {
                    file = Some(create_blob_file(&path).await?);
                }
                if let Some(file) = file.as_mut() {
                    file.write_all(&chunk.bytes).await?;
                }
            }
            Some(Reply::Error(status)) => return Err(Error::from_status(status)),
            Some(other) => {
                return Err(Error::MalformedInput(format!(
                    "unexpected download reply: {other:?}"
                )))
            }
            // Server half-closed: the blob is complete.
            None => break,
        }
    }

    // A zero-byte blob arrives as an immediate half-close.
    let mut file = match file {
        Some(file) => file,
        None => create_blob_file(&path).await?,
    };
    file.flush().await?;
    Ok(())
}

async fn create_blob_file(path: &Path) -> keepsafe_core::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::File::create(path).await?)
}
