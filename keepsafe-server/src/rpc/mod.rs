//! Framed RPC surface: record sync and file transfer.
//!
//! Each TCP connection carries exactly one call. The opening frame is a
//! [`CallEnvelope`]; its `authorization` metadata is verified before
//! any dispatch, and the user it binds is the user every subsequent
//! operation on the connection acts as.

mod sync;
mod transfer;

use bytes::BytesMut;
use keepsafe_core::proto::{self, CallBody, CallEnvelope, Reply};
use keepsafe_core::{Result, TokenAuthority};
use tokio::net::{TcpListener, TcpStream};

use crate::files::FileStore;
use crate::storage::Storage;

/// Serves sync and file-transfer calls over framed TCP connections.
#[derive(Clone)]
pub struct RpcServer {
    pub(crate) storage: Storage,
    pub(crate) tokens: TokenAuthority,
    pub(crate) files: FileStore,
}

impl RpcServer {
    pub fn new(storage: Storage, tokens: TokenAuthority, files: FileStore) -> Self {
        Self {
            storage,
            tokens,
            files,
        }
    }

    /// Accept loop; one task per connection.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    tracing::warn!(%peer, error = %e, "rpc connection failed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let envelope: CallEnvelope = match proto::read_message(&mut stream, &mut buf).await? {
            Some(envelope) => envelope,
            // The peer connected and went away without a call.
            None => return Ok(()),
        };

        if let Err(err) = self.dispatch(&mut stream, &mut buf, envelope).await {
            tracing::warn!(error = %err, "rpc call failed");
            let _ = proto::write_message(&mut stream, &Reply::Error(err.to_status())).await;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        stream: &mut TcpStream,
        buf: &mut BytesMut,
        envelope: CallEnvelope,
    ) -> Result<()> {
        if envelope.version != proto::PROTOCOL_VERSION {
            return Err(keepsafe_core::Error::MalformedInput(format!(
                "unsupported protocol version {}",
                envelope.version
            )));
        }

        // Authentication pins the user for the remainder of the call.
        let claims = self.tokens.extract(envelope.authorization())?;

        match envelope.body {
            CallBody::SyncRecords(req) => sync::handle(self, stream, &claims, req).await,
            CallBody::UploadFile => transfer::handle_upload(self, stream, buf, &claims).await,
            CallBody::DownloadFile(req) => {
                transfer::handle_download(self, stream, &claims, req).await
            }
        }
    }
}
