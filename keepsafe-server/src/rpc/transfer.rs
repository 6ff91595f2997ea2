//! Streaming file upload and download.

use keepsafe_core::proto::{
    self, Chunk, ClientFrame, DownloadRequest, Reply, UploadResult, MAX_CHUNK_SIZE,
};
use keepsafe_core::{Claims, Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::RpcServer;

/// Receive a chunk stream into a temporary file and publish it under
/// the caller's directory once the client half-closes.
pub(super) async fn handle_upload(
    server: &RpcServer,
    stream: &mut TcpStream,
    buf: &mut bytes::BytesMut,
    claims: &Claims,
) -> Result<()> {
    // The first chunk pins the blob id; later chunks may not change it.
    let first = match proto::read_message::<_, ClientFrame>(stream, buf).await? {
        Some(ClientFrame::Chunk(chunk)) => chunk,
        None => {
            return Err(Error::MalformedInput(
                "upload stream carried no chunks".into(),
            ))
        }
    };
    check_chunk(&first)?;

    let id = first.id.clone();
    let mut upload = server.files.begin_upload(&claims.user_id, &id).await?;
    let mut received = 0u64;

    if let Err(err) = upload.write_chunk(&first.bytes).await {
        upload.discard().await;
        return Err(err);
    }
    received += first.bytes.len() as u64;

    loop {
        match proto::read_message::<_, ClientFrame>(stream, buf).await {
            Ok(Some(ClientFrame::Chunk(chunk))) => {
                let accepted = check_chunk(&chunk).and_then(|_| {
                    if chunk.id != id {
                        Err(Error::MalformedInput(format!(
                            "chunk id changed mid-stream: {:?} then {:?}",
                            id, chunk.id
                        )))
                    } else {
                        Ok(())
                    }
                });
                if let Err(err) = accepted {
                    upload.discard().await;
                    return Err(err);
                }
                if let Err(err) = upload.write_chunk(&chunk.bytes).await {
                    upload.discard().await;
                    return Err(err);
                }
                received += chunk.bytes.len() as u64;
            }
            // Client half-closed: the stream is complete.
            Ok(None) => break,
            Err(err) => {
                upload.discard().await;
                return Err(err);
            }
        }
    }

    upload.publish().await?;
    tracing::info!(user = %claims.user_id, id = %id, bytes = received, "file uploaded");

    proto::write_message(
        stream,
        &Reply::UploadResult(UploadResult {
            id,
            success: true,
            message: format!("stored {received} bytes"),
        }),
    )
    .await
}

/// Stream a published blob back in chunks and half-close on EOF.
///
/// The directory is resolved from the authenticated user, never from
/// the request, so a caller cannot reach another user's file by
/// guessing an id.
pub(super) async fn handle_download(
    server: &RpcServer,
    stream: &mut TcpStream,
    claims: &Claims,
    req: DownloadRequest,
) -> Result<()> {
    let mut file = server.files.open_blob(&claims.user_id, &req.id).await?;

    let mut chunk_buf = vec![0u8; MAX_CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut chunk_buf).await?;
        if n == 0 {
            break;
        }
        proto::write_message(
            stream,
            &Reply::Chunk(Chunk {
                id: req.id.clone(),
                bytes: chunk_buf[..n].to_vec(),
            }),
        )
        .await?;
        sent += n as u64;
    }

    stream.shutdown().await?;
    tracing::info!(user = %claims.user_id, id = %req.id, bytes = sent, "file downloaded");
    Ok(())
}

fn check_chunk(chunk: &Chunk) -> Result<()> {
    if chunk.bytes.len() > MAX_CHUNK_SIZE {
        return Err(Error::MalformedInput(format!(
            "chunk of {} bytes exceeds the {} byte limit",
            chunk.bytes.len(),
            MAX_CHUNK_SIZE
        )));
    }
    Ok(())
}
