//! The SyncRecords call.

use keepsafe_core::proto::{
    self, records_from_items, Reply, SyncRecordsRequest, SyncRecordsResponse,
};
use keepsafe_core::{Claims, Result};
use tokio::net::TcpStream;

use super::RpcServer;

pub(super) async fn handle(
    server: &RpcServer,
    stream: &mut TcpStream,
    claims: &Claims,
    req: SyncRecordsRequest,
) -> Result<()> {
    // Tag every incoming record with the authenticated user, overwriting
    // whatever the client put there.
    let client_items = proto::items_from_records(req.items, &claims.user_id)?;

    let outcome = server
        .storage
        .merge_user_items(&claims.user_id, &client_items)?;

    tracing::info!(
        user = %claims.user_id,
        merged = outcome.merged.len(),
        upload = outcome.upload_list.len(),
        download = outcome.download_list.len(),
        "records synchronized"
    );

    let response = SyncRecordsResponse {
        merged: records_from_items(&outcome.merged),
        upload_list: records_from_items(&outcome.upload_list),
        download_list: records_from_items(&outcome.download_list),
    };
    proto::write_message(stream, &Reply::SyncRecords(response)).await
}
