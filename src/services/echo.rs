//! Raw echo service: every byte read is written back.

use tokio::io::{self, AsyncWriteExt};

use crate::mux::{MuxConn, SubListener};

/// Accept from `listener` until it closes, echoing each connection on its own task.
pub async fn serve(listener: SubListener) {
    let group = listener.group();
    tracing::info!(group, "Echo service starting");

    while let Ok(conn) = listener.accept().await {
        tokio::spawn(echo(conn));
    }

    tracing::info!(group, "Echo service stopped");
}

async fn echo(conn: MuxConn) {
    let connection_id = conn.id();
    let (mut reader, mut writer) = io::split(conn);
    match io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => {
            let _ = writer.shutdown().await;
            tracing::debug!(connection_id = %connection_id, bytes, "Echo finished");
        }
        Err(e) => tracing::debug!(connection_id = %connection_id, error = %e, "Echo aborted"),
    }
}
