use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::proxy::ConnHandle;

/// Copy buffer per direction.
const COPY_BUF_SIZE: usize = 4096;

/// Outcome of one copy direction.
struct HalfDone {
    direction: &'static str,
    bytes: u64,
    err: Option<std::io::Error>,
}

/// Pump bytes both ways until either direction ends (EOF or error) or the
/// connection handle is cancelled. Whichever happens first wins; returning
/// drops both streams, which closes them and makes the surviving direction's
/// I/O fail promptly.
///
/// Returns the byte count and error (if any) of the direction that finished.
pub async fn run<L, R>(local: L, remote: R, handle: &ConnHandle) -> (u64, Option<std::io::Error>)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_r, mut local_w) = tokio::io::split(local);
    let (mut remote_r, mut remote_w) = tokio::io::split(remote);

    let client_to_server = copy_half(&mut local_r, &mut remote_w, handle, "client->server");
    let server_to_client = copy_half(&mut remote_r, &mut local_w, handle, "server->client");
    tokio::pin!(client_to_server);
    tokio::pin!(server_to_client);

    let done = tokio::select! {
        d = &mut client_to_server => d,
        d = &mut server_to_client => d,
        _ = handle.token().cancelled() => {
            debug!(
                "conn {} ({}): closed by proxy",
                handle.conn_id, handle.instance
            );
            return (0, None);
        }
    };

    match &done.err {
        None => debug!(
            "conn {} ({}): {} finished after {} bytes",
            handle.conn_id, handle.instance, done.direction, done.bytes
        ),
        Some(e) => debug!(
            "conn {} ({}): {} failed after {} bytes: {}",
            handle.conn_id, handle.instance, done.direction, done.bytes, e
        ),
    }
    (done.bytes, done.err)
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    handle: &ConnHandle,
    direction: &'static str,
) -> HalfDone
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut bytes = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                return HalfDone {
                    direction,
                    bytes,
                    err: None,
                };
            }
            Ok(n) => n,
            Err(e) => {
                return HalfDone {
                    direction,
                    bytes,
                    err: Some(std::io::Error::new(e.kind(), format!("read: {}", e))),
                };
            }
        };
        handle.touch();
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return HalfDone {
                direction,
                bytes,
                err: Some(std::io::Error::new(e.kind(), format!("write: {}", e))),
            };
        }
        handle.touch();
        bytes += n as u64;
    }
}
