//! Byte relay for tunnels the proxy does not intercept.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes copied in each direction before the tunnel closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

/// Copy bytes both ways until either side closes or neither side has
/// produced data for `idle_timeout`.
pub async fn relay<C, O>(
    client: &mut C,
    origin: &mut O,
    idle_timeout: Duration,
) -> std::io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);
    let mut upstream = vec![0u8; BUFFER_SIZE];
    let mut downstream = vec![0u8; BUFFER_SIZE];
    let mut stats = RelayStats::default();

    loop {
        tokio::select! {
            read = client_read.read(&mut upstream) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                origin_write.write_all(&upstream[..n]).await?;
                stats.client_to_origin += n as u64;
            }
            read = origin_read.read(&mut downstream) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                client_write.write_all(&downstream[..n]).await?;
                stats.origin_to_client += n as u64;
            }
            _ = tokio::time::sleep(idle_timeout) => break,
        }
    }

    let _ = origin_write.shutdown().await;
    let _ = client_write.shutdown().await;
    Ok(stats)
}
