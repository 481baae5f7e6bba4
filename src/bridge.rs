use crate::pool::BufferPool;
use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// bridge_http pipes a non-SOCKS5 client into the internal HTTP proxy
/// listening on `bridge_addr`. Each direction is copied on its own task;
/// the first I/O error ends the session and is returned. A direction that
/// reaches EOF half-closes its destination and the session ends once
/// both directions are done.
pub async fn bridge_http<S>(
    client: S,
    bridge_addr: SocketAddr,
    pool: Arc<BufferPool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let target = TcpStream::connect(bridge_addr)
        .await
        .with_context(|| format!("failed to reach http bridge at {bridge_addr}"))?;

    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = target.into_split();

    let (done_tx, mut done_rx) = mpsc::channel(2);
    let upstream = tokio::spawn(pump(client_read, target_write, pool.clone(), done_tx.clone()));
    let downstream = tokio::spawn(pump(target_read, client_write, pool, done_tx));

    let mut result = Ok(());
    let mut finished = 0;
    while finished < 2 {
        match done_rx.recv().await {
            Some(Ok(bytes)) => {
                debug!("http bridge direction finished after {} bytes", bytes);
                finished += 1;
            }
            Some(Err(e)) => {
                result = Err(e).context("http bridge copy failed");
                break;
            }
            None => break,
        }
    }

    upstream.abort();
    downstream.abort();
    result
}

/// pump copies one direction and reports the outcome
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    pool: Arc<BufferPool>,
    done: mpsc::Sender<io::Result<u64>>,
)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get().await;
    let result = copy_with_buffer(&mut reader, &mut writer, &mut buf).await;
    pool.put(buf).await;
    let _ = done.send(result).await;
}

async fn copy_with_buffer<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{BufReader, duplex};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pipes_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bridge_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            conn.read_to_end(&mut request).await.unwrap();
            conn.write_all(&request).await.unwrap();
            conn.write_all(b" handled").await.unwrap();
        });

        let (server_side, mut client) = duplex(1024);
        let pool = Arc::new(BufferPool::new(64));
        let task = tokio::spawn(bridge_http(server_side, bridge_addr, pool));

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"GET / HTTP/1.1\r\n\r\n handled");

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn buffered_bytes_are_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bridge_addr = listener.local_addr().unwrap();
        let received = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 1];
            conn.read_exact(&mut first).await.unwrap();
            first[0]
        });

        let (server_side, mut client) = duplex(1024);
        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();

        // the peeked byte sits in the BufReader and must still reach the bridge
        let mut buffered = BufReader::new(server_side);
        let peeked = tokio::io::AsyncBufReadExt::fill_buf(&mut buffered).await.unwrap()[0];
        assert_eq!(peeked, 0x16);

        tokio::spawn(bridge_http(buffered, bridge_addr, Arc::new(BufferPool::default())));
        assert_eq!(received.await.unwrap(), 0x16);
    }

    #[tokio::test]
    async fn unreachable_bridge_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bridge_addr = listener.local_addr().unwrap();
        drop(listener);

        let (server_side, _client) = duplex(64);
        let err = bridge_http(server_side, bridge_addr, Arc::new(BufferPool::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to reach http bridge"));
    }
}
