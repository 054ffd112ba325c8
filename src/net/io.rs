//! Socket reads and writes staged through the worker's buffer pool.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::{BufferPool, SizeClass};
use crate::error::EngineError;

/// Read once from `reader` into a pooled buffer and append the bytes to
/// `dst`. Returns 0 on EOF.
pub async fn read_pooled<R>(reader: &mut R, pool: &BufferPool, dst: &mut BytesMut) -> Result<usize, EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut handle = pool.acquire(SizeClass::Standard).await?;
    let n = reader.read_buf(&mut *handle).await?;
    dst.extend_from_slice(&handle[..n]);
    Ok(n)
}

/// Write all of `data`, copying it through pooled write buffers.
pub async fn write_pooled<W>(writer: &mut W, pool: &BufferPool, data: &[u8]) -> Result<(), EngineError>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    let mut handle = pool.acquire(SizeClass::Large).await?;
    let chunk = handle.capacity().max(1);
    for piece in data.chunks(chunk) {
        handle.clear();
        handle.extend_from_slice(piece);
        writer.write_all(&handle).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;

    fn pool(capacity: usize) -> BufferPool {
        BufferPool::new(&BufferConfig {
            buffer_size: 16,
            large_buffer_size: 32,
            pool_capacity: capacity,
            acquire_timeout_ms: 10,
        })
    }

    #[tokio::test]
    async fn read_appends_and_releases() {
        let pool = pool(1);
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"hello").await.unwrap();

        let mut dst = BytesMut::from(&b">"[..]);
        let n = read_pooled(&mut server, &pool, &mut dst).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&dst[..], b">hello");
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn write_larger_than_buffer() {
        let pool = pool(1);
        let (mut client, mut server) = tokio::io::duplex(256);
        let data = vec![7u8; 100];
        write_pooled(&mut server, &pool, &data).await.unwrap();
        drop(server);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn exhausted_pool_is_resource_error() {
        let pool = pool(1);
        let _held = pool.try_acquire(SizeClass::Standard).unwrap();
        let (_client, mut server) = tokio::io::duplex(8);
        let err = read_pooled(&mut server, &pool, &mut BytesMut::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhaustion(_)));
    }
}
