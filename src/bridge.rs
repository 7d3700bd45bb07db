use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::info;

/// Couples two bidirectional byte streams, copying both directions
/// concurrently. When either direction ends (EOF or error), both endpoints
/// are shut down and the call returns. Copy errors are logged and swallowed;
/// closure is the signal the peers observe.
pub async fn couple<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    // A single task owns closure, so both endpoints close exactly once even
    // if both directions end at the same time.
    let result = tokio::select! {
        r = tokio::io::copy(&mut a_read, &mut b_write) => r,
        r = tokio::io::copy(&mut b_read, &mut a_write) => r,
    };
    if let Err(e) = result {
        info!("stream copy ended: {}", e);
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}
