//! Bidirectional byte relaying between two streams

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tracing::debug;

/// Splice two streams into each other until either side closes.
///
/// Returns the byte counts (a-to-b, b-to-a). Backpressure comes from the
/// underlying streams; an error on either side ends the relay.
pub async fn relay_streams<A, B>(a: &mut A, b: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (a_to_b, b_to_a) = copy_bidirectional(a, b).await?;
    debug!("relay finished: {a_to_b} bytes forward, {b_to_a} bytes back");
    Ok((a_to_b, b_to_a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, mut relay_a) = tokio::io::duplex(4096);
        let (mut relay_b, mut target) = tokio::io::duplex(4096);

        let relay = tokio::spawn(async move { relay_streams(&mut relay_a, &mut relay_b).await });

        client.write_all(b"question").await.unwrap();
        let mut buf = [0u8; 8];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"question");

        target.write_all(b"answer").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"answer");

        drop(client);
        drop(target);
        let (forward, back) = relay.await.unwrap().unwrap();
        assert_eq!(forward, 8);
        assert_eq!(back, 6);
    }
}
