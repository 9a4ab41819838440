//! Byte relay between a channel and a TCP connection.
//!
//! Used by the server for both `direct-tcpip` channels (client asks the
//! server to connect somewhere) and `forwarded-tcpip` channels (a connection
//! accepted on a remote listener, handed to the client).
//!
//! Both directions run until each side has seen EOF, so a peer that
//! half-closes (sends its request, then shuts down writing) still receives
//! the full response.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Relay bytes between `a` and `b` until both directions finish, either
/// side fails, or `shutdown` fires.
///
/// Returns `(a_to_b, b_to_a)` byte counts when the relay ran to completion.
pub(crate) async fn relay<A, B>(
    mut a: A,
    mut b: B,
    label: &str,
    shutdown: &CancellationToken,
) -> Option<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut a, &mut b) => match result {
            Ok((sent, received)) => {
                debug!("Relay {} finished ({} bytes out, {} bytes in)", label, sent, received);
                Some((sent, received))
            }
            Err(e) => {
                debug!("Relay {} ended: {}", label, e);
                None
            }
        },
        _ = shutdown.cancelled() => {
            debug!("Relay {} stopped by shutdown", label);
            None
        }
    }
}
