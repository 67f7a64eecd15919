//! Background receive loop.

use std::time::Duration;

use tokio::io::AsyncRead;

use crate::channel::{ChannelSender, FrameReader, Received};
use crate::router::Router;

/// Read frames and hand each to the router until the channel leaves
/// `Connected` or the stream ends.
///
/// Messages are dispatched in wire order, one at a time. Frames that do not
/// parse are skipped; a stream that ends or fails flips the channel to
/// `Closing`.
pub(crate) async fn run<R>(
    mut reader: FrameReader<R>,
    router: Router,
    link: ChannelSender,
    poll: Duration,
) where
    R: AsyncRead + Unpin,
{
    tracing::debug!("Receive loop started");

    while link.is_connected() {
        match reader.receive(poll).await {
            Received::Message(message) => router.dispatch(message).await,
            Received::Idle => {}
            Received::Closed => {
                link.mark_closing();
                break;
            }
        }
    }

    tracing::debug!(state = ?link.state(), "Receive loop stopped");
}
