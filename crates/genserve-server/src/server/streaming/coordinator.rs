use crate::server::telemetry::increment_fragments_emitted;
use bytes::Bytes;
use genserve::{
    Error, Result,
    bridge::{StreamItem, StreamReceiver},
};
use tokio::sync::mpsc;

/// Forwards a worker's text fragments to an HTTP response body as cumulative
/// text.
///
/// Each fragment read from `receiver` is appended to the text generated so
/// far, and the whole text is sent to `resp_tx` as one body chunk. The first
/// chunk therefore holds the first fragment and the last chunk holds the
/// complete generation.
///
/// # Arguments
///
/// - `receiver`: Consumer half of the request's stream channel.
/// - `resp_tx`: Channel feeding the response body.
///
/// # Behavior
///
/// - Returns the number of chunks sent once the end marker arrives.
/// - On a timeout or a failed generation the error is forwarded to the body
///   (which aborts the response) and returned.
/// - Returns [`Error::RequestCancelled`] as soon as the client goes away, even
///   while waiting on the worker. Dropping `receiver` then makes the worker's
///   next write fail, so it stops generating.
pub async fn feed_fragments(
    mut receiver: StreamReceiver,
    resp_tx: mpsc::Sender<Result<Bytes>>,
) -> Result<usize> {
    let mut text = String::new();
    let mut chunks = 0;

    loop {
        let item = tokio::select! {
            item = receiver.get() => item,
            () = resp_tx.closed() => return Err(Error::RequestCancelled),
        };

        match item {
            Ok(StreamItem::Fragment(fragment)) => {
                text.push_str(&fragment);
                increment_fragments_emitted();
                if resp_tx.send(Ok(Bytes::from(text.clone()))).await.is_err() {
                    return Err(Error::RequestCancelled);
                }
                chunks += 1;
            }
            Ok(StreamItem::End) => return Ok(chunks),
            Err(e) => {
                // Best effort: the client may have disconnected as well.
                if let Err(send_err) = resp_tx.send(Err(e.clone())).await {
                    tracing::debug!("Failed to forward stream error: {send_err}");
                }
                return Err(e);
            }
        }
    }
}
