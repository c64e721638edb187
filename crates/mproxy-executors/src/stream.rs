use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;

use mproxy_core::ExecError;

/// Upstreams occasionally emit one enormous SSE line (base64 payloads,
/// giant tool results); anything beyond this is treated as a broken stream.
pub(crate) const MAX_STREAM_LINE_BYTES: usize = 50 * 1024 * 1024;

/// Terminal marker passed through the per-line translator once the
/// upstream body ends.
pub(crate) const STREAM_DONE_MARKER: &[u8] = b"[DONE]";

#[derive(Debug, thiserror::Error)]
#[error("stream line exceeds {MAX_STREAM_LINE_BYTES} bytes")]
pub(crate) struct LineTooLong;

/// Incremental newline splitter over arbitrary byte chunks. Carriage
/// returns are stripped; empty lines are dropped (SSE event separators).
#[derive(Debug, Default)]
pub(crate) struct LineScanner {
    buf: Vec<u8>,
}

impl LineScanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, LineTooLong> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(line);
            }
        }
        if self.buf.len() > MAX_STREAM_LINE_BYTES {
            return Err(LineTooLong);
        }
        Ok(lines)
    }

    pub(crate) fn finish(&mut self) -> Option<Vec<u8>> {
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() { None } else { Some(line) }
    }
}

/// Producer loop shared by the streaming executors: reads the upstream
/// body chunk by chunk, splits it into lines, hands each line (and the
/// final `[DONE]` marker) to `translate_line`, and forwards the results.
///
/// Errors are terminal: one `Err` item is emitted and the channel closes.
/// Dropping the receiver stops the loop at the next send, which releases
/// the upstream body on every exit path.
pub(crate) async fn forward_lines<S, F>(
    provider: &'static str,
    mut upstream: S,
    tx: mpsc::Sender<Result<Bytes, ExecError>>,
    mut translate_line: F,
) where
    S: Stream<Item = Result<Bytes, wreq::Error>> + Unpin,
    F: FnMut(&[u8]) -> Vec<Bytes>,
{
    let mut scanner = LineScanner::new();
    while let Some(item) = upstream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(event = "upstream_stream_error", provider, error = %err);
                let _ = tx.send(Err(ExecError::Transport(err.to_string()))).await;
                return;
            }
        };
        let lines = match scanner.push(&chunk) {
            Ok(lines) => lines,
            Err(err) => {
                warn!(event = "upstream_stream_error", provider, error = %err);
                let _ = tx.send(Err(ExecError::Transport(err.to_string()))).await;
                return;
            }
        };
        for line in lines {
            for out in translate_line(&line) {
                if tx.send(Ok(out)).await.is_err() {
                    return;
                }
            }
        }
    }

    if let Some(rest) = scanner.finish() {
        for out in translate_line(&rest) {
            if tx.send(Ok(out)).await.is_err() {
                return;
            }
        }
    }
    for out in translate_line(STREAM_DONE_MARKER) {
        if tx.send(Ok(out)).await.is_err() {
            return;
        }
    }
}
