//! Platform bus adapter over JSON lines.
//!
//! Each line is one internal message, `{"_": {header}, ...fields}`.

use mqtt_bridge_core::Message;
use std::io::{self, BufRead};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Feed messages parsed from `input` into `queue` until EOF.
///
/// Blocking: run it on a dedicated thread. Malformed lines are logged and
/// skipped. Returns early if the queue closes.
///
/// # Errors
///
/// Returns error if reading `input` fails.
pub fn read_messages<R: BufRead>(input: R, queue: &mpsc::Sender<Message>) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let message: Message = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, line, "Skipping malformed bus message");
                continue;
            }
        };

        if queue.blocking_send(message).is_err() {
            tracing::debug!("Writer queue closed, stopping bus input");
            break;
        }
    }

    Ok(())
}

/// Write every message from `messages` to `output`, one per line.
///
/// # Errors
///
/// Returns error if writing `output` fails.
pub async fn write_messages<W>(
    mut messages: mpsc::Receiver<Message>,
    mut output: W,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize bus message");
                continue;
            }
        };
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }

    Ok(())
}
