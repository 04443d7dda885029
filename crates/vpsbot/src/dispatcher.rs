//! JSON-lines command channel
//!
//! Reads one [`CommandRequest`] per line, handles each on its own task and
//! writes one [`ResponseFrame`] per request as it completes. Responses can
//! therefore arrive out of order; match them by `id`.

use crate::SharedState;
use crate::commands::{handle_command, CommandRequest};
use crate::error::BotResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A request line: the command plus an optional caller-chosen id.
#[derive(Debug, Deserialize)]
struct RequestFrame {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    request: CommandRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub command: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    fn failure(id: String, command: String, error: String) -> Self {
        Self {
            id,
            command,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

async fn dispatch_line(state: &SharedState, line: &str) -> ResponseFrame {
    let frame: RequestFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "malformed request line");
            return ResponseFrame::failure(
                Uuid::new_v4().to_string(),
                String::new(),
                format!("invalid request: {e}"),
            );
        }
    };

    let id = frame.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let command = frame.request.command.clone();
    match handle_command(state, frame.request).await {
        Ok(result) => ResponseFrame {
            id,
            ok: result.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
            command,
            result: Some(result),
            error: None,
        },
        Err(e) => ResponseFrame::failure(id, command, e.to_string()),
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(output: &mut W, frame: &ResponseFrame) -> BotResult<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

/// Serve requests from `input` until it closes, then wait for every
/// in-flight request to answer.
pub async fn serve<R, W>(state: Arc<SharedState>, input: R, mut output: W) -> BotResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<ResponseFrame>(64);
    let mut tx = Some(tx);
    let mut lines = input.lines();
    let mut served = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line(), if tx.is_some() => match line? {
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let Some(sender) = tx.clone() else {
                        continue;
                    };
                    let state = state.clone();
                    served += 1;
                    tokio::spawn(async move {
                        let frame = dispatch_line(&state, &line).await;
                        if sender.send(frame).await.is_err() {
                            debug!("response channel closed before reply");
                        }
                    });
                }
                None => {
                    debug!("input closed, draining in-flight requests");
                    tx = None;
                }
            },
            Some(frame) = rx.recv() => write_frame(&mut output, &frame).await?,
            else => break,
        }
    }

    info!(served, "command channel closed");
    Ok(())
}
