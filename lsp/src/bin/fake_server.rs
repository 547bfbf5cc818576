//! Scripted language server used by the integration tests.
//!
//! Speaks framed JSON-RPC on stdio. Besides the lifecycle methods it answers
//! a handful of `test/*` methods that misbehave in specific ways.
//!
//! Flags:
//! - `--exit-immediately`: exit before reading anything.
//! - `--ignore-sigterm`: ignore SIGTERM so only a kill stops the process.
//! - `--hang-on-shutdown`: never answer `shutdown`, ignore `exit`.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use strand_lsp::{
    Frame, FrameReader, FrameWriter, Message, RemoteError, Request, RequestId, ResponsePayload,
};
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::mpsc;

enum Outgoing {
    Message(Message),
    /// Bytes written as-is, bypassing framing.
    Raw(Vec<u8>),
}

#[derive(Default)]
struct Flags {
    ignore_sigterm: bool,
    hang_on_shutdown: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let mut flags = Flags::default();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--exit-immediately" => return Ok(()),
            "--ignore-sigterm" => flags.ignore_sigterm = true,
            "--hang-on-shutdown" => flags.hang_on_shutdown = true,
            other => anyhow::bail!("unknown flag: {other}"),
        }
    }

    if flags.ignore_sigterm {
        ignore_sigterm();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(FrameWriter::new(tokio::io::stdout()), rx));

    let mut reader = FrameReader::new(tokio::io::stdin());
    let mut held: Vec<RequestId> = Vec::new();

    while let Some(frame) = reader.read_frame().await.context("reading stdin")? {
        let message = Message::from_frame(&frame).context("parsing client message")?;
        match message {
            Message::Request(request) => {
                if request.method == "shutdown" && flags.hang_on_shutdown {
                    continue;
                }
                handle_request(request, &tx, &mut held);
            }
            Message::Notification(notification) => match notification.method.as_str() {
                "initialized" => {
                    let _ = tx.send(Outgoing::Message(Message::notification(
                        "window/logMessage",
                        Some(json!({ "type": 3, "message": "fake server ready" })),
                    )));
                }
                "exit" if !flags.hang_on_shutdown => break,
                _ => {}
            },
            Message::Response(response) => {
                if response.id == Some(RequestId::from("srv-1")) {
                    let _ = tx.send(Outgoing::Message(Message::notification(
                        "test/gotResponse",
                        response.payload.into_result().ok(),
                    )));
                }
            }
        }
    }

    if flags.hang_on_shutdown {
        // Stdin is gone; stay alive until killed.
        std::future::pending::<()>().await;
    }

    drop(tx);
    writer.await.context("writer task")??;
    Ok(())
}

#[cfg(unix)]
fn ignore_sigterm() {
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigterm() {}

fn handle_request(
    request: Request,
    tx: &mpsc::UnboundedSender<Outgoing>,
    held: &mut Vec<RequestId>,
) {
    let Request { id, method, params } = request;
    let params = params.unwrap_or(Value::Null);
    let reply = |id: RequestId, payload: ResponsePayload| {
        let _ = tx.send(Outgoing::Message(Message::response(id, payload)));
    };

    match method.as_str() {
        "initialize" => {
            if params["initializationOptions"]["fail"].as_bool() == Some(true) {
                reply(
                    id,
                    ResponsePayload::Error(RemoteError::new(-32002, "initialization refused")),
                );
            } else {
                reply(
                    id,
                    ResponsePayload::Result(json!({
                        "capabilities": { "documentSymbolProvider": true },
                        "serverInfo": { "name": "strand-fake-server" }
                    })),
                );
            }
        }
        "shutdown" => reply(id, ResponsePayload::Result(Value::Null)),
        "textDocument/documentSymbol" => {
            eprintln!("documentSymbol for {}", params["textDocument"]["uri"]);
            reply(id, ResponsePayload::Result(json!([])));
        }
        "test/echo" => reply(id, ResponsePayload::Result(params)),
        "test/error" => reply(
            id,
            ResponsePayload::Error(RemoteError::new(-32001, "scripted failure")),
        ),
        "test/hold" => held.push(id),
        "test/release" => {
            reply(id, ResponsePayload::Result(json!("released")));
            for id in held.drain(..).rev() {
                let value = json!(format!("held {id}"));
                reply(id, ResponsePayload::Result(value));
            }
        }
        "test/silent" => {}
        "test/late" => {
            let delay = Duration::from_millis(params["delay_ms"].as_u64().unwrap_or(200));
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Outgoing::Message(Message::response(
                    id,
                    ResponsePayload::Result(json!("late")),
                )));
            });
        }
        "test/unmatched" => {
            reply(
                RequestId::Number(999_999),
                ResponsePayload::Result(json!("bogus")),
            );
            reply(id, ResponsePayload::Result(json!("real")));
        }
        "test/garbage" => {
            let _ = tx.send(Outgoing::Raw(b"Content-Length: abc\r\n\r\n".to_vec()));
            reply(id, ResponsePayload::Result(json!("after garbage")));
        }
        "test/serverRequest" => {
            let _ = tx.send(Outgoing::Message(Message::request(
                "srv-1",
                "workspace/configuration",
                Some(json!({ "items": [{ "section": "fake" }] })),
            )));
            reply(id, ResponsePayload::Result(Value::Null));
        }
        _ => reply(
            id,
            ResponsePayload::Error(RemoteError::new(
                RemoteError::METHOD_NOT_FOUND,
                format!("unknown method: {method}"),
            )),
        ),
    }
}

async fn write_loop(
    mut writer: FrameWriter<Stdout>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) -> Result<()> {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Message(message) => {
                let frame: Frame = message.to_frame()?;
                writer.write_frame(&frame).await?;
            }
            Outgoing::Raw(bytes) => {
                let stdout = writer.get_mut();
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
        }
    }
    Ok(())
}
