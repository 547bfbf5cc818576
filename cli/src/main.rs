//! Strand CLI - run one language server through its lifecycle.
//!
//! ```text
//! strand <config.toml> [file]
//! ```
//!
//! Starts the server described by the config, performs the handshake and,
//! when a file is given, opens it and asks for its document symbols. The
//! server is always shut down before exiting. Logs go to stderr; set
//! `RUST_LOG=debug` to see protocol traffic and the server's stderr.

use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use strand_lsp::{
    DiagnosticEvent, RemoteError, Request, ResponsePayload, ServerConfig, Session,
};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::Url;

/// Files larger than this are not sent to the server.
const MAX_OPEN_BYTES: u64 = 1_048_576;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config {}", path.display()))
}

/// `working_dir` from the config, else the current directory.
fn workspace_root(config: &ServerConfig) -> Result<Url> {
    let dir = match config.working_dir() {
        Some(dir) => dir.to_path_buf(),
        None => env::current_dir().context("failed to determine current directory")?,
    };
    let dir = dir
        .canonicalize()
        .with_context(|| format!("workspace root {} does not exist", dir.display()))?;
    Url::from_directory_path(&dir)
        .map_err(|()| anyhow!("cannot express {} as a file URI", dir.display()))
}

fn language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("rs") => "rust",
        Some("py") => "python",
        Some("ts") => "typescript",
        Some("tsx") => "typescriptreact",
        Some("js") => "javascript",
        Some("go") => "go",
        Some("c" | "h") => "c",
        Some("cpp" | "cc" | "hpp") => "cpp",
        Some("al") => "al",
        Some("json") => "json",
        Some("toml") => "toml",
        _ => "plaintext",
    }
}

fn client_capabilities() -> Value {
    json!({
        "textDocument": {
            "synchronization": { "didSave": false },
            "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
            "publishDiagnostics": {}
        },
        "workspace": { "configuration": true, "workspaceFolders": true },
        "window": { "workDoneProgress": true }
    })
}

/// Minimal answers for requests servers commonly send during startup.
fn answer_server_request(request: &Request) -> ResponsePayload {
    match request.method.as_str() {
        "workspace/configuration" => {
            let items = request
                .params
                .as_ref()
                .and_then(|p| p["items"].as_array())
                .map_or(0, Vec::len);
            ResponsePayload::Result(Value::Array(vec![Value::Null; items]))
        }
        "window/workDoneProgress/create"
        | "client/registerCapability"
        | "client/unregisterCapability" => ResponsePayload::Result(Value::Null),
        other => ResponsePayload::Error(RemoteError::new(
            RemoteError::METHOD_NOT_FOUND,
            format!("unsupported: {other}"),
        )),
    }
}

async fn serve_requests(session: Arc<Session>, mut requests: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = requests.recv().await {
        tracing::debug!(id = %request.id, "Server request: {}", request.method);
        let payload = answer_server_request(&request);
        if let Err(e) = session.respond(request.id, payload).await {
            tracing::warn!("Failed to answer server request: {e}");
            break;
        }
    }
}

async fn log_diagnostics(mut events: mpsc::UnboundedReceiver<DiagnosticEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DiagnosticEvent::Stderr(line) => tracing::debug!(target: "strand::server", "{line}"),
            DiagnosticEvent::ProtocolDesync {
                consecutive_unmatched,
            } => tracing::error!(consecutive_unmatched, "Protocol desync"),
            DiagnosticEvent::StdoutClosed => tracing::info!("Server closed its output"),
            other => tracing::debug!(?other, "Session diagnostic"),
        }
    }
}

async fn inspect(session: &Session, path: &Path) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("cannot open {}", path.display()))?;
    let size = tokio::fs::metadata(&path).await?.len();
    if size > MAX_OPEN_BYTES {
        bail!("{} is too large to open ({size} bytes)", path.display());
    }
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("{} is not UTF-8 text", path.display()))?;
    let uri = Url::from_file_path(&path)
        .map_err(|()| anyhow!("cannot express {} as a file URI", path.display()))?;

    session
        .notify(
            "textDocument/didOpen",
            Some(json!({
                "textDocument": {
                    "uri": uri.as_str(),
                    "languageId": language_id(&path),
                    "version": 1,
                    "text": text
                }
            })),
        )
        .await?;

    let payload = session
        .call_default(
            "textDocument/documentSymbol",
            Some(json!({ "textDocument": { "uri": uri.as_str() } })),
        )
        .await?;
    match payload {
        ResponsePayload::Result(Value::Array(symbols)) => {
            tracing::info!(count = symbols.len(), "Document symbols");
            println!("{}: {} symbols", path.display(), symbols.len());
        }
        ResponsePayload::Result(Value::Null) => {
            println!("{}: no symbols", path.display());
        }
        ResponsePayload::Result(other) => {
            tracing::warn!("Unexpected documentSymbol result: {other}");
        }
        ResponsePayload::Error(err) => {
            tracing::warn!("documentSymbol failed: {err}");
            println!("{}: {err}", path.display());
        }
    }
    Ok(())
}

async fn drive(session: &Session, root: &Url, file: Option<&Path>) -> Result<()> {
    session
        .initialize(client_capabilities(), root)
        .await
        .context("LSP handshake failed")?;
    session.notify_initialized().await?;

    if let Some(file) = file {
        inspect(session, file).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut args = env::args_os().skip(1);
    let Some(config_path) = args.next().map(PathBuf::from) else {
        bail!("usage: strand <config.toml> [file]");
    };
    let file = args.next().map(PathBuf::from);

    let config = load_config(&config_path)?;
    let root = workspace_root(&config)?;
    tracing::info!(command = %config.command(), root = %root, "Starting language server");

    let session = Arc::new(Session::start(config).context("failed to start language server")?);
    let diagnostics = tokio::spawn(log_diagnostics(session.diagnostics().await));
    let requests = session.on_server_request().await;
    let responder = tokio::spawn(serve_requests(session.clone(), requests));

    let outcome = drive(&session, &root, file.as_deref()).await;

    match session.shutdown_and_exit().await {
        Ok(status) => tracing::info!(?status, "Language server stopped"),
        Err(e) => tracing::warn!("Teardown failed: {e}"),
    }
    responder.abort();
    diagnostics.abort();

    outcome
}
