//! HTTP API server
//! Plain tokio TCP server with JSON endpoints for connecting, querying and history

use humanql::cache::{CacheConfig, QueryCache};
use humanql::db::{connect_and_describe, create_adapter, Dialect, Row};
use humanql::execution_loop::ErrorKind;
use humanql::export::to_csv_string;
use humanql::history::HistoryStore;
use humanql::llm::{LlmClient, LlmConfig};
use humanql::schema::Schema;
use humanql::{PipelineConfig, QueryOrchestrator, QueryRequest};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "humanql-server")]
#[command(about = "JSON API for natural-language database queries")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    #[arg(long, default_value = ".humanql/history.db")]
    history_db: PathBuf,

    /// Persist the result cache to this JSON file
    #[arg(long)]
    cache_file: Option<PathBuf>,
}

struct AppState {
    orchestrator: QueryOrchestrator,
    history: Arc<HistoryStore>,
    llm_config: LlmConfig,
}

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

struct HttpResponse {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl HttpResponse {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({"success": false, "error": message.into()}))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let llm_config = LlmConfig::from_env()?;
    let history = Arc::new(HistoryStore::open(&args.history_db)?);
    let cache = Arc::new(QueryCache::new(CacheConfig {
        path: args.cache_file.clone(),
        ..CacheConfig::default()
    }));
    let orchestrator = QueryOrchestrator::with_llm(PipelineConfig::from_env()?, Arc::new(LlmClient::new(llm_config.clone())))
        .with_cache(cache)
        .with_history(history.clone());

    let state = Arc::new(AppState {
        orchestrator,
        history,
        llm_config,
    });

    let listener = TcpListener::bind(&args.bind).await?;
    info!("Server listening on {}", args.bind);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New connection from {}", addr);
        tokio::spawn(handle_connection(stream, state.clone()));
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    let response = match read_request(&mut stream).await {
        Ok(Some(request)) => route(request, &mut stream, &state).await,
        Ok(None) => return,
        Err(message) => HttpResponse::error(400, message),
    };

    if let Err(e) = stream.write_all(encode_response(&response).as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
}

/// Read one request: headers up to the blank line, then `Content-Length` bytes.
async fn read_request(stream: &mut TcpStream) -> std::result::Result<Option<HttpRequest>, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_subslice(&buffer, b"\r\n\r\n") {
            break pos;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err("Request headers too large".to_string());
        }
        let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return if buffer.is_empty() { Ok(None) } else { Err("Incomplete request".to_string()) };
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err("Malformed request line".to_string());
    };

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse().map_err(|_| "Invalid Content-Length".to_string()))
        .transpose()?
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err("Request body too large".to_string());
    }

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("Incomplete request body".to_string());
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    // Drop query parameters and trailing slash
    let path = target.split('?').next().unwrap_or(target).trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };

    Ok(Some(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        body,
    }))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn route(request: HttpRequest, stream: &mut TcpStream, state: &AppState) -> HttpResponse {
    info!("{} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => HttpResponse {
            status: 204,
            content_type: "text/plain",
            body: String::new(),
        },
        ("GET", "/api/health") => HttpResponse::json(200, json!({"status": "ok", "service": "humanql"})),
        ("GET", "/api/config") => HttpResponse::json(
            200,
            json!({
                "isLocalLLM": state.llm_config.is_local(),
                "llmProvider": if state.llm_config.is_local() { "local" } else { "openai" },
                "model": state.llm_config.model,
            }),
        ),
        ("GET", "/api/demo") => HttpResponse::json(
            200,
            json!({
                "success": true,
                "schema": Schema::demo(),
                "isReadOnly": true,
                "dbType": Dialect::Postgres,
                "isDemo": true,
            }),
        ),
        ("GET", "/api/history") => match state.history.history() {
            Ok(items) => HttpResponse::json(200, json!({"success": true, "history": items})),
            Err(e) => HttpResponse::error(500, e.to_string()),
        },
        ("POST", "/api/connect") => handle_connect(&request.body).await,
        ("POST", "/api/query") => handle_query(&request.body, stream, state).await,
        ("POST", "/api/export") => handle_export(&request.body),
        _ => HttpResponse::error(404, "Not found"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectBody {
    connection_string: String,
    db_type: Option<Dialect>,
}

async fn handle_connect(body: &[u8]) -> HttpResponse {
    let Ok(body) = serde_json::from_slice::<ConnectBody>(body) else {
        return HttpResponse::error(400, "Connection string is required");
    };
    let Some(dialect) = body.db_type.or_else(|| Dialect::detect(&body.connection_string)) else {
        return HttpResponse::error(400, "Could not detect database type. Use postgresql:// or mysql:// prefix.");
    };

    let mut adapter = create_adapter(dialect, &body.connection_string);
    match connect_and_describe(adapter.as_mut()).await {
        Ok(info) => HttpResponse::json(
            200,
            json!({
                "success": true,
                "schema": info.schema,
                "isReadOnly": info.is_read_only,
                "dbType": info.db_type,
            }),
        ),
        Err(e) => {
            warn!("Connection failed: {}", e);
            HttpResponse::error(500, e.to_string())
        }
    }
}

async fn handle_query(body: &[u8], stream: &mut TcpStream, state: &AppState) -> HttpResponse {
    let request: QueryRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return HttpResponse::error(400, format!("Missing required fields: {}", e)),
    };
    if request.question.trim().is_empty() {
        return HttpResponse::error(400, "Missing required fields: question");
    }

    let mut adapter = create_adapter(request.dialect, &request.connection_identity);
    let cancel = CancellationToken::new();

    let response = {
        let run = state.orchestrator.run(&request, adapter.as_mut(), &cancel);
        tokio::pin!(run);
        tokio::select! {
            response = &mut run => response,
            _ = client_gone(stream) => {
                info!("Client disconnected, cancelling query");
                cancel.cancel();
                run.await
            }
        }
    };

    let status = match response.error_kind {
        None => 200,
        Some(ErrorKind::PolicyViolation) => 400,
        Some(ErrorKind::Cancelled) => 499,
        Some(_) => 500,
    };
    match serde_json::to_value(&response) {
        Ok(value) => HttpResponse::json(status, value),
        Err(e) => HttpResponse::error(500, e.to_string()),
    }
}

/// Resolves once the peer closes its side of the connection.
async fn client_gone(stream: &mut TcpStream) {
    let mut scratch = [0u8; 256];
    loop {
        match stream.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

#[derive(Deserialize)]
struct ExportBody {
    data: Vec<Row>,
    columns: Vec<String>,
}

fn handle_export(body: &[u8]) -> HttpResponse {
    let Ok(body) = serde_json::from_slice::<ExportBody>(body) else {
        return HttpResponse::error(400, "Invalid data format");
    };
    match to_csv_string(&body.data, &body.columns) {
        Ok(csv) => HttpResponse {
            status: 200,
            content_type: "text/csv",
            body: csv,
        },
        Err(e) => HttpResponse::error(500, e.to_string()),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        499 => "Client Closed Request",
        _ => "Internal Server Error",
    }
}

fn encode_response(response: &HttpResponse) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        response.status,
        status_text(response.status),
        response.content_type,
        response.body.len(),
        response.body
    )
}
