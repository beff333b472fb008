//! HTTP server exposing the question-answering pipeline
//! Minimal HTTP/1.1 handling on top of tokio

use echoql::config::PipelineConfig;
use echoql::error::{ErrorKind, PipelineError};
use echoql::pipeline::Pipeline;

use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_REQUEST_BYTES: usize = 1_000_000;

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    /// Include the result as CSV text
    #[serde(default)]
    export: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env()?;
    let pipeline = Arc::new(Pipeline::from_config(&config).await?);

    let addr = std::env::var("ECHOQL_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("New connection from: {}", peer);
        tokio::spawn(handle_connection(stream, Arc::clone(&pipeline)));
    }
}

async fn handle_connection(mut stream: TcpStream, pipeline: Arc<Pipeline>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    let read_result = timeout(Duration::from_secs(5), async {
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
            if request_complete(&buffer) || buffer.len() > MAX_REQUEST_BYTES {
                break;
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await;

    match read_result {
        Err(_) => {
            warn!("Request read timeout");
            return;
        }
        Ok(Err(e)) => {
            error!("Failed to read from stream: {}", e);
            return;
        }
        Ok(Ok(())) => {}
    }
    if buffer.is_empty() {
        return;
    }

    let response = match String::from_utf8(buffer) {
        Ok(request) => handle_request(&request, &pipeline).await,
        Err(_) => create_response(400, "Bad Request", &error_body("invalid_input", "request is not UTF-8")),
    };
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

fn request_complete(buffer: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(buffer) else {
        return false;
    };
    let Some(headers_end) = text.find("\r\n\r\n") else {
        return false;
    };
    match extract_content_length(text) {
        Some(length) => buffer.len() >= headers_end + 4 + length,
        None => true,
    }
}

fn extract_content_length(request: &str) -> Option<usize> {
    request
        .lines()
        .take_while(|l| !l.is_empty())
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse().ok())
}

async fn handle_request(request: &str, pipeline: &Pipeline) -> String {
    let mut parts = request.lines().next().unwrap_or("").split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return create_response(400, "Bad Request", &error_body("invalid_input", "malformed request line"));
    };
    let path = target.split('?').next().unwrap_or("/").trim_end_matches('/');
    let body = request.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");

    match (method, path) {
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("GET", "/health") => {
            let body = serde_json::json!({
                "status": "ok",
                "service": "echoql",
                "tables": pipeline.catalog().len(),
            });
            create_response(200, "OK", &body.to_string())
        }
        ("POST", "/query") => handle_query(body, pipeline).await,
        _ => create_response(404, "Not Found", &error_body("not_found", &format!("no route for {} {}", method, path))),
    }
}

async fn handle_query(body: &str, pipeline: &Pipeline) -> String {
    let req: QueryRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            return create_response(400, "Bad Request", &error_body("invalid_input", &format!("bad JSON body: {}", e)));
        }
    };

    match pipeline.run(&req.query).await {
        Ok(output) => {
            let csv = if req.export {
                match output.result.to_csv() {
                    Ok(csv) => Some(csv),
                    Err(e) => return error_response(&e),
                }
            } else {
                None
            };
            let body = serde_json::json!({
                "status": "ok",
                "data": {
                    "run_id": output.run_id,
                    "sql": &output.sql,
                    "tables": &output.tables,
                    "repair_attempts": output.repair_attempts,
                    "columns": &output.result.columns,
                    "rows": output.result.to_records(),
                    "truncated": output.result.truncated,
                    "csv": csv,
                }
            });
            create_response(200, "OK", &body.to_string())
        }
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &PipelineError) -> String {
    let (status, text) = match e.kind() {
        ErrorKind::InvalidInput => (400, "Bad Request"),
        ErrorKind::Unanswerable | ErrorKind::Exhausted => (422, "Unprocessable Entity"),
        ErrorKind::Timeout => (504, "Gateway Timeout"),
        ErrorKind::EmbeddingFailed | ErrorKind::IndexUnavailable | ErrorKind::Llm => (502, "Bad Gateway"),
        _ => (500, "Internal Server Error"),
    };
    let body = serde_json::json!({
        "status": "error",
        "error": e.to_report(),
    });
    create_response(status, text, &body.to_string())
}

fn error_body(kind: &str, message: &str) -> String {
    serde_json::json!({
        "status": "error",
        "error": { "kind": kind, "message": message },
    })
    .to_string()
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
