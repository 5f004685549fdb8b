//! Locally generated responses: the standard JSON error body plus small
//! write helpers over the downstream session.

use bytes::Bytes;
use pingora::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

pub async fn respond_json(
    session: &mut Session,
    code: u16,
    body: serde_json::Value,
) -> Result<()> {
    let body = body.to_string();
    let mut header = ResponseHeader::build(code, Some(2))?;
    header.insert_header("Content-Type", "application/json; charset=utf-8")?;
    header.insert_header("Content-Length", body.len().to_string())?;
    write(session, header, Bytes::from(body)).await
}

pub async fn respond_html(session: &mut Session, code: u16, body: String) -> Result<()> {
    let mut header = ResponseHeader::build(code, Some(2))?;
    header.insert_header("Content-Type", "text/html; charset=utf-8")?;
    header.insert_header("Content-Length", body.len().to_string())?;
    write(session, header, Bytes::from(body)).await
}

/// The error body every locally rejected request carries:
/// `{"error":{"code":…,"details":…,"message":…},"request":…}`.
pub fn error_body(code: u16, message: &str, request_url: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "code": code,
            "details": message,
            "message": message,
        },
        "request": request_url,
    })
}

pub async fn respond_error_json(
    session: &mut Session,
    code: u16,
    message: &str,
    request_url: &str,
    retry_after: Option<u64>,
) -> Result<()> {
    let body = error_body(code, message, request_url).to_string();
    let mut header = ResponseHeader::build(code, Some(3))?;
    header.insert_header("Content-Type", "application/json; charset=utf-8")?;
    header.insert_header("Content-Length", body.len().to_string())?;
    if let Some(seconds) = retry_after {
        header.insert_header("Retry-After", seconds.to_string())?;
    }
    write(session, header, Bytes::from(body)).await
}

async fn write(session: &mut Session, header: ResponseHeader, body: Bytes) -> Result<()> {
    session
        .downstream_session
        .write_response_header(Box::new(header))
        .await?;
    session
        .downstream_session
        .write_response_body(body, true)
        .await?;
    Ok(())
}
