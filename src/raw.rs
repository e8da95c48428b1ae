//! raw 输出模式：解析脚本自带的状态行/响应头，并把输出流式写入响应体。

use axum::body::{Body as AxumBody, Bytes};
use axum::http::header::{CONTENT_TYPE, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// 脚本输出开头的响应头解析结果。
#[derive(Debug, PartialEq)]
pub enum RawHead {
    /// 识别出完整的头部块，头部字节已被消费。
    Head {
        status: StatusCode,
        headers: HeaderMap,
    },
    /// 没有头部块；已读取的字节需原样放回响应体。
    Body(Vec<u8>),
}

/// 读取可选的头部块：`HTTP/1.x NNN` 或 `Status: NNN` 行、若干 `Name: value` 行、空行结束。
pub async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<RawHead> {
    let mut consumed = Vec::new();
    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();
    let mut lines = 0usize;

    loop {
        let start = consumed.len();
        if reader.read_until(b'\n', &mut consumed).await? == 0 {
            return Ok(RawHead::Body(consumed));
        }
        let line = trim_line_end(&consumed[start..]);
        if line.is_empty() {
            if lines == 0 {
                return Ok(RawHead::Body(consumed));
            }
            return Ok(RawHead::Head { status, headers });
        }
        let Ok(line) = std::str::from_utf8(line) else {
            return Ok(RawHead::Body(consumed));
        };
        if lines == 0 && !is_status_line(line) {
            return Ok(RawHead::Body(consumed));
        }

        let parsed = if lines == 0 && line.starts_with("HTTP/") {
            parse_status(line.split_whitespace().nth(1)).map(|code| status = code)
        } else if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("status") {
                parse_status(value.split_whitespace().next()).map(|code| status = code)
            } else {
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.append(name, value);
                        Some(())
                    }
                    _ => None,
                }
            }
        } else {
            None
        };

        if parsed.is_none() || consumed.len() > MAX_HEAD_BYTES {
            return Ok(RawHead::Body(consumed));
        }
        lines += 1;
    }
}

/// 头部块必须以状态行开头，否则整段输出都属于响应体。
fn is_status_line(line: &str) -> bool {
    line.starts_with("HTTP/")
        || line
            .split_once(':')
            .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case("status"))
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_status(code: Option<&str>) -> Option<StatusCode> {
    code.and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
}

/// 在后台持续读取 stderr，避免子进程在头部解析完成前因管道写满而阻塞。
fn drain_stderr(
    stderr: ChildStderr,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut chunks = ReaderStream::new(stderr);
        while let Some(chunk) = chunks.next().await {
            if tx.send(chunk).is_err() {
                break;
            }
        }
    });
    stream::poll_fn(move |cx| rx.poll_recv(cx))
}

/// 把子进程的 stdout/stderr 拼接为流式响应。
pub async fn stream_response(stdout: ChildStdout, stderr: Option<ChildStderr>) -> Response {
    let stderr = stderr.map(drain_stderr);
    let mut reader = BufReader::new(stdout);
    let (status, mut headers, prefix) = match read_head(&mut reader).await {
        Ok(RawHead::Head { status, headers }) => (status, headers, Vec::new()),
        Ok(RawHead::Body(prefix)) => (StatusCode::OK, HeaderMap::new(), prefix),
        Err(_) => (StatusCode::OK, HeaderMap::new(), Vec::new()),
    };
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    }

    let stdout = stream::once(async move { Ok::<_, io::Error>(Bytes::from(prefix)) })
        .chain(ReaderStream::new(reader));
    let body = match stderr {
        Some(stderr) => AxumBody::from_stream(stream::select(stdout, stderr)),
        None => AxumBody::from_stream(stdout),
    };
    (status, headers, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn head_of(input: &str) -> RawHead {
        let mut reader = BufReader::new(input.as_bytes());
        read_head(&mut reader).await.expect("read head")
    }

    #[tokio::test]
    async fn parses_http_status_line_and_headers() {
        let RawHead::Head { status, headers } =
            head_of("HTTP/1.0 201 Created\r\nContent-Type: image/png\r\n\r\nPNG").await
        else {
            panic!("expected head");
        };
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers[CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn parses_cgi_status_header() {
        let RawHead::Head { status, .. } = head_of("Status: 404 Not Found\n\nmissing").await else {
            panic!("expected head");
        };
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plain_output_is_returned_as_body() {
        assert_eq!(
            head_of("hello world\nsecond line\n").await,
            RawHead::Body(b"hello world\n".to_vec())
        );
        assert_eq!(
            head_of("Key: value\nno blank line").await,
            RawHead::Body(b"Key: value\n".to_vec())
        );
    }

    #[tokio::test]
    async fn header_like_text_without_status_line_stays_in_body() {
        assert_eq!(
            head_of("Result: ok\n\nDetails follow\n").await,
            RawHead::Body(b"Result: ok\n".to_vec())
        );
        let RawHead::Head { headers, .. } =
            head_of("status: 200\nX-Job: 7\n\nbody").await
        else {
            panic!("expected head");
        };
        assert_eq!(headers["x-job"], "7");
    }
}
