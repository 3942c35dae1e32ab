// src/proxy/http1.rs
//
// Minimal HTTP/1.1 wire handling for the backend side of the proxy. The
// pool hands out raw sockets, so requests are serialized by hand and
// responses are parsed header-first with httparse; everything read past the
// header is returned to the caller for the body phase.
use bytes::{Bytes, BytesMut};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a response header block.
const MAX_HEADER_BYTES: usize = 16 * 1024;

const MAX_PARSED_HEADERS: usize = 64;

/// Request to a backend, serialized verbatim in insertion order.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl BackendRequest {
    /// Serialize as an HTTP/1.1 request. Content-Length is always emitted
    /// from the actual body size.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Parsed response status line and headers.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn content_type(&self) -> &str {
        self.headers
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get(hyper::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Read a response header block, returning the parsed head plus any body
/// bytes that arrived with it.
pub async fn read_response_head<R>(stream: &mut R) -> io::Result<(ResponseHead, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(2048);

    loop {
        if let Some(end) = find_header_end(&buf) {
            let head = parse_head(&buf[..end])?;
            let leftover = Bytes::copy_from_slice(&buf[end..]);
            return Ok((head, leftover));
        }

        if buf.len() > MAX_HEADER_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response header too large",
            ));
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response header",
            ));
        }
    }
}

/// Read the remainder of a non-streaming body according to the framing the
/// head declares: chunked, Content-Length, or close-delimited.
pub async fn read_body<R>(stream: &mut R, head: &ResponseHead, leftover: Bytes) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if head.is_chunked() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        decoder.decode(&leftover, &mut out)?;

        let mut buf = [0u8; 8192];
        while !decoder.is_done() {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid chunked body",
                ));
            }
            decoder.decode(&buf[..n], &mut out)?;
        }
        return Ok(Bytes::from(out));
    }

    if let Some(length) = head.content_length() {
        let mut out = BytesMut::with_capacity(length);
        out.extend_from_slice(&leftover[..leftover.len().min(length)]);
        while out.len() < length {
            let n = stream.read_buf(&mut out).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid body",
                ));
            }
        }
        out.truncate(length);
        return Ok(out.freeze());
    }

    // No framing: the body runs to EOF.
    let mut out = BytesMut::from(&leftover[..]);
    loop {
        let n = stream.read_buf(&mut out).await?;
        if n == 0 {
            return Ok(out.freeze());
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(raw: &[u8]) -> io::Result<ResponseHead> {
    let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_PARSED_HEADERS];
    let mut response = httparse::Response::new(&mut parsed_headers);

    match response.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "incomplete response header",
            ));
        }
        Err(e) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed response header: {e}"),
            ));
        }
    }

    let code = response.code.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "response missing status code")
    })?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid status code"))?;

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header name"))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header value"))?;
        headers.append(name, value);
    }

    Ok(ResponseHead { status, headers })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    SizeExt,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerLineStart,
    TrailerLine,
    TrailerLineLf,
    TrailerEndLf,
}

/// Incremental `Transfer-Encoding: chunked` decoder.
///
/// Feed raw bytes in any split; decoded payload bytes are appended to the
/// caller's buffer. Chunk extensions and trailers are consumed and dropped.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    remaining: usize,
    done: bool,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            remaining: 0,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let mut i = 0;
        while i < input.len() && !self.done {
            let byte = input[i];
            match self.state {
                ChunkState::Size => match byte {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = (byte as char).to_digit(16).unwrap() as usize;
                        self.remaining = self
                            .remaining
                            .checked_mul(16)
                            .and_then(|r| r.checked_add(digit))
                            .ok_or_else(|| {
                                io::Error::new(io::ErrorKind::InvalidData, "chunk size overflow")
                            })?;
                        i += 1;
                    }
                    b';' => {
                        self.state = ChunkState::SizeExt;
                        i += 1;
                    }
                    b'\r' => {
                        self.state = ChunkState::SizeLf;
                        i += 1;
                    }
                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid chunk size",
                        ));
                    }
                },
                ChunkState::SizeExt => {
                    if byte == b'\r' {
                        self.state = ChunkState::SizeLf;
                    }
                    i += 1;
                }
                ChunkState::SizeLf => {
                    if byte != b'\n' {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid chunk size terminator",
                        ));
                    }
                    i += 1;
                    self.state = if self.remaining == 0 {
                        ChunkState::TrailerLineStart
                    } else {
                        ChunkState::Data
                    };
                }
                ChunkState::Data => {
                    let take = (input.len() - i).min(self.remaining);
                    out.extend_from_slice(&input[i..i + take]);
                    i += take;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if byte != b'\r' {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid chunk data terminator",
                        ));
                    }
                    i += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if byte != b'\n' {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid chunk data terminator",
                        ));
                    }
                    i += 1;
                    self.state = ChunkState::Size;
                }
                ChunkState::TrailerLineStart => {
                    if byte == b'\r' {
                        self.state = ChunkState::TrailerEndLf;
                    } else {
                        self.state = ChunkState::TrailerLine;
                    }
                    i += 1;
                }
                ChunkState::TrailerLine => {
                    if byte == b'\r' {
                        self.state = ChunkState::TrailerLineLf;
                    }
                    i += 1;
                }
                ChunkState::TrailerLineLf => {
                    if byte != b'\n' {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid trailer terminator",
                        ));
                    }
                    i += 1;
                    self.state = ChunkState::TrailerLineStart;
                }
                ChunkState::TrailerEndLf => {
                    if byte != b'\n' {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid trailer terminator",
                        ));
                    }
                    i += 1;
                    self.done = true;
                }
            }
        }
        Ok(())
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}
