//! A hand-parsed subset of HTTP/1.1: one request per connection, line-oriented
//! headers, bodies framed by an exact `Content-Length`. The only headers that
//! matter on the wire are `Content-Length` and `Lamport-Clock` (matched
//! case-insensitively); everything else is read and ignored.

use crate::{AtmoError, Result};
use std::io::{BufRead, Read, Write};

/// the one resource path served by the aggregation server and targeted by
/// both the publisher and the query client
pub const WEATHER_ENDPOINT: &str = "/weatherInfo.json";

/// Extracts the `host:port` authority from a server URL as accepted by the
/// publisher and query client: either `http://host:port` or a bare
/// `host:port`.
///
/// # Errors
/// returns [`AtmoError::Parsing`] if no `host:port` can be extracted
pub fn server_authority(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let authority = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    if authority.is_empty() || !authority.contains(':') {
        return Err(AtmoError::Parsing(format!(
            "expected a server URL like http://host:port, got {:?}",
            url
        )));
    }
    Ok(authority.to_string())
}

/// an incoming request as parsed by the server from a connection
#[derive(Debug)]
pub struct Request {
    /// request method token, e.g. `GET` or `PUT`
    pub method: String,
    /// request target, e.g. `/weatherInfo.json?id=IDS60901`
    pub target: String,
    /// value of the `Lamport-Clock` header, when present
    pub lamport: Option<u64>,
    /// request body, exactly `Content-Length` bytes
    pub body: String,
}

/// response status codes the server can produce
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Status {
    /// 200
    Ok,
    /// 201
    Created,
    /// 204
    NoContent,
    /// 400
    BadRequest,
    /// 404
    NotFound,
    /// 500
    InternalServerError,
}

impl Status {
    /// numeric status code
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::InternalServerError => 500,
        }
    }

    /// canonical reason phrase
    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::NoContent => "No Content",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

/// an outgoing response assembled by the server
#[derive(Debug)]
pub struct Response {
    /// status line code
    pub status: Status,
    /// the server clock value stamped on this response
    pub lamport: u64,
    /// response body; `Content-Length` is always exact
    pub body: String,
}

impl Response {
    /// writes the full response, CRLF line endings, and flushes the writer
    ///
    /// # Errors
    /// returns [`AtmoError::Io`] if the peer went away mid-write
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        write!(
            writer,
            "HTTP/1.1 {} {}\r\n",
            self.status.code(),
            self.status.reason()
        )?;
        write!(writer, "Content-Type: application/json\r\n")?;
        write!(writer, "Lamport-Clock: {}\r\n", self.lamport)?;
        write!(writer, "Content-Length: {}\r\n\r\n", self.body.len())?;
        writer.write_all(self.body.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// a response as read back on the publisher/client side
#[derive(Debug)]
pub struct Reply {
    /// numeric status code from the status line
    pub status: u16,
    /// value of the `Lamport-Clock` header, when the server sent one
    pub lamport: Option<u64>,
    /// response body, exactly `Content-Length` bytes
    pub body: String,
}

/// reads one request: request line, headers to the blank line, then exactly
/// `Content-Length` body bytes (0 when the header is absent).
///
/// # Errors
/// returns [`AtmoError::Protocol`] for a malformed request line or header
/// value (the server answers these with 400), [`AtmoError::Io`] when the
/// connection dies first
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Request> {
    let line = read_line(reader)?;
    let mut parts = line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if version.starts_with("HTTP/") => {
            (method, target)
        }
        _ => {
            return Err(AtmoError::Protocol(format!(
                "malformed request line: {:?}",
                line
            )))
        }
    };

    let headers = read_headers(reader)?;
    let body = read_body(reader, headers.content_length.unwrap_or(0))?;

    Ok(Request {
        method: method.to_string(),
        target: target.to_string(),
        lamport: headers.lamport,
        body,
    })
}

/// writes one client request with the fixed publisher/client header set and
/// an exact `Content-Length`, then flushes the writer
pub fn write_request<W: Write>(
    writer: &mut W,
    method: &str,
    target: &str,
    lamport: u64,
    body: &str,
) -> Result<()> {
    write!(writer, "{} {} HTTP/1.1\r\n", method, target)?;
    write!(writer, "Content-Type: application/json\r\n")?;
    write!(writer, "User-Agent: ATOMClient/1/0\r\n")?;
    write!(writer, "Lamport-Clock: {}\r\n", lamport)?;
    write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
    writer.write_all(body.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// reads one response: status line, headers, then the body
///
/// # Errors
/// returns [`AtmoError::Protocol`] for a malformed status line or header value
pub fn read_reply<R: BufRead>(reader: &mut R) -> Result<Reply> {
    let line = read_line(reader)?;
    let mut parts = line.split_whitespace();
    let status = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .map_err(|_| AtmoError::Protocol(format!("malformed status line: {:?}", line)))?,
        _ => {
            return Err(AtmoError::Protocol(format!(
                "malformed status line: {:?}",
                line
            )))
        }
    };

    let headers = read_headers(reader)?;
    let body = read_body(reader, headers.content_length.unwrap_or(0))?;

    Ok(Reply {
        status,
        lamport: headers.lamport,
        body,
    })
}

// the two header values the protocol cares about
struct RawHeaders {
    content_length: Option<usize>,
    lamport: Option<u64>,
}

// reads header lines until the blank separator; names match case-insensitively
// and lines that are not `name: value` shaped are skipped
fn read_headers<R: BufRead>(reader: &mut R) -> Result<RawHeaders> {
    let mut headers = RawHeaders {
        content_length: None,
        lamport: None,
    };
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some(idx) = line.find(':') {
            let name = line[..idx].trim().to_ascii_lowercase();
            let value = line[idx + 1..].trim();
            match name.as_str() {
                "content-length" => {
                    headers.content_length = Some(value.parse().map_err(|_| {
                        AtmoError::Protocol(format!("invalid Content-Length: {:?}", value))
                    })?);
                }
                "lamport-clock" => {
                    headers.lamport = Some(value.parse().map_err(|_| {
                        AtmoError::Protocol(format!("invalid Lamport-Clock: {:?}", value))
                    })?);
                }
                _ => {}
            }
        }
    }
}

fn read_body<R: BufRead>(reader: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(AtmoError::Protocol(
            "connection closed mid-request".to_string(),
        ));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}
