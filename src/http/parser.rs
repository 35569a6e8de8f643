use bytes::Bytes;

use crate::http::event::HeaderItem;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),
    #[error("invalid status line: {0:?}")]
    InvalidStatusLine(String),
    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),
    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),
    #[error("conflicting Content-Length values")]
    ConflictingContentLength,
    #[error("unsupported request Transfer-Encoding: {0:?}")]
    UnsupportedTransferEncoding(String),
    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),
    #[error("missing CRLF after chunk data")]
    MissingChunkTerminator,
}

/// `METHOD SP TARGET SP VERSION`
///
/// The target is kept as the raw bytes from the wire; only the method and
/// version have to be ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: Bytes,
    pub version: String,
}

/// `VERSION SP CODE SP REASON`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: Bytes,
}

/// Which side of a transaction a body belongs to.
///
/// Responses carry the status code because `1xx`, `204` and `304`
/// responses never have a body whatever their headers say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOrigin {
    Request,
    Response(u16),
}

/// How the body following a header block is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

pub fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    let invalid = || ParseError::InvalidRequestLine(String::from_utf8_lossy(line).into_owned());

    let mut parts = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty());

    let method = parts.next().ok_or_else(invalid)?;
    let target = parts.next().ok_or_else(invalid)?;
    let version = parts.next().ok_or_else(invalid)?;

    if parts.next().is_some() || !is_token(method) || !is_version(version) {
        return Err(invalid());
    }

    Ok(RequestLine {
        method: ascii(method),
        target: Bytes::copy_from_slice(target),
        version: ascii(version),
    })
}

pub fn parse_status_line(line: &[u8]) -> Result<StatusLine, ParseError> {
    let invalid = || ParseError::InvalidStatusLine(String::from_utf8_lossy(line).into_owned());

    let mut parts = line.splitn(3, |b| *b == b' ');

    let version = parts.next().ok_or_else(invalid)?;
    let code = parts.next().ok_or_else(invalid)?;
    // Reason phrase is optional and may itself contain spaces
    let reason = parts.next().unwrap_or_default();

    if !is_version(version) || code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }

    let code = code
        .iter()
        .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));

    Ok(StatusLine {
        version: ascii(version),
        code,
        reason: Bytes::copy_from_slice(reason),
    })
}

pub fn parse_header_line(line: &[u8]) -> Result<HeaderItem, ParseError> {
    let invalid = || ParseError::InvalidHeader(String::from_utf8_lossy(line).into_owned());

    // Obsolete line folding
    if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
        return Err(invalid());
    }

    let colon = line.iter().position(|b| *b == b':').ok_or_else(invalid)?;
    let name = &line[..colon];

    if !is_token(name) {
        return Err(invalid());
    }

    let value = line[colon + 1..].trim_ascii();

    Ok(HeaderItem::new(ascii(name), Bytes::copy_from_slice(value)))
}

/// Parses a chunk-size line, ignoring any chunk extensions.
pub fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let invalid = || ParseError::InvalidChunkSize(String::from_utf8_lossy(line).into_owned());

    let size = line
        .split(|b| *b == b';')
        .next()
        .unwrap_or_default()
        .trim_ascii();

    if size.is_empty() || !size.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }

    usize::from_str_radix(&ascii(size), 16).map_err(|_| invalid())
}

/// Decides how the body after `headers` is delimited.
///
/// `method` is the method of the request the body belongs to, or of the
/// request being answered when `origin` is a response.
pub fn body_framing(
    method: &str,
    headers: &[HeaderItem],
    origin: BodyOrigin,
) -> Result<Framing, ParseError> {
    if let BodyOrigin::Response(code) = origin {
        if method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&code) || code == 204 || code == 304 {
            return Ok(Framing::Empty);
        }
    }

    let codings: Vec<String> = list_values(headers, "Transfer-Encoding")
        .map(|c| String::from_utf8_lossy(c).to_ascii_lowercase())
        .collect();

    // Transfer-Encoding overrides Content-Length
    if let Some(last) = codings.last() {
        return match (last.as_str(), origin) {
            ("chunked", _) => Ok(Framing::Chunked),
            (_, BodyOrigin::Request) => Err(ParseError::UnsupportedTransferEncoding(codings.join(", "))),
            (_, BodyOrigin::Response(_)) => Ok(Framing::UntilClose),
        };
    }

    let mut length = None;
    for value in header_values(headers, "Content-Length").flat_map(|v| v.split(|b| *b == b',')) {
        let value = value.trim_ascii();
        let invalid = || ParseError::InvalidContentLength(String::from_utf8_lossy(value).into_owned());
        if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
            return Err(invalid());
        }
        let parsed = ascii(value).parse::<usize>().map_err(|_| invalid())?;

        match length {
            Some(existing) if existing != parsed => return Err(ParseError::ConflictingContentLength),
            _ => length = Some(parsed),
        }
    }

    Ok(match (length, origin) {
        (Some(0), _) => Framing::Empty,
        (Some(n), _) => Framing::Length(n),
        (None, BodyOrigin::Request) => Framing::Empty,
        (None, BodyOrigin::Response(_)) => Framing::UntilClose,
    })
}

fn header_values<'a>(headers: &'a [HeaderItem], name: &'a str) -> impl Iterator<Item = &'a [u8]> {
    headers
        .iter()
        .filter(move |h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_ref())
}

/// Non-empty elements of a comma-separated header list.
fn list_values<'a>(headers: &'a [HeaderItem], name: &'a str) -> impl Iterator<Item = &'a [u8]> {
    header_values(headers, name)
        .flat_map(|v| v.split(|b| *b == b','))
        .map(<[u8]>::trim_ascii)
        .filter(|c| !c.is_empty())
}

fn is_token(s: &[u8]) -> bool {
    !s.is_empty()
        && s.iter().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(b)
        })
}

fn is_version(s: &[u8]) -> bool {
    s.starts_with(b"HTTP/") && s.is_ascii()
}

/// Callers only pass bytes already checked to be ASCII.
fn ascii(s: &[u8]) -> String {
    String::from_utf8_lossy(s).into_owned()
}
