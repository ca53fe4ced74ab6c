//! Just enough HTTP/1.x framing to run the handshake: splitting the first request at its blank
//! line, splicing authorization headers into it, and reading the proxy's response heads.


use bytes::{Bytes, BytesMut};


/// The blank line separating an HTTP header block from the body.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";


/// Returns the position of the first blank-line terminator in `bytes`.
pub fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}


/// The first request written by the consumer, split at its blank line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirstRequest {
    /// The request line and header lines, each terminated by CRLF, without the final blank line.
    /// Existing `Proxy-Authorization` lines have been removed.
    pub head: Bytes,

    /// Whatever followed the blank line.
    pub body: Bytes,
}

/// Splits a request into its header block and body.
///
/// Returns `None` if the request has no blank line, i.e. the header block is incomplete.
pub fn split_first_request(request: &Bytes) -> Option<FirstRequest> {
    let end = find_header_end(request)?;

    // keep the CRLF ending the last header line
    let raw_head = request.slice(..end + 2);
    let body = request.slice(end + HEADER_TERMINATOR.len()..);

    let mut head = BytesMut::with_capacity(raw_head.len());
    for line in raw_head.split_inclusive(|b| *b == b'\n') {
        if !is_header_line(line, PROXY_AUTHORIZATION) {
            head.extend_from_slice(line);
        }
    }

    Some(FirstRequest {
        head: head.freeze(),
        body,
    })
}

fn is_header_line(line: &[u8], name: &str) -> bool {
    line.len() > name.len()
        && line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
        && line[name.len()] == b':'
}


/// Whether `line` can be spliced into a request as one header line: a non-empty name, a colon,
/// and no CR or LF anywhere.
pub fn is_valid_header_line(line: &str) -> bool {
    match line.split_once(':') {
        Some((name, _)) => !name.trim().is_empty() && !line.contains(['\r', '\n']),
        None => false,
    }
}


/// Rebuilds the held request with the extra headers and an NTLM authorization token.
pub fn splice_request(request: &FirstRequest, extra_headers: &[String], token: &str) -> Bytes {
    let auth_line = format!("{}: NTLM {}\r\n\r\n", PROXY_AUTHORIZATION, token);
    let extra_len: usize = extra_headers.iter().map(|h| h.len() + 2).sum();

    let mut out = BytesMut::with_capacity(request.head.len() + extra_len + auth_line.len() + request.body.len());
    out.extend_from_slice(&request.head);
    for header in extra_headers {
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(auth_line.as_bytes());
    out.extend_from_slice(&request.body);
    out.freeze()
}


/// A parsed HTTP status line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    /// Parses `HTTP/<digit>.<digit> <3 digits>[ <reason>]`.
    pub fn parse(line: &str) -> Option<Self> {
        let (version, rest) = line.split_once(' ')?;
        let version_digits = version.strip_prefix("HTTP/")?.as_bytes();
        if version_digits.len() != 3
            || !version_digits[0].is_ascii_digit()
            || version_digits[1] != b'.'
            || !version_digits[2].is_ascii_digit() {
            return None;
        }

        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            version: version.to_owned(),
            code: code.parse().ok()?,
            reason: reason.to_owned(),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_auth_challenge(&self) -> bool {
        self.code == 401 || self.code == 407
    }
}


/// The head of an HTTP response as found at the start of an inbound chunk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseHead {
    /// The first line, verbatim.
    pub status_line: String,

    /// The parsed first line, if it is a valid status line.
    pub status: Option<StatusLine>,

    /// Header names and values, trimmed.
    pub headers: Vec<(String, String)>,

    /// The number of body bytes that arrived in the same chunk as the head.
    pub body_received: usize,
}

impl ResponseHead {
    /// Parses the response head at the start of `chunk`.
    ///
    /// If the chunk has no blank line, all of it is taken as the head.
    pub fn parse(chunk: &[u8]) -> Self {
        let (head, body_received) = match find_header_end(chunk) {
            Some(end) => (&chunk[..end], chunk.len() - end - HEADER_TERMINATOR.len()),
            None => (chunk, 0),
        };
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or("").to_owned();
        let status = StatusLine::parse(&status_line);
        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
            .collect();

        Self {
            status_line,
            status,
            headers,
            body_received,
        }
    }

    /// Returns the values of all headers called `name`, compared case-insensitively.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers.iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header_values("Content-Length")
            .next()
            .and_then(|v| v.parse().ok())
    }

    /// Finds the NTLM token offered by the proxy.
    ///
    /// Proxies send it in `Proxy-Authenticate`; a `401` answer may carry it in
    /// `WWW-Authenticate` instead.
    pub fn ntlm_challenge_token(&self) -> Option<&str> {
        let www = match &self.status {
            Some(status) if status.code == 401 => Some("WWW-Authenticate"),
            _ => None,
        };
        self.header_values("Proxy-Authenticate")
            .chain(www.into_iter().flat_map(|name| self.header_values(name)))
            .find_map(ntlm_token)
    }
}

/// Extracts the token from an `NTLM <token>` header value.
fn ntlm_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("NTLM") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_request_without_body() {
        let request = Bytes::from_static(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let split = split_first_request(&request).unwrap();
        assert_eq!(split.head, &b"GET / HTTP/1.1\r\nHost: x\r\n"[..]);
        assert!(split.body.is_empty());
    }

    #[test]
    fn split_request_with_body() {
        let request = Bytes::from_static(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd");
        let split = split_first_request(&request).unwrap();
        assert_eq!(split.head, &b"POST / HTTP/1.1\r\nContent-Length: 4\r\n"[..]);
        assert_eq!(split.body, &b"abcd"[..]);
    }

    #[test]
    fn split_request_needs_blank_line() {
        let request = Bytes::from_static(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(split_first_request(&request), None);
    }

    #[test]
    fn split_request_drops_existing_authorization() {
        let request = Bytes::from_static(b"GET / HTTP/1.1\r\nproxy-authorization: Basic Zm9v\r\nHost: x\r\n\r\n");
        let split = split_first_request(&request).unwrap();
        assert_eq!(split.head, &b"GET / HTTP/1.1\r\nHost: x\r\n"[..]);
    }

    #[test]
    fn splice_puts_token_after_extra_headers() {
        let request = split_first_request(&Bytes::from_static(b"POST / HTTP/1.1\r\nHost: x\r\n\r\nbody")).unwrap();
        let spliced = splice_request(&request, &["Proxy-Connection: keep-alive".to_owned()], "TlRMTQ==");
        assert_eq!(
            spliced,
            &b"POST / HTTP/1.1\r\nHost: x\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: NTLM TlRMTQ==\r\n\r\nbody"[..],
        );
    }

    #[test]
    fn header_lines_are_checked() {
        assert!(is_valid_header_line("Proxy-Connection: keep-alive"));
        assert!(is_valid_header_line("X-Empty:"));
        assert!(!is_valid_header_line("X-Evil: 1\r\nHost: elsewhere"));
        assert!(!is_valid_header_line("X-Evil: 1\n"));
        assert!(!is_valid_header_line("no colon"));
        assert!(!is_valid_header_line(": no name"));
        assert!(!is_valid_header_line(""));
    }

    #[test]
    fn status_lines() {
        let status = StatusLine::parse("HTTP/1.1 407 Proxy Authentication Required").unwrap();
        assert_eq!(status.code, 407);
        assert_eq!(status.reason, "Proxy Authentication Required");
        assert!(status.is_auth_challenge());

        assert!(StatusLine::parse("HTTP/1.0 204").unwrap().is_success());
        assert!(!StatusLine::parse("HTTP/1.1 500 Internal Server Error").unwrap().is_success());
        assert_eq!(StatusLine::parse("HTTP/2 200 OK"), None);
        assert_eq!(StatusLine::parse("HTTP/1.1 20 OK"), None);
        assert_eq!(StatusLine::parse("garbage"), None);
        assert_eq!(StatusLine::parse(""), None);
    }

    #[test]
    fn response_head_finds_token_and_length() {
        let chunk = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
            Proxy-Authenticate: Negotiate\r\n\
            proxy-authenticate: NTLM TlRMTVNTUAACAAAA\r\n\
            Content-Length: 10\r\n\r\nabcd";
        let head = ResponseHead::parse(chunk);
        assert_eq!(head.status.as_ref().map(|s| s.code), Some(407));
        assert_eq!(head.ntlm_challenge_token(), Some("TlRMTVNTUAACAAAA"));
        assert_eq!(head.content_length(), Some(10));
        assert_eq!(head.body_received, 4);
    }

    #[test]
    fn www_authenticate_only_counts_for_401() {
        let chunk = b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: NTLM abc\r\n\r\n";
        assert_eq!(ResponseHead::parse(chunk).ntlm_challenge_token(), Some("abc"));

        let chunk = b"HTTP/1.1 407 Proxy Authentication Required\r\nWWW-Authenticate: NTLM abc\r\n\r\n";
        assert_eq!(ResponseHead::parse(chunk).ntlm_challenge_token(), None);
    }

    #[test]
    fn bare_ntlm_offer_is_not_a_challenge() {
        let chunk = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\n\r\n";
        assert_eq!(ResponseHead::parse(chunk).ntlm_challenge_token(), None);
    }
}
