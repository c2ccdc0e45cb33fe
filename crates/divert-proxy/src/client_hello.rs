//! TLS ClientHello SNI extraction.
//!
//! Walks the TLS record header, the handshake header and the ClientHello
//! body far enough to find the `server_name` extension. No handshake is
//! performed, no key is needed, and nothing is ever written back to the
//! client: this is purely syntactic parsing of bytes already read.
//!
//! ## Layout
//!
//! ```text
//! record:     type(1)=0x16  version(2)  length(2)  fragment...
//! handshake:  type(1)=0x01  length(3)   body...
//! body:       version(2) random(32) session_id<1> cipher_suites<2>
//!             compression_methods<1> extensions<2>
//! extension:  type(2) length(2) data...       (server_name is type 0)
//! sni data:   list_length(2) { name_type(1) name<2> }*   (host_name is 0)
//! ```

use crate::sniff::{is_valid_host_name, SniffResult, MAX_HOST_NAME_LEN};

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;
/// 2^14 plaintext plus the largest expansion any TLS version allows.
const MAX_RECORD_LEN: usize = 16384 + 2048;
const HANDSHAKE_HEADER_LEN: usize = 4;

/// Why parsing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseError {
    /// The input ended before the structure did.
    Truncated,
    /// The bytes are not what a ClientHello with SNI looks like.
    Invalid(&'static str),
}

type ParseResult<T> = Result<T, ParseError>;

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> ParseResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ParseError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> ParseResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> ParseResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> ParseResult<usize> {
        let b = self.bytes(3)?;
        Ok((usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    fn skip_vec_u8(&mut self) -> ParseResult<()> {
        let len = usize::from(self.u8()?);
        self.bytes(len).map(|_| ())
    }

    fn skip_vec_u16(&mut self) -> ParseResult<()> {
        let len = usize::from(self.u16()?);
        self.bytes(len).map(|_| ())
    }
}

/// Extracts the SNI host name from the first bytes of a TLS connection.
///
/// Returns [`SniffResult::Incomplete`] while `data` is a plausible prefix of
/// a ClientHello that has not yet reached the `server_name` extension.
///
/// # Examples
///
/// ```
/// use divert_proxy::{client_hello::parse_sni, SniffResult};
///
/// assert_eq!(parse_sni(b"GET / HTTP/1.1\r\n"), SniffResult::NotFound("not a TLS handshake record"));
/// assert_eq!(parse_sni(&[0x16, 0x03]), SniffResult::Incomplete);
/// ```
pub fn parse_sni(data: &[u8]) -> SniffResult {
    if data.is_empty() {
        return SniffResult::Incomplete;
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return SniffResult::NotFound("not a TLS handshake record");
    }
    if data.len() >= 2 && data[1] != 0x03 {
        return SniffResult::NotFound("unsupported TLS record version");
    }
    if data.len() < RECORD_HEADER_LEN {
        return SniffResult::Incomplete;
    }

    let record_len = usize::from(u16::from_be_bytes([data[3], data[4]]));
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return SniffResult::NotFound("invalid TLS record length");
    }

    let record_end = RECORD_HEADER_LEN + record_len;
    let record_complete = data.len() >= record_end;
    let fragment = &data[RECORD_HEADER_LEN..data.len().min(record_end)];

    match parse_handshake(fragment) {
        Ok(host) => SniffResult::Found(host),
        Err(ParseError::Invalid(reason)) => SniffResult::NotFound(reason),
        // Only the first record is inspected; a hello split across records
        // is out of reach.
        Err(ParseError::Truncated) if record_complete && exceeds_record(fragment) => {
            SniffResult::NotFound("client hello spans multiple records")
        }
        Err(ParseError::Truncated) if record_complete => {
            SniffResult::NotFound("malformed client hello")
        }
        Err(ParseError::Truncated) => SniffResult::Incomplete,
    }
}

/// True if the handshake message in a complete record is longer than the
/// record itself.
fn exceeds_record(fragment: &[u8]) -> bool {
    match fragment {
        [_, a, b, c, ..] => {
            let hello_len = (usize::from(*a) << 16) | (usize::from(*b) << 8) | usize::from(*c);
            HANDSHAKE_HEADER_LEN + hello_len > fragment.len()
        }
        _ => true,
    }
}

fn parse_handshake(fragment: &[u8]) -> ParseResult<String> {
    let mut r = Reader::new(fragment);

    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(ParseError::Invalid("not a ClientHello"));
    }
    let hello_len = r.u24()?;
    // Parse what is present; a body cut short by the input ends as Truncated.
    let body_available = r.remaining().min(hello_len);
    let body_complete = r.remaining() >= hello_len;
    let mut body = Reader::new(r.bytes(body_available)?);

    body.bytes(2)?; // legacy_version
    body.bytes(32)?; // random
    body.skip_vec_u8()?; // legacy_session_id
    body.skip_vec_u16()?; // cipher_suites
    body.skip_vec_u8()?; // legacy_compression_methods

    if body.remaining() == 0 && body_complete {
        return Err(ParseError::Invalid("client hello has no extensions"));
    }

    let extensions_len = usize::from(body.u16()?);
    let extensions_available = body.remaining().min(extensions_len);
    let mut extensions = Reader::new(body.bytes(extensions_available)?);

    while extensions.remaining() > 0 {
        let ext_type = extensions.u16()?;
        let ext_len = usize::from(extensions.u16()?);
        let ext_data = extensions.bytes(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(ext_data).map_err(ParseError::Invalid);
        }
    }

    if extensions_available < extensions_len {
        Err(ParseError::Truncated)
    } else {
        Err(ParseError::Invalid("no server_name extension"))
    }
}

/// Parses a complete `server_name` extension body.
fn parse_server_name(data: &[u8]) -> Result<String, &'static str> {
    const MALFORMED: &str = "malformed server_name extension";

    let mut r = Reader::new(data);
    let list_len = usize::from(r.u16().map_err(|_| MALFORMED)?);
    let mut list = Reader::new(r.bytes(list_len).map_err(|_| MALFORMED)?);

    while list.remaining() > 0 {
        let name_type = list.u8().map_err(|_| MALFORMED)?;
        let name_len = usize::from(list.u16().map_err(|_| MALFORMED)?);
        let name = list.bytes(name_len).map_err(|_| MALFORMED)?;

        if name_type == NAME_TYPE_HOST_NAME {
            return validate_host_name(name);
        }
    }

    Err("server_name extension has no host_name")
}

fn validate_host_name(name: &[u8]) -> Result<String, &'static str> {
    if name.is_empty() || name.len() > MAX_HOST_NAME_LEN {
        return Err("invalid host_name length");
    }
    if !is_valid_host_name(name) {
        return Err("invalid characters in host_name");
    }
    // All bytes are ASCII, so this cannot fail.
    std::str::from_utf8(name)
        .map(str::to_string)
        .map_err(|_| "invalid characters in host_name")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client_hello, client_hello_with};

    #[test]
    fn extracts_sni() {
        let hello = client_hello("foo.example.com");
        assert_eq!(parse_sni(&hello), SniffResult::Found("foo.example.com".into()));
    }

    #[test]
    fn extracts_sni_after_other_extensions() {
        let padding = (0x0015, vec![0u8; 300]);
        let alpn = (0x0010, b"\x00\x03\x02h2".to_vec());
        let hello = client_hello_with(Some("api.example.org"), &[padding, alpn], true);
        assert_eq!(parse_sni(&hello), SniffResult::Found("api.example.org".into()));
    }

    #[test]
    fn every_prefix_is_incomplete_or_found() {
        let hello = client_hello("foo.example.com");
        for n in 1..hello.len() {
            match parse_sni(&hello[..n]) {
                SniffResult::Incomplete => {}
                SniffResult::Found(host) => assert_eq!(host, "foo.example.com"),
                other => panic!("prefix of {} bytes gave {:?}", n, other),
            }
        }
        assert_eq!(parse_sni(&hello), SniffResult::Found("foo.example.com".into()));
    }

    #[test]
    fn missing_sni_is_not_found() {
        let hello = client_hello_with(None, &[(0x000a, vec![0, 2, 0, 0x1d])], true);
        assert_eq!(
            parse_sni(&hello),
            SniffResult::NotFound("no server_name extension")
        );
    }

    #[test]
    fn hello_without_extensions_is_not_found() {
        let hello = client_hello_with(None, &[], false);
        assert_eq!(
            parse_sni(&hello),
            SniffResult::NotFound("client hello has no extensions")
        );
    }

    #[test]
    fn non_tls_bytes_are_not_found() {
        assert!(matches!(
            parse_sni(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"),
            SniffResult::NotFound(_)
        ));
        assert!(matches!(parse_sni(&[0x17, 0x03, 0x03, 0, 5]), SniffResult::NotFound(_)));
        assert!(matches!(parse_sni(&[0x16, 0x02]), SniffResult::NotFound(_)));
    }

    #[test]
    fn non_client_hello_handshake_is_not_found() {
        let mut hello = client_hello("foo.example.com");
        hello[5] = 0x02; // ServerHello
        assert_eq!(parse_sni(&hello), SniffResult::NotFound("not a ClientHello"));
    }

    #[test]
    fn hello_longer_than_its_record_is_not_found() {
        let mut hello = client_hello("foo.example.com");
        // Shrink the record so the handshake appears to continue in a second record.
        let short = (hello.len() - RECORD_HEADER_LEN - 10) as u16;
        hello[3..5].copy_from_slice(&short.to_be_bytes());
        hello.truncate(RECORD_HEADER_LEN + short as usize);
        assert_eq!(
            parse_sni(&hello),
            SniffResult::NotFound("client hello spans multiple records")
        );
    }

    #[test]
    fn extension_overrunning_complete_record_is_malformed() {
        let mut hello = client_hello_with(None, &[(0x000a, vec![0, 2, 0, 0x1d])], true);
        // record(5) + handshake(4) + fixed body(75) + extensions length(2) + type(2)
        let ext_len_at = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + 75 + 2 + 2;
        assert_eq!(&hello[ext_len_at..ext_len_at + 2], &[0x00, 0x04]);
        hello[ext_len_at..ext_len_at + 2].copy_from_slice(&0x0100u16.to_be_bytes());

        assert_eq!(parse_sni(&hello), SniffResult::NotFound("malformed client hello"));
    }

    #[test]
    fn sni_beyond_buffer_is_incomplete() {
        let padding = (0x0015, vec![0u8; 5000]);
        let hello = client_hello_with(Some("late.example.com"), &[padding], true);
        assert_eq!(parse_sni(&hello[..4096]), SniffResult::Incomplete);
    }

    #[test]
    fn rejects_invalid_host_characters() {
        let hello = client_hello("bad host\u{7f}");
        assert_eq!(
            parse_sni(&hello),
            SniffResult::NotFound("invalid characters in host_name")
        );
    }

    #[test]
    fn garbage_never_panics() {
        // Deterministic pseudo-random input, biased to look like a TLS record.
        let mut state: u32 = 0x2545_f491;
        for round in 0..2000 {
            let len = (round % 300) + 1;
            let mut data = Vec::with_capacity(len);
            for _ in 0..len {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                data.push((state & 0xff) as u8);
            }
            if round % 2 == 0 {
                data[0] = CONTENT_TYPE_HANDSHAKE;
                if len > 1 {
                    data[1] = 0x03;
                }
            }
            let _ = parse_sni(&data);
        }
    }
}
