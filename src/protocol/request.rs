// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::*;

use nom::bytes::streaming::{tag, take, take_till};
use nom::sequence::terminated;

/// The commands this proxy will forward. Verb matching is case-sensitive and
/// anything outside this set is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Get,
    Gets,
    Delete,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl CommandKind {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Gets => "gets",
            Self::Delete => "delete",
            Self::Set => "set",
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Prepend => "prepend",
        }
    }

    /// Storage commands carry a value body after the header line.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Set | Self::Add | Self::Replace | Self::Append | Self::Prepend
        )
    }

    pub fn is_retrieval(&self) -> bool {
        matches!(self, Self::Get | Self::Gets)
    }
}

/// One framed request. The raw bytes to forward are the first `consumed`
/// bytes of the parse input; only the classification and the key are kept
/// here.
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    kind: CommandKind,
    key: Box<[u8]>,
}

impl Request {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

/// A successful parse: the message plus the number of bytes it consumed from
/// the input buffer.
pub struct ParseOk<T> {
    inner: T,
    consumed: usize,
}

impl<T> ParseOk<T> {
    pub fn new(inner: T, consumed: usize) -> Self {
        Self { inner, consumed }
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// Streaming request parser. Operates on a buffered byte stream and never
/// consumes partial commands: the caller advances its buffer by `consumed()`
/// only after a complete command was returned.
#[derive(Clone)]
pub struct RequestParser {
    max_key_len: usize,
    max_value_size: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self {
            max_key_len: MAX_KEY_LEN,
            max_value_size: MAX_ITEM_SIZE,
        }
    }
}

/// Frames one line terminated by `\n`. Streaming: incomplete until the
/// newline arrives.
fn line(input: &[u8]) -> nom::IResult<&[u8], &[u8]> {
    terminated(take_till(|b| b == b'\n'), tag(&b"\n"[..]))(input)
}

/// Frames a value body of exactly `len` bytes followed by CRLF.
fn body(input: &[u8], len: usize) -> nom::IResult<&[u8], &[u8]> {
    terminated(take(len), tag(CRLF))(input)
}

fn parse_u32(token: &[u8]) -> Result<u32, ParseError> {
    parse_u64(token)?
        .try_into()
        .map_err(|_| ParseError::MalformedStorageHeader)
}

fn parse_u64(token: &[u8]) -> Result<u64, ParseError> {
    if token.is_empty() || !token.iter().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::MalformedStorageHeader);
    }

    let mut value: u64 = 0;
    for b in token {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or(ParseError::MalformedStorageHeader)?;
    }

    Ok(value)
}

impl RequestParser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Attempts to frame one command from the front of `buffer`.
    ///
    /// `Err(ParseError::Incomplete)` means more bytes are needed. Any other
    /// error means the byte stream is no longer aligned to command boundaries
    /// and the connection must be closed.
    pub fn parse(&self, buffer: &[u8]) -> Result<ParseOk<Request>, ParseError> {
        let (remaining, header) = match line(buffer) {
            Ok(v) => v,
            Err(nom::Err::Incomplete(_)) => {
                // a conforming client never sends a header this long, stop
                // buffering for one
                if buffer.len() > MAX_HEADER_SIZE {
                    return Err(ParseError::MalformedFraming);
                } else {
                    return Err(ParseError::Incomplete);
                }
            }
            Err(_) => {
                return Err(ParseError::MalformedFraming);
            }
        };

        if header.len() > MAX_HEADER_SIZE || header.last() != Some(&b'\r') {
            return Err(ParseError::MalformedFraming);
        }

        // strip the `\r`, the `\n` was consumed by the line parser
        let header_line = &header[..header.len() - 1];
        let consumed = header.len() + 1;

        let mut tokens = header_line.split(|&b| b == b' ');

        let kind = match tokens.next() {
            Some(b"get") => CommandKind::Get,
            Some(b"gets") => CommandKind::Gets,
            Some(b"delete") => CommandKind::Delete,
            Some(b"set") => CommandKind::Set,
            Some(b"add") => CommandKind::Add,
            Some(b"replace") => CommandKind::Replace,
            Some(b"append") => CommandKind::Append,
            Some(b"prepend") => CommandKind::Prepend,
            Some(b"") | None => {
                return Err(ParseError::MalformedFraming);
            }
            Some(_) => {
                return Err(ParseError::UnknownCommand);
            }
        };

        if kind.is_storage() {
            self.parse_storage(kind, tokens, remaining, consumed)
        } else {
            self.parse_single_key(kind, tokens, consumed)
        }
    }

    /// `get <key>`, `gets <key>`, and `delete <key>`: the header is the whole
    /// request and exactly one key is allowed.
    fn parse_single_key<'a>(
        &self,
        kind: CommandKind,
        mut tokens: impl Iterator<Item = &'a [u8]>,
        consumed: usize,
    ) -> Result<ParseOk<Request>, ParseError> {
        let key = tokens.next().ok_or(ParseError::MalformedFraming)?;

        if tokens.next().is_some() {
            return Err(match kind {
                CommandKind::Delete => ParseError::MultiDeleteUnsupported,
                _ => ParseError::MultigetUnsupported,
            });
        }

        if !valid_key(key, self.max_key_len) {
            return Err(ParseError::MalformedFraming);
        }

        Ok(ParseOk::new(
            Request {
                kind,
                key: key.into(),
            },
            consumed,
        ))
    }

    /// `<verb> <key> <flags> <expiry> <valuelen>` followed by exactly
    /// `valuelen` body bytes and a CRLF. The size bound is enforced from the
    /// header alone, before any of the body is read.
    fn parse_storage<'a>(
        &self,
        kind: CommandKind,
        mut tokens: impl Iterator<Item = &'a [u8]>,
        remaining: &[u8],
        header_len: usize,
    ) -> Result<ParseOk<Request>, ParseError> {
        let key = tokens.next().ok_or(ParseError::MalformedStorageHeader)?;

        if !valid_key(key, self.max_key_len) {
            return Err(ParseError::MalformedStorageHeader);
        }

        let _flags = parse_u32(tokens.next().ok_or(ParseError::MalformedStorageHeader)?)?;
        let _expiry = parse_u32(tokens.next().ok_or(ParseError::MalformedStorageHeader)?)?;
        let vlen = parse_u64(tokens.next().ok_or(ParseError::MalformedStorageHeader)?)?;

        // `noreply` would suppress the reply on a real server; this proxy
        // does not implement suppression, so the token is rejected rather
        // than silently breaking the reply matching
        if tokens.next().is_some() {
            return Err(ParseError::MalformedStorageHeader);
        }

        if vlen > self.max_value_size as u64 {
            return Err(ParseError::ValueTooLarge);
        }

        match body(remaining, vlen as usize) {
            Ok((_, _value)) => Ok(ParseOk::new(
                Request {
                    kind,
                    key: key.into(),
                },
                header_len + vlen as usize + CRLF.len(),
            )),
            Err(nom::Err::Incomplete(_)) => Err(ParseError::Incomplete),
            Err(_) => Err(ParseError::MalformedValueBody),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RequestParser {
        RequestParser::new()
    }

    fn parse_ok(input: &[u8]) -> (Request, usize) {
        let result = parser().parse(input).expect("parse failed");
        let consumed = result.consumed();
        (result.into_inner(), consumed)
    }

    #[test]
    fn get() {
        let (request, consumed) = parse_ok(b"get foo\r\n");
        assert_eq!(request.kind(), CommandKind::Get);
        assert_eq!(request.key(), b"foo");
        assert_eq!(consumed, 9);
    }

    #[test]
    fn gets() {
        let (request, consumed) = parse_ok(b"gets foo\r\n");
        assert_eq!(request.kind(), CommandKind::Gets);
        assert_eq!(request.key(), b"foo");
        assert_eq!(consumed, 10);
    }

    #[test]
    fn delete() {
        let (request, consumed) = parse_ok(b"delete foo\r\n");
        assert_eq!(request.kind(), CommandKind::Delete);
        assert_eq!(request.key(), b"foo");
        assert_eq!(consumed, 12);
    }

    #[test]
    fn storage() {
        for (verb, kind) in [
            ("set", CommandKind::Set),
            ("add", CommandKind::Add),
            ("replace", CommandKind::Replace),
            ("append", CommandKind::Append),
            ("prepend", CommandKind::Prepend),
        ] {
            let input = format!("{verb} x 0 0 5\r\nhello\r\n");
            let (request, consumed) = parse_ok(input.as_bytes());
            assert_eq!(request.kind(), kind);
            assert_eq!(request.key(), b"x");
            assert_eq!(consumed, input.len());
        }
    }

    #[test]
    fn zero_length_value() {
        let (request, consumed) = parse_ok(b"set x 0 0 0\r\n\r\n");
        assert_eq!(request.kind(), CommandKind::Set);
        assert_eq!(consumed, 15);
    }

    // a command is complete only once the full body and its terminator have
    // arrived; every shorter prefix is incomplete
    #[test]
    fn body_length_exact() {
        let input = b"set x 0 0 5\r\nhello\r\n";
        for len in 0..input.len() {
            assert_eq!(
                parser().parse(&input[..len]).err(),
                Some(ParseError::Incomplete),
                "prefix of {len} bytes should be incomplete"
            );
        }
        let (_, consumed) = parse_ok(input);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn body_bad_terminator() {
        assert_eq!(
            parser().parse(b"set x 0 0 5\r\nhelloXX").err(),
            Some(ParseError::MalformedValueBody)
        );
        // body itself contains the right bytes but runs past the declared
        // length
        assert_eq!(
            parser().parse(b"set x 0 0 3\r\nhello\r\n").err(),
            Some(ParseError::MalformedValueBody)
        );
    }

    // the bound comes from the header, the body is never awaited
    #[test]
    fn value_too_large() {
        assert_eq!(
            parser().parse(b"set x 0 0 1048577\r\n").err(),
            Some(ParseError::ValueTooLarge)
        );
        // largest permitted length parses (incomplete, waiting on the body)
        assert_eq!(
            parser().parse(b"set x 0 0 1048576\r\n").err(),
            Some(ParseError::Incomplete)
        );
    }

    #[test]
    fn verbs_are_case_sensitive() {
        assert_eq!(
            parser().parse(b"SET x 0 0 5\r\nhello\r\n").err(),
            Some(ParseError::UnknownCommand)
        );
        assert_eq!(
            parser().parse(b"Get foo\r\n").err(),
            Some(ParseError::UnknownCommand)
        );
    }

    #[test]
    fn unknown_verbs() {
        assert_eq!(
            parser().parse(b"incr foo 1\r\n").err(),
            Some(ParseError::UnknownCommand)
        );
        assert_eq!(
            parser().parse(b"flush_all\r\n").err(),
            Some(ParseError::UnknownCommand)
        );
    }

    #[test]
    fn multiget_rejected() {
        assert_eq!(
            parser().parse(b"get a b\r\n").err(),
            Some(ParseError::MultigetUnsupported)
        );
        assert_eq!(
            parser().parse(b"gets a b c\r\n").err(),
            Some(ParseError::MultigetUnsupported)
        );
    }

    #[test]
    fn multi_delete_rejected() {
        assert_eq!(
            parser().parse(b"delete a b\r\n").err(),
            Some(ParseError::MultiDeleteUnsupported)
        );
    }

    #[test]
    fn noreply_rejected() {
        assert_eq!(
            parser().parse(b"set x 0 0 5 noreply\r\nhello\r\n").err(),
            Some(ParseError::MalformedStorageHeader)
        );
    }

    #[test]
    fn malformed_framing() {
        // missing carriage return
        assert_eq!(
            parser().parse(b"get foo\n").err(),
            Some(ParseError::MalformedFraming)
        );
        // empty verb
        assert_eq!(
            parser().parse(b"\r\n").err(),
            Some(ParseError::MalformedFraming)
        );
        assert_eq!(
            parser().parse(b" get foo\r\n").err(),
            Some(ParseError::MalformedFraming)
        );
        // missing key
        assert_eq!(
            parser().parse(b"get\r\n").err(),
            Some(ParseError::MalformedFraming)
        );
        assert_eq!(
            parser().parse(b"get \r\n").err(),
            Some(ParseError::MalformedFraming)
        );
    }

    #[test]
    fn malformed_storage_header() {
        // wrong token count
        assert_eq!(
            parser().parse(b"set x 0 0\r\n").err(),
            Some(ParseError::MalformedStorageHeader)
        );
        // non-numeric fields
        assert_eq!(
            parser().parse(b"set x nope 0 5\r\nhello\r\n").err(),
            Some(ParseError::MalformedStorageHeader)
        );
        assert_eq!(
            parser().parse(b"set x 0 0 5x\r\nhello\r\n").err(),
            Some(ParseError::MalformedStorageHeader)
        );
        // flags and expiry are 32-bit
        assert_eq!(
            parser().parse(b"set x 4294967296 0 5\r\nhello\r\n").err(),
            Some(ParseError::MalformedStorageHeader)
        );
    }

    #[test]
    fn key_validation() {
        let long_key = vec![b'a'; 251];
        let request = [b"get ", &long_key[..], b"\r\n"].concat();
        assert_eq!(
            parser().parse(&request).err(),
            Some(ParseError::MalformedFraming)
        );

        let max_key = vec![b'a'; 250];
        let request = [b"get ", &max_key[..], b"\r\n"].concat();
        assert!(parser().parse(&request).is_ok());

        // control characters are not valid key bytes
        assert_eq!(
            parser().parse(b"get f\x01o\r\n").err(),
            Some(ParseError::MalformedFraming)
        );
        assert_eq!(
            parser().parse(b"set f\x7fo 0 0 1\r\nx\r\n").err(),
            Some(ParseError::MalformedStorageHeader)
        );
    }

    #[test]
    fn incomplete_header() {
        assert_eq!(parser().parse(b"").err(), Some(ParseError::Incomplete));
        assert_eq!(
            parser().parse(b"get fo").err(),
            Some(ParseError::Incomplete)
        );
        assert_eq!(
            parser().parse(b"get foo\r").err(),
            Some(ParseError::Incomplete)
        );
    }

    #[test]
    fn unbounded_header() {
        let input = vec![b'a'; MAX_HEADER_SIZE + 1];
        assert_eq!(
            parser().parse(&input).err(),
            Some(ParseError::MalformedFraming)
        );
    }

    // only the first command is framed, trailing bytes are left alone
    #[test]
    fn pipelined_input() {
        let (request, consumed) = parse_ok(b"get a\r\nget b\r\n");
        assert_eq!(request.key(), b"a");
        assert_eq!(consumed, 7);
    }
}
