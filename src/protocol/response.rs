// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::*;

/// Returns the length of one complete upstream reply for a command of the
/// given kind, without decoding it. `Err(ParseError::Incomplete)` means more
/// bytes are needed; any other error means the upstream connection can no
/// longer be trusted to be aligned to reply boundaries.
///
/// Replies are framed per command kind:
///
/// - retrieval: zero or more `VALUE <key> <flags> <bytes>[ <cas>]` records,
///   each followed by `<bytes>` of data and a CRLF, terminated by `END`
/// - delete: a single `DELETED` or `NOT_FOUND` line
/// - storage: a single `STORED`, `NOT_STORED`, `EXISTS`, or `NOT_FOUND` line
///
/// Any kind may instead produce an `ERROR`, `CLIENT_ERROR`, or
/// `SERVER_ERROR` line.
pub fn reply_len(kind: CommandKind, buffer: &[u8]) -> Result<usize, ParseError> {
    if kind.is_retrieval() {
        retrieval_reply_len(buffer)
    } else {
        single_line_reply_len(kind, buffer)
    }
}

fn is_error_line(line: &[u8]) -> bool {
    line == b"ERROR"
        || line.starts_with(b"CLIENT_ERROR")
        || line.starts_with(b"SERVER_ERROR")
}

/// Frames the line starting at `offset`, returning its contents without the
/// CRLF and the offset one past it.
fn crlf_line(buffer: &[u8], offset: usize) -> Result<(&[u8], usize), ParseError> {
    let remaining = &buffer[offset..];

    let end = match remaining.iter().position(|&b| b == b'\n') {
        Some(end) => end,
        None => {
            return Err(ParseError::Incomplete);
        }
    };

    if end == 0 || remaining[end - 1] != b'\r' {
        return Err(ParseError::MalformedFraming);
    }

    Ok((&remaining[..end - 1], offset + end + 1))
}

fn single_line_reply_len(kind: CommandKind, buffer: &[u8]) -> Result<usize, ParseError> {
    let (line, end) = crlf_line(buffer, 0)?;

    let expected = match kind {
        CommandKind::Delete => matches!(line, b"DELETED" | b"NOT_FOUND"),
        _ => matches!(line, b"STORED" | b"NOT_STORED" | b"EXISTS" | b"NOT_FOUND"),
    };

    if expected || is_error_line(line) {
        Ok(end)
    } else {
        Err(ParseError::MalformedFraming)
    }
}

fn retrieval_reply_len(buffer: &[u8]) -> Result<usize, ParseError> {
    let mut offset = 0;

    loop {
        let (line, line_end) = crlf_line(buffer, offset)?;

        if line == b"END" {
            return Ok(line_end);
        }

        if is_error_line(line) {
            // an error line terminates the reply even mid-record-stream
            return Ok(line_end);
        }

        if !line.starts_with(b"VALUE ") {
            return Err(ParseError::MalformedFraming);
        }

        // VALUE <key> <flags> <bytes>[ <cas>]
        let mut tokens = line.split(|&b| b == b' ');
        let _verb = tokens.next();
        let _key = tokens.next().ok_or(ParseError::MalformedFraming)?;
        let _flags = tokens.next().ok_or(ParseError::MalformedFraming)?;
        let bytes = tokens.next().ok_or(ParseError::MalformedFraming)?;
        let cas = tokens.next();

        if cas.is_some() && tokens.next().is_some() {
            return Err(ParseError::MalformedFraming);
        }

        let data_len = data_len(bytes)?;

        // the record's data plus its CRLF must be present before the next
        // line can be framed
        let data_end = line_end + data_len + CRLF.len();
        if buffer.len() < data_end {
            return Err(ParseError::Incomplete);
        }

        if &buffer[data_end - CRLF.len()..data_end] != CRLF {
            return Err(ParseError::MalformedFraming);
        }

        offset = data_end;
    }
}

fn data_len(token: &[u8]) -> Result<usize, ParseError> {
    if token.is_empty() || !token.iter().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::MalformedFraming);
    }

    let mut value: usize = 0;
    for b in token {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(ParseError::MalformedFraming)?;
    }

    Ok(value)
}
