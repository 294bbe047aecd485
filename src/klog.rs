// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::protocol::CommandKind;

/// Response classes for the command log, following the memcache response
/// code convention.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Status {
    Miss = 0,
    Hit = 4,
    Stored = 5,
    Exists = 6,
    Deleted = 7,
    NotFound = 8,
    NotStored = 9,
    ClientError = 10,
    ServerError = 11,
}

/// Classifies a verbatim upstream reply for command logging.
pub(crate) fn response_status(kind: CommandKind, response: &[u8]) -> Status {
    if response.starts_with(b"SERVER_ERROR") || response.starts_with(b"ERROR") {
        return Status::ServerError;
    }

    if response.starts_with(b"CLIENT_ERROR") {
        return Status::ClientError;
    }

    if kind.is_retrieval() {
        if response.starts_with(b"VALUE ") {
            Status::Hit
        } else {
            Status::Miss
        }
    } else if response.starts_with(b"STORED") {
        Status::Stored
    } else if response.starts_with(b"NOT_STORED") {
        Status::NotStored
    } else if response.starts_with(b"EXISTS") {
        Status::Exists
    } else if response.starts_with(b"DELETED") {
        Status::Deleted
    } else {
        Status::NotFound
    }
}

pub(crate) fn klog_1(command: &str, key: &[u8], status: Status, response_len: usize) {
    klog!(
        "\"{} {}\" {} {}",
        command,
        String::from_utf8_lossy(key),
        status as u8,
        response_len
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_replies() {
        assert_eq!(
            response_status(CommandKind::Get, b"VALUE foo 0 3\r\nbar\r\nEND\r\n"),
            Status::Hit
        );
        assert_eq!(response_status(CommandKind::Get, b"END\r\n"), Status::Miss);
        assert_eq!(
            response_status(CommandKind::Set, b"STORED\r\n"),
            Status::Stored
        );
        assert_eq!(
            response_status(CommandKind::Add, b"NOT_STORED\r\n"),
            Status::NotStored
        );
        assert_eq!(
            response_status(CommandKind::Delete, b"DELETED\r\n"),
            Status::Deleted
        );
        assert_eq!(
            response_status(CommandKind::Delete, b"NOT_FOUND\r\n"),
            Status::NotFound
        );
        assert_eq!(
            response_status(CommandKind::Get, b"SERVER_ERROR upstream unavailable\r\n"),
            Status::ServerError
        );
    }
}
