//! Gateway close event codes and the reconnect policy attached to them.

use crate::RECONNECT_CLOSE_CODE;

/// Classification of a close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode {
    pub code: u16,
    /// The code is one the server documents.
    pub known: bool,
    /// The client should reconnect after seeing it.
    pub reconnect: bool,
    /// The session cannot be resumed and must identify again.
    pub invalidates_session: bool,
    pub description: &'static str,
}

impl CloseCode {
    /// Our own reconnect sentinel, echoed back by the server.
    pub fn is_self_initiated(&self) -> bool {
        self.code == RECONNECT_CLOSE_CODE
    }
}

struct Entry {
    code: u16,
    reconnect: bool,
    invalidates_session: bool,
    description: &'static str,
}

const fn entry(code: u16, reconnect: bool, description: &'static str) -> Entry {
    Entry {
        code,
        reconnect,
        invalidates_session: false,
        description,
    }
}

const fn invalidating(code: u16, description: &'static str) -> Entry {
    Entry {
        code,
        reconnect: true,
        invalidates_session: true,
        description,
    }
}

const CODES: &[Entry] = &[
    entry(4000, true, "unknown error"),
    entry(4001, true, "unknown opcode"),
    entry(4002, true, "decode error"),
    entry(4003, true, "not authenticated"),
    entry(4004, false, "authentication failed"),
    entry(4005, true, "already authenticated"),
    invalidating(4007, "invalid seq"),
    entry(4008, true, "rate limited"),
    invalidating(4009, "session timed out"),
    entry(4010, false, "invalid shard"),
    entry(4011, false, "sharding required"),
    entry(4012, false, "invalid API version"),
    entry(4013, false, "invalid intent(s)"),
    entry(4014, false, "disallowed intent(s)"),
];

/// Look up the reconnect policy for `code`. Unknown codes do not reconnect.
pub fn classify(code: u16) -> CloseCode {
    match CODES.iter().find(|e| e.code == code) {
        Some(e) => CloseCode {
            code,
            known: true,
            reconnect: e.reconnect,
            invalidates_session: e.invalidates_session,
            description: e.description,
        },
        None => CloseCode {
            code,
            known: false,
            reconnect: false,
            invalidates_session: false,
            description: if code == RECONNECT_CLOSE_CODE {
                "client reconnect"
            } else {
                "unknown close code"
            },
        },
    }
}
