//! Result codes carried by action replies and origin notifications

pub const SUCCESS: i32 = 0;

// Wrong target: move to the next endpoint in the set
pub const NOT_LEADER: i32 = 0x0101;
pub const REDIRECT: i32 = 0x0102;

// Retryable on the same endpoint after a backoff
pub const TIMEOUT: i32 = 0x0201;
pub const OVERLOADED: i32 = 0x0202;
pub const LEADER_CHANGED: i32 = 0x0203;
pub const NETWORK_UNAVAILABLE: i32 = 0x0204;

// Coordinator-side codes
pub const INVALID_STATE: i32 = 0x0301;
pub const CONFLICT: i32 = 0x0302;
pub const PERSISTENCE_FAILURE: i32 = 0x0303;
pub const ACTION_EXHAUSTED: i32 = 0x0304;
pub const CANCELED: i32 = 0x0305;
pub const INTERNAL: i32 = 0x03FF;

/// How the dispatcher reacts to a reply code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RspClass {
    Success,
    Redirect,
    Transient,
    Fatal,
}

pub fn classify(code: i32) -> RspClass {
    match code {
        SUCCESS => RspClass::Success,
        NOT_LEADER | REDIRECT => RspClass::Redirect,
        TIMEOUT | OVERLOADED | LEADER_CHANGED | NETWORK_UNAVAILABLE => RspClass::Transient,
        _ => RspClass::Fatal,
    }
}

/// Short name for logs
pub fn code_str(code: i32) -> &'static str {
    match code {
        SUCCESS => "success",
        NOT_LEADER => "not-leader",
        REDIRECT => "redirect",
        TIMEOUT => "timeout",
        OVERLOADED => "overloaded",
        LEADER_CHANGED => "leader-changed",
        NETWORK_UNAVAILABLE => "network-unavailable",
        INVALID_STATE => "invalid-state",
        CONFLICT => "conflict",
        PERSISTENCE_FAILURE => "persistence-failure",
        ACTION_EXHAUSTED => "action-exhausted",
        CANCELED => "canceled",
        INTERNAL => "internal",
        _ => "remote-error",
    }
}
