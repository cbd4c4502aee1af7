//! Identities used to find queued work again.
//!
//! Removal never relies on pointer identity of closures. Everything that can
//! be cancelled carries an explicit id or value, and [`TaskKey`] compares by
//! value: a (callback, token) pair matches only when both halves are equal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique identity value.
pub(crate) fn next_identity() -> u64 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

macro_rules! identity_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }

            pub(crate) fn fresh() -> Self {
                Self(next_identity())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

identity_type!(
    /// A simulated execution context ("thread" with a looper).
    ContextId,
    "ctx"
);
identity_type!(HandlerId, "handler");
identity_type!(
    /// Identity of a runnable; clones of a runnable share it.
    CallbackId,
    "callback"
);
identity_type!(MessageId, "msg");
identity_type!(AlarmId, "alarm");

/// Value-compared token, standing in for the platform's arbitrary `obj`/tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Removal key attached to a queued task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// A runnable posted through a handler, optionally tagged with a token.
    Callback {
        handler: HandlerId,
        callback: CallbackId,
        token: Option<Token>,
    },
    /// A message sent through a handler.
    Message {
        handler: HandlerId,
        message: MessageId,
        what: i32,
        obj: Option<Token>,
    },
    /// The task backing a live alarm.
    Alarm(AlarmId),
    /// Free-form key for drivers that post directly to a scheduler.
    Named(String),
}

impl TaskKey {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// The handler that posted this task, if any.
    #[must_use]
    pub const fn handler(&self) -> Option<HandlerId> {
        match self {
            Self::Callback { handler, .. } | Self::Message { handler, .. } => Some(*handler),
            Self::Alarm(_) | Self::Named(_) => None,
        }
    }

    /// Token or message object carried by this key.
    #[must_use]
    pub const fn token(&self) -> Option<&Token> {
        match self {
            Self::Callback { token, .. } => token.as_ref(),
            Self::Message { obj, .. } => obj.as_ref(),
            Self::Alarm(_) | Self::Named(_) => None,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback {
                handler,
                callback,
                token,
            } => match token {
                Some(token) => write!(f, "{handler}/{callback}#{token}"),
                None => write!(f, "{handler}/{callback}"),
            },
            Self::Message {
                handler,
                message,
                what,
                ..
            } => write!(f, "{handler}/{message}(what={what})"),
            Self::Alarm(id) => write!(f, "{id}"),
            Self::Named(name) => write!(f, "named:{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_identities_are_unique() {
        let a = CallbackId::fresh();
        let b = CallbackId::fresh();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn tagged_callbacks_compare_by_both_components() {
        let handler = HandlerId::from_raw(1);
        let callback = CallbackId::from_raw(7);
        let tagged = |tag: &str| TaskKey::Callback {
            handler,
            callback,
            token: Some(Token::from(tag)),
        };

        assert_eq!(tagged("tag1"), tagged("tag1"));
        assert_ne!(tagged("tag1"), tagged("tag2"));
        assert_ne!(
            tagged("tag1"),
            TaskKey::Callback {
                handler,
                callback: CallbackId::from_raw(8),
                token: Some(Token::from("tag1")),
            }
        );
    }

    #[test]
    fn key_accessors() {
        let key = TaskKey::Message {
            handler: HandlerId::from_raw(3),
            message: MessageId::from_raw(4),
            what: 123,
            obj: Some(Token::from("foo")),
        };
        assert_eq!(key.handler(), Some(HandlerId::from_raw(3)));
        assert_eq!(key.token().map(Token::as_str), Some("foo"));
        assert_eq!(key.to_string(), "handler:3/msg:4(what=123)");
        assert_eq!(TaskKey::named("x").handler(), None);
    }
}
