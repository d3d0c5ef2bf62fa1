//! Subject validation, wildcard matching, and inbox minting.
//!
//! Subjects are dotted token sequences. Publish subjects are fully
//! literal; subscribe subjects may use `*` (exactly one token) and `>`
//! (one or more trailing tokens, final position only).

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{ProtocolError, ProtocolResult};

/// Maximum subject length in bytes.
pub const MAX_SUBJECT_LEN: usize = 256;

/// Length of the random portion of a minted inbox subject.
pub const INBOX_SUFFIX_LEN: usize = 22;

/// Default inbox prefix; configurable per client.
pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX";

fn err(subject: &str) -> ProtocolError {
    ProtocolError::InvalidSubject {
        subject: subject.to_owned(),
    }
}

fn check_shape(subject: &str) -> ProtocolResult<()> {
    if subject.is_empty() || subject.len() > MAX_SUBJECT_LEN {
        return Err(err(subject));
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(err(subject));
    }
    // leading/trailing dot and ".." both produce an empty token
    if subject.split('.').any(str::is_empty) {
        return Err(err(subject));
    }
    Ok(())
}

/// Validate a subject for publishing. No wildcards of any kind.
pub fn validate_publish(subject: &str) -> ProtocolResult<()> {
    check_shape(subject)?;
    if subject.contains('*') || subject.contains('>') {
        return Err(err(subject));
    }
    Ok(())
}

/// Validate a subject for subscribing. `*` and `>` are allowed only as
/// complete tokens and `>` must be last.
pub fn validate_subscribe(subject: &str) -> ProtocolResult<()> {
    check_shape(subject)?;
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "*" => {}
            ">" => {
                if i != tokens.len() - 1 {
                    return Err(err(subject));
                }
            }
            t if t.contains('*') || t.contains('>') => return Err(err(subject)),
            _ => {}
        }
    }
    Ok(())
}

/// Validate a queue-group name: non-empty, no whitespace.
pub fn validate_queue_group(name: &str) -> ProtocolResult<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ProtocolError::InvalidQueueGroup {
            name: name.to_owned(),
        });
    }
    Ok(())
}

/// Does a subscribe pattern match a concrete subject?
///
/// `*` consumes exactly one token; `>` consumes the rest (at least one
/// token).
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.').peekable();
    loop {
        match (pat.next(), sub.peek()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some(">"), Some(_)) => return true,
            (Some(_), None) => return false,
            (Some("*"), Some(_)) => {
                sub.next();
            }
            (Some(p), Some(&s)) => {
                if p != s {
                    return false;
                }
                sub.next();
            }
        }
    }
}

/// Mint a unique inbox subject: `<prefix>.<22 alphanumerics>`.
pub fn new_inbox(prefix: &str, rng: &mut impl Rng) -> String {
    let mut inbox = String::with_capacity(prefix.len() + 1 + INBOX_SUFFIX_LEN);
    inbox.push_str(prefix);
    inbox.push('.');
    inbox.extend(
        rng.sample_iter(&Alphanumeric)
            .take(INBOX_SUFFIX_LEN)
            .map(char::from),
    );
    inbox
}
