#![forbid(unsafe_code)]

//! Process and request guards used by the studybeats binaries.

use anyhow::{Result, bail};
use axum::http::{HeaderMap, header::AUTHORIZATION};
use nix::unistd::Uid;

/// Refuses to start a binary as root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use an unprivileged service account");
    }
    Ok(())
}

/// Outcome of checking a maintenance trigger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAccess {
    Granted,
    /// No secret is configured, so remote triggers are switched off.
    Disabled,
    Denied,
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

pub fn check_trigger_access(secret: Option<&str>, headers: &HeaderMap) -> TriggerAccess {
    let Some(secret) = secret else {
        return TriggerAccess::Disabled;
    };
    match bearer_token(headers) {
        Some(token) if constant_time_eq(token.as_bytes(), secret.as_bytes()) => {
            TriggerAccess::Granted
        }
        _ => TriggerAccess::Denied,
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
