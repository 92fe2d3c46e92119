//! # Audit: Redaction-on-Write for Mutation Records
//!
//! Every mutating endpoint appends an [`AuditEvent`] after its state change
//! commits. The caller-supplied payload passes through [`Redactor::redact`]
//! first: a recursive walk over the JSON tree that replaces the value of any
//! secret-shaped key with [`REDACTED`], whatever the endpoint's payload shape.
//!
//! Keys are normalized (lowercased, `_` and `-` removed) and match a denylist
//! entry when they equal it or end with it, so `api_key`, `X-Api-Key`, and
//! `githubToken` are all caught while `dedupeKey` is not.
//!
//! Audit writes are best-effort: a failed insert is logged and reported to the
//! caller via the `x-audit-degraded` header, but never rolls back the mutation.

use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

pub const DEFAULT_REDACT_KEYS: &[&str] = &[
    "token",
    "password",
    "passwd",
    "secret",
    "apikey",
    "authorization",
    "privatekey",
    "accesskey",
    "secretkey",
    "credential",
    "credentials",
    "cookie",
];

/// One append-only audit record, before persistence.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor_fingerprint: String,
    pub action: &'static str,
    pub target_entity: String,
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(
        actor_fingerprint: &str,
        action: &'static str,
        target_entity: impl Into<String>,
        payload: Value,
    ) -> Self {
        AuditEvent {
            actor_fingerprint: actor_fingerprint.to_string(),
            action,
            target_entity: target_entity.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Redactor {
    denylist: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Redactor::new(DEFAULT_REDACT_KEYS.iter().copied())
    }
}

impl Redactor {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Redactor {
            denylist: keys
                .into_iter()
                .map(|k| normalize_key(k.as_ref()))
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = normalize_key(key);
        self.denylist
            .iter()
            .any(|deny| key == *deny || key.ends_with(deny.as_str()))
    }

    /// Return a copy of `value` with every sensitive field replaced.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    let v = if self.is_sensitive(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.redact(v)
                    };
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}
