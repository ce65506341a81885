//! Identity and ordering types for opsync.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A globally unique operation identifier.
///
/// Generated by the writing client; doubles as the idempotency key on upload.
/// Kept as a string on the wire so the server can validate foreign ids.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(String);

impl OpId {
    /// Create a new random OpId (UUID v4).
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({})", self.0)
    }
}

/// Identifies one client installation (a device) within an account.
///
/// Ordered lexically; the ordering breaks Last-Write-Wins ties.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a new random ClientId.
    ///
    /// 12 random bytes, displayed as URL-safe base64 (16 chars).
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Wrap an existing client identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

/// Identifies an account. All logs are partitioned by account.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an account identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// A server-assigned, per-account sequence number.
///
/// Assigned by the server, never by clients. Sequence numbers are the sole
/// basis for "new since last pull" because device clocks drift.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ServerSeq(u64);

impl ServerSeq {
    /// Create a new ServerSeq with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this ServerSeq.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The sequence before any operation was accepted.
    pub fn zero() -> Self {
        Self(0)
    }

    /// The following sequence number.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ServerSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ServerSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerSeq({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_id_is_uuid_v4() {
        let id = OpId::new();
        let parsed = uuid::Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn op_ids_are_unique() {
        assert_ne!(OpId::new(), OpId::new());
    }

    #[test]
    fn op_id_serializes_as_plain_string() {
        let id = OpId::from_string("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn client_id_random_length() {
        let id = ClientId::random();
        assert_eq!(id.as_str().len(), 16); // 12 bytes = 16 base64 chars
    }

    #[test]
    fn client_id_lexical_order() {
        assert!(ClientId::new("alpha") < ClientId::new("beta"));
        assert!(ClientId::new("B") < ClientId::new("a"));
    }

    #[test]
    fn server_seq_ordering() {
        let s1 = ServerSeq::new(100);
        let s2 = ServerSeq::new(200);
        assert!(s1 < s2);
        assert_eq!(ServerSeq::zero().value(), 0);
    }

    #[test]
    fn server_seq_saturating_next() {
        assert_eq!(ServerSeq::new(7).next().value(), 8);
        assert_eq!(ServerSeq::new(u64::MAX).next().value(), u64::MAX);
    }
}
