//! Owner identifier

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Canonical identifier of the user owning devices, rules and connections.
///
/// Payloads from the broker and the handshake may carry the owner either as
/// a JSON string or as a JSON number. Both decode to the same canonical
/// string so table lookups never depend on the wire encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(String);

impl OwnerId {
    /// Parse an owner id from free text, rejecting blank input
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Borrow the canonical form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Broker topic carrying this owner's alerts
    pub fn topic(&self) -> String {
        format!("{}{}", crate::alerting::TOPIC_PREFIX, self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<uuid::Uuid> for OwnerId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

impl Serialize for OwnerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

struct OwnerIdVisitor;

impl<'de> Visitor<'de> for OwnerIdVisitor {
    type Value = OwnerId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-empty string or an integral number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<OwnerId, E> {
        OwnerId::parse(v).ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<OwnerId, E> {
        Ok(OwnerId(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<OwnerId, E> {
        Ok(OwnerId(v.to_string()))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<OwnerId, E> {
        // 2^53: beyond this an f64 no longer identifies a single integer
        const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
        if v.is_finite() && v.fract() == 0.0 && v.abs() <= MAX_EXACT {
            Ok(OwnerId((v as i64).to_string()))
        } else {
            Err(E::invalid_value(de::Unexpected::Float(v), &self))
        }
    }
}

impl<'de> Deserialize<'de> for OwnerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(OwnerIdVisitor)
    }
}
