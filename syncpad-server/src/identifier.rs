//! Document identifiers.

use std::str::FromStr;

/// An opaque, printable-ASCII, URL-safe document identifier.
///
/// Fixed-capacity so that it is `Copy`-free but cheap to clone and hash;
/// the capacity doubles as the wire-level length limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocId([u8; Self::MAX_LEN], u8);

impl DocId {
    /// Maximum length of a document id, in bytes.
    pub const MAX_LEN: usize = 64;

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
    }
}

impl FromStr for DocId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("document id is empty");
        }
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("document id is too long");
        }
        if !s.chars().all(Self::valid_char) {
            anyhow::bail!("document id contains invalid characters");
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes, s.len() as u8))
    }
}

impl AsRef<str> for DocId {
    fn as_ref(&self) -> &str {
        std::str::from_utf8(&self.0[..self.1 as usize]).expect("DocId contains invalid UTF-8")
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl serde::Serialize for DocId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> serde::Deserialize<'de> for DocId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}
