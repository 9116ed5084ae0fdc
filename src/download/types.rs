use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};

/// eD2k file hash identifying content independent of name or location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub [u8; 16]);

impl ContentId {
    pub const URN_PREFIX: &'static str = "urn:ed2k:";

    pub fn to_hex_lower(self) -> String {
        to_hex_lower(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        parse_hex_16(s).map(Self)
    }

    /// Accepts `urn:ed2k:<hex>`, `urn:ed2khash:<hex>` or bare hex.
    pub fn from_urn(s: &str) -> Option<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let hex = lower
            .strip_prefix(Self::URN_PREFIX)
            .or_else(|| lower.strip_prefix("urn:ed2khash:"))
            .unwrap_or(&lower);
        Self::from_hex(hex)
    }

    pub fn to_urn(self) -> String {
        format!("{}{}", Self::URN_PREFIX, self.to_hex_lower())
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_urn())
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex_lower())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid content id hex: {s}")))
    }
}

/// Identifier of the search/request that produced a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryGuid(pub [u8; 16]);

impl QueryGuid {
    pub fn random() -> std::io::Result<Self> {
        let mut b = [0u8; 16];
        getrandom::getrandom(&mut b)
            .map_err(|e| std::io::Error::other(format!("failed to generate query guid: {e}")))?;
        Ok(Self(b))
    }

    pub fn to_hex_lower(self) -> String {
        to_hex_lower(&self.0)
    }
}

impl std::fmt::Display for QueryGuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex_lower())
    }
}

/// Process-unique handle for a downloader, assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DownloaderId(pub u64);

impl DownloaderId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for DownloaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dl-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadType {
    Direct,
    Magnet,
    InNetwork,
    Resume,
}

fn to_hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut s, "{b:02x}");
    }
    s
}

fn parse_hex_16(s: &str) -> Option<[u8; 16]> {
    let s = s.trim();
    if s.len() != 32 || !s.is_ascii() {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}
