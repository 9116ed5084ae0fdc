use crate::download::{source::RemoteSource, types::ContentId};
use std::net::SocketAddr;

/// Parsed magnet metadata. Only the content id is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetOptions {
    pub content_id: ContentId,
    /// `xl`, exact length.
    pub size: Option<u64>,
    /// `dn`, display name.
    pub display_name: Option<String>,
    /// `xs`, peers to try first.
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug)]
pub enum MagnetError {
    NotAMagnet,
    MissingContentId,
    InvalidContentId(String),
    InvalidLength(String),
    InvalidPeer(String),
    InvalidEncoding(String),
}

impl std::fmt::Display for MagnetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAMagnet => write!(f, "not a magnet uri"),
            Self::MissingContentId => write!(f, "magnet has no urn:ed2k exact topic"),
            Self::InvalidContentId(v) => write!(f, "invalid magnet exact topic '{v}'"),
            Self::InvalidLength(v) => write!(f, "invalid magnet exact length '{v}'"),
            Self::InvalidPeer(v) => write!(f, "invalid magnet peer '{v}'"),
            Self::InvalidEncoding(v) => write!(f, "invalid percent-encoding in '{v}'"),
        }
    }
}

impl std::error::Error for MagnetError {}

impl MagnetOptions {
    pub fn new(content_id: ContentId) -> Self {
        Self {
            content_id,
            size: None,
            display_name: None,
            peers: Vec::new(),
        }
    }

    /// Parse `magnet:?xt=urn:ed2k:<hex>&xl=<size>&dn=<name>&xs=<ip:port>`.
    ///
    /// Unknown parameters and exact topics of other hash kinds are ignored.
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let query = uri
            .trim()
            .strip_prefix("magnet:?")
            .ok_or(MagnetError::NotAMagnet)?;

        let mut content_id = None;
        let mut size = None;
        let mut display_name = None;
        let mut peers = Vec::new();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(&raw.replace('+', " "))
                .map_err(|_| MagnetError::InvalidEncoding(raw.to_string()))?
                .into_owned();
            match key {
                "xt" => {
                    let lower = value.to_ascii_lowercase();
                    if lower.starts_with("urn:ed2k:") || lower.starts_with("urn:ed2khash:") {
                        let id = ContentId::from_urn(&lower)
                            .ok_or_else(|| MagnetError::InvalidContentId(value.clone()))?;
                        content_id.get_or_insert(id);
                    }
                }
                "xl" => {
                    let n = value
                        .parse::<u64>()
                        .map_err(|_| MagnetError::InvalidLength(value.clone()))?;
                    size = Some(n);
                }
                "dn" => display_name = Some(value),
                "xs" => {
                    let addr = value
                        .parse::<SocketAddr>()
                        .map_err(|_| MagnetError::InvalidPeer(value.clone()))?;
                    if !peers.contains(&addr) {
                        peers.push(addr);
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            content_id: content_id.ok_or(MagnetError::MissingContentId)?,
            size,
            display_name,
            peers,
        })
    }

    /// Source descriptors for the `xs` peers. Empty while the size is unknown, because a
    /// descriptor must declare one.
    pub fn sources(&self) -> Vec<RemoteSource> {
        let Some(size) = self.size else {
            return Vec::new();
        };
        self.peers
            .iter()
            .map(|addr| RemoteSource::new(*addr, 0, size, self.content_id))
            .collect()
    }

    pub fn to_uri(&self) -> String {
        let mut out = format!("magnet:?xt={}", self.content_id.to_urn());
        if let Some(size) = self.size {
            out.push_str(&format!("&xl={size}"));
        }
        if let Some(name) = &self.display_name {
            out.push_str(&format!("&dn={}", urlencoding::encode(name)));
        }
        for peer in &self.peers {
            out.push_str(&format!("&xs={peer}"));
        }
        out
    }
}
