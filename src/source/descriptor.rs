use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Segmented adaptive stream fetched over the network.
    RemoteStream,
    /// Recording held in the local object store.
    LocalHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("no source locator provided")]
    Empty,
}

/// What a tile should render. Immutable once handed to a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceDescriptor {
    key: String,
    kind: SourceKind,
}

impl SourceDescriptor {
    pub fn local(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: SourceKind::LocalHandle,
        }
    }

    pub fn remote(locator: impl Into<String>) -> Self {
        Self {
            key: locator.into(),
            kind: SourceKind::RemoteStream,
        }
    }

    /// Numeric locators are local-store keys; anything else is a stream URL.
    pub fn from_locator(locator: &str) -> Result<Self, DescriptorError> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if locator.chars().all(|c| c.is_ascii_digit()) {
            Ok(Self::local(locator))
        } else {
            Ok(Self::remote(locator))
        }
    }

    /// Pick the first non-empty candidate (live stream, adaptive, recorded file).
    pub fn from_candidates<'a>(
        candidates: impl IntoIterator<Item = Option<&'a str>>,
    ) -> Result<Self, DescriptorError> {
        candidates
            .into_iter()
            .flatten()
            .find(|c| !c.trim().is_empty())
            .ok_or(DescriptorError::Empty)
            .and_then(Self::from_locator)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}
