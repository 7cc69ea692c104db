use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::traits::RawMedia;

struct HandleInner {
    id: u64,
    key: String,
    locator: String,
    content_type: String,
    payload: Mutex<Option<Bytes>>,
}

/// Playable reference to locally stored media.
///
/// Clones share the same underlying buffer. Revoking releases the buffer for
/// every clone; an element holding a revoked handle can no longer play it.
#[derive(Clone)]
pub struct MediaHandle {
    inner: Arc<HandleInner>,
}

impl MediaHandle {
    pub fn from_raw(id: u64, key: &str, raw: RawMedia) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                key: key.to_string(),
                locator: format!("blob:tile-media/{}", id),
                content_type: raw.content_type,
                payload: Mutex::new(Some(raw.bytes)),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Locator the element is pointed at.
    pub fn locator(&self) -> &str {
        &self.inner.locator
    }

    pub fn content_type(&self) -> &str {
        &self.inner.content_type
    }

    pub fn payload(&self) -> Option<Bytes> {
        self.inner.payload.lock().clone()
    }

    /// Drop the underlying buffer. Returns `false` if it was already revoked.
    pub fn revoke(&self) -> bool {
        self.inner.payload.lock().take().is_some()
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.payload.lock().is_none()
    }

    pub fn ptr_eq(&self, other: &MediaHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
