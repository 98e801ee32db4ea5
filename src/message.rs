use std::sync::Mutex;

use bytes::Bytes;

/// State of the serialized byte blob backing an outbound message.
///
/// Application-level encoding happens outside this crate and may be asynchronous, so
///  a segmenter has to cope with a message whose bytes are not available yet, and
///  with one whose serialization failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SerializationState {
    Serializing,
    Complete,
    Invalid,
}

enum Inner {
    Serializing,
    Complete(Bytes),
    Invalid,
}

/// A serialized message, shared between all segmenters created for its fan-out
///  targets. The transport only ever sees the byte blob plus its size - what the
///  bytes mean is the caller's business.
pub struct SerializedMessage {
    inner: Mutex<Inner>,
}

impl SerializedMessage {
    /// A message whose bytes are available right away - the common case.
    pub fn from_bytes(bytes: Bytes) -> SerializedMessage {
        SerializedMessage { inner: Mutex::new(Inner::Complete(bytes)) }
    }

    /// A message whose serialization is still in progress.
    pub fn pending() -> SerializedMessage {
        SerializedMessage { inner: Mutex::new(Inner::Serializing) }
    }

    pub fn complete(&self, bytes: Bytes) {
        *self.inner.lock().unwrap() = Inner::Complete(bytes);
    }

    pub fn fail(&self) {
        *self.inner.lock().unwrap() = Inner::Invalid;
    }

    pub fn state(&self) -> SerializationState {
        match &*self.inner.lock().unwrap() {
            Inner::Serializing => SerializationState::Serializing,
            Inner::Complete(_) => SerializationState::Complete,
            Inner::Invalid => SerializationState::Invalid,
        }
    }

    /// The serialized bytes, if serialization is complete. `Bytes` clones are cheap
    ///  reference bumps, so segmenters can slice the payload without copying.
    pub fn bytes(&self) -> Option<Bytes> {
        match &*self.inner.lock().unwrap() {
            Inner::Complete(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn size(&self) -> Option<usize> {
        match &*self.inner.lock().unwrap() {
            Inner::Complete(bytes) => Some(bytes.len()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_is_complete() {
        let msg = SerializedMessage::from_bytes(Bytes::from_static(b"abc"));
        assert_eq!(msg.state(), SerializationState::Complete);
        assert_eq!(msg.bytes(), Some(Bytes::from_static(b"abc")));
        assert_eq!(msg.size(), Some(3));
    }

    #[test]
    fn test_pending_then_complete() {
        let msg = SerializedMessage::pending();
        assert_eq!(msg.state(), SerializationState::Serializing);
        assert_eq!(msg.bytes(), None);
        assert_eq!(msg.size(), None);

        msg.complete(Bytes::from_static(b"xy"));
        assert_eq!(msg.state(), SerializationState::Complete);
        assert_eq!(msg.size(), Some(2));
    }

    #[test]
    fn test_pending_then_fail() {
        let msg = SerializedMessage::pending();
        msg.fail();
        assert_eq!(msg.state(), SerializationState::Invalid);
        assert_eq!(msg.bytes(), None);
    }
}
