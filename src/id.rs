//! Endpoint and entity identifiers.

use std::fmt;

use uuid::Uuid;

/// Uniquely identifies an endpoint across the overlay.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The invalid ("nil") endpoint id.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifies a publisher, store instance, or similar object hosted by an
/// endpoint. The endpoint refers to itself with `object == 0`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId {
    pub endpoint: EndpointId,
    pub object: u64,
}

impl EntityId {
    pub fn new(endpoint: EndpointId, object: u64) -> Self {
        Self { endpoint, object }
    }

    /// The id an endpoint uses when acting on its own behalf.
    pub fn endpoint_root(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            object: 0,
        }
    }

    pub fn nil() -> Self {
        Self {
            endpoint: EndpointId::nil(),
            object: 0,
        }
    }

    /// An entity id is "none" iff its endpoint component is invalid.
    pub fn is_nil(&self) -> bool {
        self.endpoint.is_nil()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}, {})", self.endpoint, self.object)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "none")
        } else {
            write!(f, "({}, {})", self.endpoint, self.object)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_entity_tracks_endpoint_component() {
        assert!(EntityId::nil().is_nil());
        assert!(!EntityId::endpoint_root(EndpointId::random()).is_nil());
        // A nil endpoint with a nonzero object is still "none".
        assert!(EntityId::new(EndpointId::nil(), 7).is_nil());
    }

    #[test]
    fn ordering_is_lexicographic_on_the_pair() {
        let a = EndpointId::from_bytes([1u8; 16]);
        let b = EndpointId::from_bytes([2u8; 16]);
        assert!(EntityId::new(a, 9) < EntityId::new(b, 0));
        assert!(EntityId::new(a, 1) < EntityId::new(a, 2));
    }
}
