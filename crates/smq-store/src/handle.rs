use crate::layout::Location;

/// Stable, copyable, non-owning reference to a record.
///
/// A handle carries only the record's [`Location`]; it stays valid across
/// remapping and process restarts. Dereferencing goes through the store,
/// which re-validates the record's signature — a handle whose record was
/// freed yields [`StoreError::StaleHandle`](crate::StoreError::StaleHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle {
    location: Location,
}

impl Handle {
    pub const NULL: Self = Self { location: Location::NULL };

    pub(crate) fn new(location: Location) -> Self {
        Self { location }
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn is_null(&self) -> bool {
        self.location.is_null()
    }
}
