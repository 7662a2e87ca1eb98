//! An in-memory credential cell

use std::sync::Arc;

use crate::Credential;

/// An in-memory holder for at most one credential
///
/// The store performs no validation and no I/O. It is owned by the
/// [`RefreshCoordinator`][crate::RefreshCoordinator], which is the only
/// component that writes to it.
#[derive(Default, Debug)]
pub struct TokenStore {
    credential: Option<Arc<Credential>>,
}

impl TokenStore {
    /// Constructs a new, empty store
    pub const fn new() -> Self {
        Self { credential: None }
    }

    /// Gets a snapshot of the cached credential
    pub fn get(&self) -> Option<Arc<Credential>> {
        self.credential.clone()
    }

    /// Replaces the cached credential
    pub fn set(&mut self, credential: Arc<Credential>) {
        self.credential = Some(credential);
    }

    /// Removes the cached credential
    pub fn clear(&mut self) {
        self.credential = None;
    }
}

#[cfg(test)]
mod tests {
    use keyward_clock::UnixMillis;

    use super::*;
    use crate::AccessToken;

    #[test]
    fn set_replaces_and_clear_removes() {
        let mut store = TokenStore::new();
        assert!(store.get().is_none());

        let first = Arc::new(Credential::new(AccessToken::from_static("one"), UnixMillis(1)));
        let second = Arc::new(Credential::new(AccessToken::from_static("two"), UnixMillis(2)));

        store.set(first.clone());
        let snapshot = store.get();
        store.set(second.clone());

        assert_eq!(snapshot, Some(first));
        assert_eq!(store.get(), Some(second));

        store.clear();
        assert!(store.get().is_none());
    }
}
