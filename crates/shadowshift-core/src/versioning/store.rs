//! Durable storage for the migration state.

use super::state::State;
use crate::error::Error;

/// Sled-backed store holding the latest persisted [`State`].
///
/// Each save replaces the previous snapshot under a single key, so a
/// reader always observes either the old or the new state.
pub struct StateStore {
    tree: sled::Tree,
}

impl StateStore {
    /// Tree name for migration state.
    pub const TREE_NAME: &'static str = "shadowshift:state";

    const CURRENT_KEY: &'static [u8] = b"state:current";

    /// Open or create the state store.
    pub fn open(db: &sled::Db) -> Result<Self, Error> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Open a store in its own database at `path`.
    pub fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let db = sled::open(path)?;
        Self::open(&db)
    }

    /// Save the state, replacing the previous snapshot.
    pub fn save(&self, state: &State) -> Result<(), Error> {
        let value = state.to_bytes()?;
        self.tree.insert(Self::CURRENT_KEY, value)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Load the most recently saved state.
    pub fn load(&self) -> Result<Option<State>, Error> {
        match self.tree.get(Self::CURRENT_KEY)? {
            Some(bytes) => Ok(Some(State::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete the saved state.
    pub fn clear(&self) -> Result<(), Error> {
        self.tree.remove(Self::CURRENT_KEY)?;
        Ok(())
    }
}
