//! The complete migration bookkeeping state.

use super::functions::MigrationFunctions;
use super::ref_log::{RefLog, VersionId};
use super::VersionError;
use crate::catalog::Catalog;
use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Catalog, ref log, and sync-function registry, persisted as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Every physical table.
    pub catalog: Catalog,
    /// Version graph and table bindings.
    pub ref_log: RefLog,
    /// Installed sync functions and triggers.
    pub functions: MigrationFunctions,
}

impl State {
    /// Create a state from a catalog and ref log.
    pub fn new(catalog: Catalog, ref_log: RefLog) -> Self {
        Self {
            catalog,
            ref_log,
            functions: MigrationFunctions::new(),
        }
    }

    /// Fork a logical table into a version-private ghost table.
    ///
    /// Returns the ghost table id. Forking a table that is already private
    /// to the version returns its current id.
    pub fn fork_table(&mut self, version: &VersionId, name: &str) -> Result<String, VersionError> {
        let parent = self.parent_of(version)?;
        let current = self.ref_log.table_ref(version, name).ok_or_else(|| {
            VersionError::UnknownTable {
                version: version.clone(),
                name: name.to_string(),
            }
        })?;
        if !current.versions.contains(&parent) {
            return Ok(current.table_id.clone());
        }

        let table_id = self.generate_table_id(version, name);
        self.fork_table_as(version, name, &table_id)?;
        Ok(table_id)
    }

    /// Fork a logical table into a ghost table with an explicit id.
    ///
    /// Tables of the version that still reference the original table are
    /// forked as well, so that every foreign key of a ghost table points at
    /// the version's own tables.
    pub fn fork_table_as(
        &mut self,
        version: &VersionId,
        name: &str,
        table_id: &str,
    ) -> Result<(), VersionError> {
        let parent = self.parent_of(version)?;
        let current = self.ref_log.table_ref(version, name).ok_or_else(|| {
            VersionError::UnknownTable {
                version: version.clone(),
                name: name.to_string(),
            }
        })?;
        if !current.versions.contains(&parent) {
            return Err(VersionError::AlreadyForked {
                version: version.clone(),
                name: name.to_string(),
            });
        }
        if self.catalog.contains(table_id) {
            return Err(VersionError::DuplicateTableId(table_id.to_string()));
        }

        let original_id = current.table_id.clone();
        let ghost = self.catalog.require_table(&original_id)?.forked(table_id);
        self.catalog.add_table(ghost);
        self.ref_log.replace_table(version, name, table_id)?;

        let dependents: Vec<String> = self
            .ref_log
            .table_refs()
            .iter()
            .filter(|r| r.versions.contains(version) && r.versions.contains(&parent))
            .filter(|r| {
                self.catalog.table(&r.table_id).is_some_and(|t| {
                    t.foreign_keys.iter().any(|fk| fk.referred_table == original_id)
                })
            })
            .map(|r| r.name.clone())
            .collect();

        for dependent in dependents {
            self.fork_table(version, &dependent)?;
        }

        self.relink_foreign_keys(version);
        Ok(())
    }

    fn parent_of(&self, version: &VersionId) -> Result<VersionId, VersionError> {
        self.ref_log
            .version(version)
            .ok_or_else(|| VersionError::UnknownVersion(version.clone()))?
            .parent
            .clone()
            .ok_or_else(|| VersionError::NoParent(version.clone()))
    }

    /// Point the foreign keys of version-private tables at the tables the
    /// version binds the referenced names to.
    fn relink_foreign_keys(&mut self, version: &VersionId) {
        let parent = self
            .ref_log
            .version(version)
            .and_then(|v| v.parent.clone());

        let private: Vec<String> = self
            .ref_log
            .table_refs()
            .iter()
            .filter(|r| r.versions.contains(version))
            .filter(|r| parent.as_ref().map_or(true, |p| !r.versions.contains(p)))
            .map(|r| r.table_id.clone())
            .collect();

        for table_id in private {
            let Some(table) = self.catalog.table(&table_id) else {
                continue;
            };
            let relinked: Vec<Option<String>> = table
                .foreign_keys
                .iter()
                .map(|fk| {
                    let referred = self.ref_log.table_ref_by_id(&fk.referred_table)?;
                    let current = self.ref_log.table_ref(version, &referred.name)?;
                    (current.table_id != fk.referred_table).then(|| current.table_id.clone())
                })
                .collect();

            if let Some(table) = self.catalog.table_mut(&table_id) {
                for (fk, target) in table.foreign_keys.iter_mut().zip(relinked) {
                    if let Some(target) = target {
                        fk.referred_table = target;
                    }
                }
            }
        }
    }

    fn generate_table_id(&self, version: &VersionId, name: &str) -> String {
        let base: String = name.chars().take(40).collect();
        let mut attempt = 0u32;
        loop {
            let digest = blake3::hash(format!("{version}/{name}/{attempt}").as_bytes());
            let id = format!("{base}_{}", hex::encode(&digest.as_bytes()[..4]));
            if !self.catalog.contains(&id) && self.ref_log.table_ref_by_id(&id).is_none() {
                return id;
            }
            attempt += 1;
        }
    }

    /// Serialize the state to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize state from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}
