//! Version graph and logical-to-physical table bindings.

use super::VersionError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Opaque identifier of a schema version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId(String);

impl VersionId {
    /// Create a version id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A node in the schema history graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Version id.
    pub id: VersionId,
    /// Parent version, if any.
    pub parent: Option<VersionId>,
}

/// A logical table name bound to one physical table within some versions.
///
/// Shared by two or more versions, the table is untouched by the
/// migrations between them; owned by one version, it is that version's
/// ghost table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    /// Logical table name.
    pub name: String,
    /// Physical table id.
    pub table_id: String,
    /// Versions in which the name resolves to this table.
    pub versions: BTreeSet<VersionId>,
}

impl TableRef {
    /// Check if exactly one version owns this table.
    pub fn is_exclusive_to(&self, version: &VersionId) -> bool {
        self.versions.len() == 1 && self.versions.contains(version)
    }
}

/// The version graph together with every table binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefLog {
    versions: BTreeMap<VersionId, Version>,
    table_refs: Vec<TableRef>,
}

impl RefLog {
    /// Create an empty ref log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a version with no parent.
    pub fn add_root_version(&mut self, id: VersionId) -> Result<(), VersionError> {
        if self.versions.contains_key(&id) {
            return Err(VersionError::DuplicateVersion(id));
        }
        self.versions.insert(id.clone(), Version { id, parent: None });
        Ok(())
    }

    /// Add a child version sharing every table of its parent.
    pub fn fork_version(&mut self, parent: &VersionId, child: VersionId) -> Result<(), VersionError> {
        self.require_version(parent)?;
        if self.versions.contains_key(&child) {
            return Err(VersionError::DuplicateVersion(child));
        }

        for table_ref in &mut self.table_refs {
            if table_ref.versions.contains(parent) {
                table_ref.versions.insert(child.clone());
            }
        }
        self.versions.insert(
            child.clone(),
            Version {
                id: child,
                parent: Some(parent.clone()),
            },
        );
        Ok(())
    }

    /// Bind a new logical table in a version.
    pub fn add_table(
        &mut self,
        version: &VersionId,
        name: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Result<(), VersionError> {
        self.require_version(version)?;
        let name = name.into();
        if self.table_ref(version, &name).is_some() {
            return Err(VersionError::DuplicateTable {
                version: version.clone(),
                name,
            });
        }
        self.table_refs.push(TableRef {
            name,
            table_id: table_id.into(),
            versions: BTreeSet::from([version.clone()]),
        });
        Ok(())
    }

    /// Rebind a logical table in a version to a new physical table.
    ///
    /// Returns the id of the table the name was bound to before.
    pub fn replace_table(
        &mut self,
        version: &VersionId,
        name: &str,
        new_table_id: impl Into<String>,
    ) -> Result<String, VersionError> {
        let position = self
            .table_refs
            .iter()
            .position(|r| r.name == name && r.versions.contains(version))
            .ok_or_else(|| VersionError::UnknownTable {
                version: version.clone(),
                name: name.to_string(),
            })?;

        let previous = &mut self.table_refs[position];
        previous.versions.remove(version);
        let previous_id = previous.table_id.clone();
        if previous.versions.is_empty() {
            self.table_refs.remove(position);
        }

        self.table_refs.push(TableRef {
            name: name.to_string(),
            table_id: new_table_id.into(),
            versions: BTreeSet::from([version.clone()]),
        });
        Ok(previous_id)
    }

    /// All version ids.
    pub fn versions(&self) -> BTreeSet<VersionId> {
        self.versions.keys().cloned().collect()
    }

    /// Look up a version.
    pub fn version(&self, id: &VersionId) -> Option<&Version> {
        self.versions.get(id)
    }

    fn require_version(&self, id: &VersionId) -> Result<&Version, VersionError> {
        self.versions
            .get(id)
            .ok_or_else(|| VersionError::UnknownVersion(id.clone()))
    }

    /// All table bindings.
    pub fn table_refs(&self) -> &[TableRef] {
        &self.table_refs
    }

    /// The binding of a logical name in a version.
    pub fn table_ref(&self, version: &VersionId, name: &str) -> Option<&TableRef> {
        self.table_refs
            .iter()
            .find(|r| r.name == name && r.versions.contains(version))
    }

    /// The binding of a physical table.
    pub fn table_ref_by_id(&self, table_id: &str) -> Option<&TableRef> {
        self.table_refs.iter().find(|r| r.table_id == table_id)
    }

    /// Physical table ids visible in a version.
    pub fn table_ids(&self, version: &VersionId) -> BTreeSet<String> {
        self.table_refs
            .iter()
            .filter(|r| r.versions.contains(version))
            .map(|r| r.table_id.clone())
            .collect()
    }

    /// Tables visible in `to` that are not visible in `from`.
    pub fn ghost_table_ids(&self, from: &VersionId, to: &VersionId) -> BTreeSet<String> {
        self.table_refs
            .iter()
            .filter(|r| r.versions.contains(to) && !r.versions.contains(from))
            .map(|r| r.table_id.clone())
            .collect()
    }

    /// Pairs `(source id, ghost id)` of tables that carry the same logical
    /// name in `from` and `to` but are bound to different physical tables.
    pub fn ghost_table_mapping(&self, from: &VersionId, to: &VersionId) -> Vec<(String, String)> {
        let mut mapping: Vec<(String, String, String)> = self
            .table_refs
            .iter()
            .filter(|r| r.versions.contains(to) && !r.versions.contains(from))
            .filter_map(|ghost| {
                self.table_ref(from, &ghost.name)
                    .map(|source| (ghost.name.clone(), source.table_id.clone(), ghost.table_id.clone()))
            })
            .collect();
        mapping.sort();
        mapping
            .into_iter()
            .map(|(_, source, ghost)| (source, ghost))
            .collect()
    }

    /// Forget a physical table entirely.
    pub fn drop_table(&mut self, table_id: &str) {
        self.table_refs.retain(|r| r.table_id != table_id);
    }

    /// Detach a version from every table binding, keeping the version node.
    pub fn retire_version(&mut self, version: &VersionId) {
        for table_ref in &mut self.table_refs {
            table_ref.versions.remove(version);
        }
        self.table_refs.retain(|r| !r.versions.is_empty());
    }

    /// Detach a version and remove it from the graph.
    ///
    /// Children of the removed version are re-parented onto its parent.
    pub fn remove_version(&mut self, version: &VersionId) {
        self.retire_version(version);
        if let Some(removed) = self.versions.remove(version) {
            for child in self.versions.values_mut() {
                if child.parent.as_ref() == Some(version) {
                    child.parent = removed.parent.clone();
                }
            }
        }
    }
}
