//! Resource registry: the ordered file lists of one storage partition

use crate::resource::{FileName, FileResource, StreamKind};
use crate::{FoldError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// `(storage group, time partition)` pair identifying a partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub storage_group: String,
    pub time_partition: i64,
}

impl PartitionId {
    pub fn new(storage_group: impl Into<String>, time_partition: i64) -> Self {
        Self {
            storage_group: storage_group.into(),
            time_partition,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.storage_group, self.time_partition)
    }
}

/// Point-in-time copy of both lists, each in `FileName` order
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub sequence: Vec<Arc<FileResource>>,
    pub unsequence: Vec<Arc<FileResource>>,
}

impl RegistrySnapshot {
    pub fn list(&self, stream: StreamKind) -> &[Arc<FileResource>] {
        match stream {
            StreamKind::Sequence => &self.sequence,
            StreamKind::Unsequence => &self.unsequence,
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len() + self.unsequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty() && self.unsequence.is_empty()
    }
}

/// A retired source still pinned by readers, with the journal that must
/// outlive it so a restart can finish the deletion
#[derive(Debug, Clone)]
pub struct PendingDeletion {
    pub resource: Arc<FileResource>,
    pub journal: PathBuf,
}

#[derive(Debug, Default)]
struct Lists {
    sequence: Vec<Arc<FileResource>>,
    unsequence: Vec<Arc<FileResource>>,
    pending_deletion: Vec<PendingDeletion>,
}

impl Lists {
    fn list_mut(&mut self, stream: StreamKind) -> &mut Vec<Arc<FileResource>> {
        match stream {
            StreamKind::Sequence => &mut self.sequence,
            StreamKind::Unsequence => &mut self.unsequence,
        }
    }

    fn insert_sorted(&mut self, resource: Arc<FileResource>) -> Result<()> {
        let name = resource.name();
        let list = self.list_mut(resource.stream());
        let pos = list.partition_point(|r| r.name() < name);
        if list.get(pos).is_some_and(|r| r.name() == name) {
            return Err(FoldError::Internal(format!(
                "file {} is already registered",
                name
            )));
        }
        list.insert(pos, resource);
        Ok(())
    }

    fn position(&self, resource: &Arc<FileResource>) -> Option<usize> {
        let list = match resource.stream() {
            StreamKind::Sequence => &self.sequence,
            StreamKind::Unsequence => &self.unsequence,
        };
        list.iter().position(|r| Arc::ptr_eq(r, resource))
    }
}

/// Owns the sequence and unsequence lists of one partition.
///
/// All mutations happen under one write lock, so a reader taking a
/// [`RegistrySnapshot`] sees either the state before a swap or after it.
#[derive(Debug)]
pub struct ResourceRegistry {
    id: PartitionId,
    lists: RwLock<Lists>,
}

impl ResourceRegistry {
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            lists: RwLock::new(Lists::default()),
        }
    }

    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    /// Register a file in its stream's list, keeping `FileName` order
    pub fn add(&self, resource: Arc<FileResource>) -> Result<()> {
        self.lists.write().insert_sorted(resource)
    }

    /// Unregister a file; returns whether it was present
    pub fn remove(&self, resource: &Arc<FileResource>) -> bool {
        let mut lists = self.lists.write();
        match lists.position(resource) {
            Some(pos) => {
                lists.list_mut(resource.stream()).remove(pos);
                true
            }
            None => false,
        }
    }

    /// Swap `sources` for `targets` in one step.
    ///
    /// Targets are named after the sources they replace, so sorted insertion
    /// puts them where the sources were.
    pub fn replace(
        &self,
        sources: &[Arc<FileResource>],
        targets: &[Arc<FileResource>],
    ) -> Result<()> {
        let mut lists = self.lists.write();
        for source in sources {
            if lists.position(source).is_none() {
                return Err(FoldError::Internal(format!(
                    "compaction source {} is not registered in {}",
                    source.name(),
                    self.id
                )));
            }
        }
        for source in sources {
            if let Some(pos) = lists.position(source) {
                lists.list_mut(source.stream()).remove(pos);
            }
        }
        for target in targets {
            lists.insert_sorted(Arc::clone(target))?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let lists = self.lists.read();
        RegistrySnapshot {
            sequence: lists.sequence.clone(),
            unsequence: lists.unsequence.clone(),
        }
    }

    pub fn list(&self, stream: StreamKind) -> Vec<Arc<FileResource>> {
        let lists = self.lists.read();
        match stream {
            StreamKind::Sequence => lists.sequence.clone(),
            StreamKind::Unsequence => lists.unsequence.clone(),
        }
    }

    pub fn len(&self, stream: StreamKind) -> usize {
        let lists = self.lists.read();
        match stream {
            StreamKind::Sequence => lists.sequence.len(),
            StreamKind::Unsequence => lists.unsequence.len(),
        }
    }

    pub fn get(&self, stream: StreamKind, name: FileName) -> Option<Arc<FileResource>> {
        self.list(stream).into_iter().find(|r| r.name() == name)
    }

    /// Total data bytes of one stream
    pub fn total_bytes(&self, stream: StreamKind) -> u64 {
        self.list(stream).iter().map(|r| r.file_size()).sum()
    }

    /// Keep a retired file that readers still pin until a later purge
    pub fn park_for_deletion(&self, resource: Arc<FileResource>, journal: PathBuf) {
        self.lists
            .write()
            .pending_deletion
            .push(PendingDeletion { resource, journal });
    }

    pub fn pending_deletions(&self) -> Vec<PendingDeletion> {
        self.lists.read().pending_deletion.clone()
    }

    /// Drop `resource` from the pending-deletion list. Returns its journal
    /// once no other pending file refers to it.
    pub fn forget_pending(&self, resource: &Arc<FileResource>) -> Option<PathBuf> {
        let mut lists = self.lists.write();
        let pos = lists
            .pending_deletion
            .iter()
            .position(|p| Arc::ptr_eq(&p.resource, resource))?;
        let entry = lists.pending_deletion.remove(pos);
        let shared = lists
            .pending_deletion
            .iter()
            .any(|p| p.journal == entry.journal);
        (!shared).then_some(entry.journal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn resource(dir: &Path, name: FileName, stream: StreamKind) -> Arc<FileResource> {
        Arc::new(FileResource::new(dir.join(name.file_name()), stream).unwrap())
    }

    #[test]
    fn test_add_keeps_name_order() {
        let dir = TempDir::new().unwrap();
        let registry = ResourceRegistry::new(PartitionId::new("root.sg", 0));
        for version in [3, 1, 2] {
            registry
                .add(resource(dir.path(), FileName::new(100, version), StreamKind::Sequence))
                .unwrap();
        }
        registry
            .add(resource(dir.path(), FileName::new(50, 9), StreamKind::Unsequence))
            .unwrap();

        let versions: Vec<u64> = registry
            .list(StreamKind::Sequence)
            .iter()
            .map(|r| r.name().version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(registry.len(StreamKind::Unsequence), 1);

        let dup = resource(dir.path(), FileName::new(100, 2), StreamKind::Sequence);
        assert!(registry.add(dup).is_err());
    }

    #[test]
    fn test_replace_swaps_in_place() {
        let dir = TempDir::new().unwrap();
        let registry = ResourceRegistry::new(PartitionId::new("root.sg", 0));
        let files: Vec<_> = (1..=4)
            .map(|v| resource(dir.path(), FileName::new(100, v), StreamKind::Sequence))
            .collect();
        for f in &files {
            registry.add(Arc::clone(f)).unwrap();
        }

        let target = resource(
            dir.path(),
            FileName::new(100, 2).with_inner(1),
            StreamKind::Sequence,
        );
        registry
            .replace(&files[1..3], &[Arc::clone(&target)])
            .unwrap();

        let names: Vec<FileName> = registry
            .list(StreamKind::Sequence)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(
            names,
            vec![files[0].name(), target.name(), files[3].name()]
        );

        // sources are gone, so a second swap is refused without side effects
        let other = resource(dir.path(), FileName::new(100, 3).with_inner(1), StreamKind::Sequence);
        assert!(registry.replace(&files[1..3], &[other]).is_err());
        assert_eq!(registry.len(StreamKind::Sequence), 3);
    }

    #[test]
    fn test_pending_deletions_share_journal() {
        let dir = TempDir::new().unwrap();
        let registry = ResourceRegistry::new(PartitionId::new("root.sg", 7));
        let a = resource(dir.path(), FileName::new(1, 1), StreamKind::Unsequence);
        let b = resource(dir.path(), FileName::new(1, 2), StreamKind::Unsequence);
        let journal = dir.path().join("1-1-1-0.tsfile.compaction");
        registry.park_for_deletion(Arc::clone(&a), journal.clone());
        registry.park_for_deletion(Arc::clone(&b), journal.clone());
        assert_eq!(registry.pending_deletions().len(), 2);

        assert_eq!(registry.forget_pending(&a), None);
        assert_eq!(registry.forget_pending(&a), None);
        assert_eq!(registry.forget_pending(&b), Some(journal));
        assert!(registry.pending_deletions().is_empty());
        assert_eq!(registry.id().to_string(), "root.sg/7");
    }
}
