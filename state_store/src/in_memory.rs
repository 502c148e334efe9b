use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use data_model::{AllocationState, ResourceVersion, Versioned};

use crate::{driver::Error, StateBackend};

/// Keeps AllocationState objects in process memory. Used by tests and by
/// agents that run without a persistent state directory.
#[derive(Default)]
pub struct InMemoryBackend {
    records: DashMap<String, Versioned<AllocationState>>,
    writes: AtomicU64,
    rejected: AtomicU64,
    /// Pending simulated foreign writes, see [`InMemoryBackend::inject_conflicts`].
    conflicts: AtomicU32,
    yield_after_read: AtomicBool,
}

impl InMemoryBackend {
    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of writes refused because the expected version was stale.
    pub fn rejected_write_count(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Hands control back to the scheduler after every read, so other
    /// writers can get in between a read and the write that follows it.
    pub fn yield_after_reads(&self) {
        self.yield_after_read.store(true, Ordering::SeqCst);
    }

    /// Makes the next `n` writes observe a version bumped by another writer.
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StateBackend for InMemoryBackend {
    async fn read(&self, node: &str) -> Result<Versioned<AllocationState>, Error> {
        let current = self
            .records
            .get(node)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| Versioned::new(ResourceVersion::initial(), AllocationState::default()));
        if self.yield_after_read.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        Ok(current)
    }

    async fn write_if_version_matches(
        &self,
        node: &str,
        expected: ResourceVersion,
        state: &AllocationState,
    ) -> Result<ResourceVersion, Error> {
        let simulated_conflict = self.take_conflict();
        match self.records.entry(node.to_string()) {
            Entry::Occupied(mut entry) => {
                if simulated_conflict {
                    let bumped = entry.get().version.next();
                    entry.get_mut().version = bumped;
                }
                let found = entry.get().version;
                if found != expected {
                    self.rejected.fetch_add(1, Ordering::SeqCst);
                    return Err(Error::MismatchedVersion {
                        node: node.to_string(),
                        expected,
                        found,
                    });
                }
                let next = found.next();
                entry.insert(Versioned::new(next, state.clone()));
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(next)
            }
            Entry::Vacant(entry) => {
                let found = if simulated_conflict {
                    ResourceVersion::initial().next()
                } else {
                    ResourceVersion::initial()
                };
                if found != expected {
                    self.rejected.fetch_add(1, Ordering::SeqCst);
                    if simulated_conflict {
                        entry.insert(Versioned::new(found, AllocationState::default()));
                    }
                    return Err(Error::MismatchedVersion {
                        node: node.to_string(),
                        expected,
                        found,
                    });
                }
                let next = found.next();
                entry.insert(Versioned::new(next, state.clone()));
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(next)
            }
        }
    }
}
