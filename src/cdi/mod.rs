//! Keeps the CDI registry in line with discovered devices.
//!
//! The registry is derived state: it can always be rebuilt from a discovery
//! snapshot, and allocation decisions never read it. Entries are fixed up
//! when the kernel reassigns device node numbers, dropped when their device
//! is gone and cleanup is asked for, and appended when a device is new. A
//! pass that changes nothing writes nothing.

pub mod entries;
pub mod spec;
pub mod store;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use data_model::{DeviceDescriptor, DeviceFamily};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use self::{
    entries::{device_entry, kind_for},
    spec::{CdiDevice, CdiSpec},
    store::{default_file_name, RegistryError, RegistryStore},
};
use crate::errors::AllocatorError;

/// What one pass did, summed over every family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files_written: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.files_written += other.files_written;
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
    }
}

pub struct RegistrySynchronizer {
    store: Arc<dyn RegistryStore>,
    dev_root: PathBuf,
    /// Serializes passes; spec files are rewritten whole.
    pass: Mutex<()>,
}

impl RegistrySynchronizer {
    pub fn new(store: Arc<dyn RegistryStore>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            dev_root: dev_root.into(),
            pass: Mutex::new(()),
        }
    }

    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    /// Reconciles every family's spec files with `detected`.
    ///
    /// A failing file does not stop the pass; files already written stay
    /// written and the first failure is returned once every file was
    /// processed.
    pub async fn sync<'a>(
        &self,
        detected: impl IntoIterator<Item = &'a DeviceDescriptor>,
        cleanup: bool,
    ) -> Result<SyncReport, AllocatorError> {
        let _pass = self.pass.lock().await;
        let by_family = self.entries_by_family(detected);

        let mut report = SyncReport::default();
        let mut first_error: Option<RegistryError> = None;
        for family in [DeviceFamily::Gpu, DeviceFamily::Gaudi, DeviceFamily::Qat] {
            let wanted = by_family.get(&family).cloned().unwrap_or_default();
            let (family_report, family_error) =
                self.sync_kind(kind_for(family), wanted, cleanup).await;
            report.merge(family_report);
            if first_error.is_none() {
                first_error = family_error;
            }
        }

        if report.files_written > 0 {
            info!(
                files = report.files_written,
                added = report.added,
                updated = report.updated,
                removed = report.removed,
                "CDI registry updated"
            );
        }
        match first_error {
            Some(e) => Err(AllocatorError::ExposureSyncFailure(e.to_string())),
            None => Ok(report),
        }
    }

    /// Makes sure `devices` have current entries, leaving every other entry
    /// alone. Returns the qualified names of the devices.
    pub async fn ensure(&self, devices: &[DeviceDescriptor]) -> Result<Vec<String>, AllocatorError> {
        for device in devices {
            if device_entry(device, &self.dev_root).is_none() {
                return Err(AllocatorError::ExposureSyncFailure(format!(
                    "device {} has no device node to expose",
                    device.uid
                )));
            }
        }
        self.sync(devices, false).await?;
        Ok(devices.iter().map(entries::qualified_name).collect())
    }

    fn entries_by_family<'a>(
        &self,
        detected: impl IntoIterator<Item = &'a DeviceDescriptor>,
    ) -> BTreeMap<DeviceFamily, BTreeMap<String, CdiDevice>> {
        let mut by_family: BTreeMap<DeviceFamily, BTreeMap<String, CdiDevice>> = BTreeMap::new();
        for device in detected {
            match device_entry(device, &self.dev_root) {
                Some(entry) => {
                    by_family
                        .entry(device.family)
                        .or_default()
                        .insert(device.uid.clone(), entry);
                }
                None => debug!(uid = %device.uid, "device has no node to expose"),
            }
        }
        by_family
    }

    async fn sync_kind(
        &self,
        kind: &str,
        mut wanted: BTreeMap<String, CdiDevice>,
        cleanup: bool,
    ) -> (SyncReport, Option<RegistryError>) {
        let mut report = SyncReport::default();
        let mut first_error = None;

        let mut specs = match self.store.list(kind).await {
            Ok(specs) => specs,
            Err(e) => {
                error!(kind, error = %e, "cannot read CDI registry");
                return (report, Some(e));
            }
        };

        if specs.is_empty() {
            if wanted.is_empty() {
                return (report, None);
            }
            let file_name = default_file_name(kind);
            report.added = wanted.len();
            let spec = CdiSpec::new(kind, wanted.into_values().collect());
            match self.store.write(&file_name, &spec).await {
                Ok(()) => report.files_written += 1,
                Err(e) => {
                    error!(kind, file = %file_name, error = %e, "failed to write CDI spec");
                    first_error = Some(e);
                }
            }
            return (report, first_error);
        }

        for (file_name, spec) in specs.iter_mut() {
            let mut changed = false;
            spec.devices.retain_mut(|existing| {
                if let Some(expected) = wanted.remove(&existing.name) {
                    if existing.container_edits != expected.container_edits {
                        debug!(uid = %existing.name, "container edits changed, updating entry");
                        existing.container_edits = expected.container_edits;
                        report.updated += 1;
                        changed = true;
                    }
                    true
                } else if cleanup {
                    debug!(uid = %existing.name, "device is gone, removing entry");
                    report.removed += 1;
                    changed = true;
                    false
                } else {
                    true
                }
            });

            if changed {
                match self.store.write(file_name, spec).await {
                    Ok(()) => report.files_written += 1,
                    Err(e) => {
                        error!(kind, file = %file_name, error = %e, "failed to write CDI spec");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        if !wanted.is_empty() {
            let (file_name, spec) = &mut specs[0];
            report.added += wanted.len();
            spec.devices.extend(wanted.into_values());
            match self.store.write(file_name, spec).await {
                Ok(()) => report.files_written += 1,
                Err(e) => {
                    error!(kind, file = %file_name, error = %e, "failed to write CDI spec");
                    first_error.get_or_insert(e);
                }
            }
        }

        (report, first_error)
    }
}
