//! Claim preparation for the node agent.
//!
//! Every change to the AllocationState is a read, compute, compare-and-swap
//! loop: the decision is recomputed from a fresh read whenever another
//! request got its write in first. Nothing is held in memory between
//! requests, so concurrent requests for different claims never block each
//! other.

pub mod selection;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use accel_utils::{
    get_epoch_time_in_ms,
    retry::{Backoff, RetryError, RetryPolicy},
};
use data_model::{
    AllocatedClaim,
    AllocatedDevice,
    AllocationState,
    ClaimRequest,
    DeviceDescriptor,
    DeviceKind,
    DiscoverySnapshot,
    PreparedDevice,
    ReconcileOutcome,
    Versioned,
};
use itertools::Itertools;
use state_store::{
    prepared_claims::{PreparedClaim, PreparedClaimsFile},
    StateStore,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use self::selection::{AllocationPolicy, PolicyResource, Selector};
use crate::{
    cdi::{entries::qualified_name, RegistrySynchronizer},
    discovery::{DiscoveryEngine, NamingStyle},
    errors::AllocatorError,
    provisioning::{VfLayout, VfProvisioner},
    vf_sizing::ProfileCatalog,
};

/// Taint held on a GPU while its VFs are being removed.
pub const VF_TEARDOWN_TAINT: &str = "vf-teardown";

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub policy: AllocationPolicy,
    pub resource: PolicyResource,
    pub max_conflict_retries: u32,
    pub conflict_backoff: Backoff,
    pub request_timeout: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            policy: AllocationPolicy::None,
            resource: PolicyResource::Memory,
            max_conflict_retries: 5,
            conflict_backoff: Backoff::Exponential {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(200),
            },
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Store(#[from] state_store::Error),
    #[error(transparent)]
    Decision(#[from] AllocatorError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Store(e) if e.is_retryable())
    }
}

/// What the handler needs to create VFs for claims and to find them
/// afterwards.
#[derive(Clone)]
pub struct VfProvisioning {
    pub provisioner: Arc<dyn VfProvisioner>,
    pub discovery: DiscoveryEngine,
    pub naming_style: NamingStyle,
}

pub struct ClaimHandler {
    store: StateStore,
    prepared: Arc<PreparedClaimsFile>,
    registry: Arc<RegistrySynchronizer>,
    catalog: Arc<ProfileCatalog>,
    settings: HandlerSettings,
    provisioning: Option<VfProvisioning>,
}

impl ClaimHandler {
    pub fn new(
        store: StateStore,
        prepared: Arc<PreparedClaimsFile>,
        registry: Arc<RegistrySynchronizer>,
        catalog: Arc<ProfileCatalog>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            store,
            prepared,
            registry,
            catalog,
            settings,
            provisioning: None,
        }
    }

    /// Lets VF claims be served by VFs created on demand.
    pub fn with_provisioning(mut self, provisioning: VfProvisioning) -> Self {
        self.provisioning = Some(provisioning);
        self
    }

    pub fn node(&self) -> &str {
        self.store.node()
    }

    /// Allocates devices for a claim and exposes them. A claim that was
    /// already prepared gets its recorded devices back.
    #[instrument(skip_all, fields(claim_id = %request.claim_id))]
    pub async fn prepare(
        &self,
        request: &ClaimRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<PreparedDevice>, AllocatorError> {
        request
            .validate()
            .map_err(|e| AllocatorError::InvalidRequest(e.to_string()))?;

        if let Some(prepared) = self.prepared.get(&request.claim_id).await {
            info!("claim already prepared");
            return Ok(prepared.devices);
        }

        let selector = Selector {
            catalog: &self.catalog,
            policy: self.settings.policy,
            resource: self.settings.resource,
            carve_vfs: self.provisioning.is_some(),
        };
        let deadline = Instant::now() + self.settings.request_timeout;
        let (claim, created) = self
            .update_state("prepare claim", deadline, cancel, |state| {
                if let Some(existing) = state.allocated_claims.get(&request.claim_id) {
                    return Ok((existing.clone(), false));
                }
                let claim = AllocatedClaim {
                    devices: selector.select(state, request)?,
                    shareable: request.shareable,
                };
                state
                    .allocated_claims
                    .insert(request.claim_id.clone(), claim.clone());
                Ok((claim, true))
            })
            .await?;

        match self.expose(&request.claim_id, claim, deadline, cancel).await {
            Ok(prepared) => {
                info!(
                    devices = %prepared.iter().map(|d| d.uid.as_str()).join(","),
                    "claim prepared"
                );
                Ok(prepared)
            }
            Err(e) if created => {
                warn!(error = %e, "preparing claim failed, releasing allocation");
                self.release_after_failure(&request.claim_id).await;
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "preparing claim failed, keeping allocation made by an earlier call");
                Err(e)
            }
        }
    }

    /// Creates any planned VFs of an allocated claim, exposes its devices and
    /// records the claim as prepared.
    async fn expose(
        &self,
        claim_id: &str,
        mut claim: AllocatedClaim,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<PreparedDevice>, AllocatorError> {
        if claim.has_planned_devices() {
            claim = self.provision_planned(claim_id, &claim, deadline, cancel).await?;
        }

        let state = self.store.read().await?.value;
        let devices = claim
            .uids()
            .map(|uid| {
                state
                    .allocatable_devices
                    .get(uid)
                    .cloned()
                    .ok_or_else(|| AllocatorError::not_found("device", uid))
            })
            .collect::<Result<Vec<DeviceDescriptor>, _>>()?;

        self.registry.ensure(&devices).await?;

        let prepared: Vec<PreparedDevice> = claim
            .devices
            .iter()
            .zip(&devices)
            .map(|(granted, device)| PreparedDevice {
                uid: granted.uid.clone(),
                kind: granted.kind,
                family: device.family,
                cdi_device: qualified_name(device),
                memory_mib: granted.memory_mib,
                compute_share_milli: granted.compute_share_milli,
                profile: granted.profile.clone(),
            })
            .collect();

        let record = PreparedClaim {
            claim_id: claim_id.to_string(),
            devices: prepared.clone(),
            prepared_at: get_epoch_time_in_ms(),
        };
        self.prepared
            .upsert(record)
            .await
            .map_err(|e| AllocatorError::Environment(format!("{e:#}")))?;
        Ok(prepared)
    }

    /// Enables the VFs a claim was planned with, then swaps the placeholders
    /// in the claim for the VFs that showed up. GPUs that already carry VFs
    /// were set up by an earlier attempt and are left alone.
    async fn provision_planned(
        &self,
        claim_id: &str,
        claim: &AllocatedClaim,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<AllocatedClaim, AllocatorError> {
        let Some(provisioning) = &self.provisioning else {
            return Err(AllocatorError::Environment(format!(
                "claim {claim_id} waits for new VFs but VF provisioning is off"
            )));
        };

        let state = self.store.read().await?.value;
        let mut by_parent: BTreeMap<&str, Vec<&AllocatedDevice>> = BTreeMap::new();
        for device in claim.devices.iter().filter(|d| d.is_planned()) {
            let parent = device.parent_uid.as_deref().ok_or_else(|| {
                AllocatorError::Environment(format!("planned VF {} has no parent", device.uid))
            })?;
            by_parent.entry(parent).or_default().push(device);
        }

        for (parent_uid, planned) in by_parent {
            if state.virtual_functions_of(parent_uid).next().is_some() {
                debug!(parent = parent_uid, "VFs already present, not creating them again");
                continue;
            }
            let parent = state
                .allocatable_devices
                .get(parent_uid)
                .ok_or_else(|| AllocatorError::not_found("device", parent_uid))?;
            let layout = VfLayout::plan(&self.catalog, parent, &planned)?;
            info!(
                parent = parent_uid,
                num_vfs = layout.num_vfs(),
                fair_share = layout.fair_share,
                "creating VFs"
            );
            provisioning.provisioner.create(&layout).await?;
        }

        let snapshot = provisioning.discovery.discover(provisioning.naming_style).await?;
        let claim = self
            .update_state("adopt created VFs", deadline, cancel, |state| {
                state.reconcile_allocatable(&snapshot);
                state.resolve_planned_vfs();
                state
                    .allocated_claims
                    .get(claim_id)
                    .cloned()
                    .ok_or_else(|| AllocatorError::not_found("claim", claim_id))
            })
            .await?;
        if claim.has_planned_devices() {
            return Err(AllocatorError::Environment(format!(
                "VFs planned for claim {claim_id} did not show up"
            )));
        }
        Ok(claim)
    }

    /// Releases a claim. Unknown claims are not an error.
    #[instrument(skip(self, cancel))]
    pub async fn unprepare(&self, claim_id: &str, cancel: &CancellationToken) -> Result<(), AllocatorError> {
        let deadline = Instant::now() + self.settings.request_timeout;
        let released = self
            .update_state("unprepare claim", deadline, cancel, |state| {
                Ok(state.release(claim_id))
            })
            .await?;

        self.prepared
            .remove(claim_id)
            .await
            .map_err(|e| AllocatorError::Environment(format!("{e:#}")))?;

        match released {
            Some(claim) => {
                info!("claim released");
                self.remove_idle_vfs(&claim).await;
            }
            None => info!("claim was not allocated, nothing to release"),
        }
        Ok(())
    }

    /// Adds a taint reason to a device. Returns false if the reason was
    /// already present.
    #[instrument(skip(self))]
    pub async fn taint(&self, uid: &str, reason: &str) -> Result<bool, AllocatorError> {
        if reason.trim().is_empty() {
            return Err(AllocatorError::InvalidRequest(
                "taint reason must not be empty".to_string(),
            ));
        }
        let deadline = Instant::now() + self.settings.request_timeout;
        let added = self
            .update_state("taint device", deadline, &CancellationToken::new(), |state| {
                if !state.allocatable_devices.contains_key(uid) {
                    return Err(AllocatorError::not_found("device", uid));
                }
                Ok(state.taint(uid, reason))
            })
            .await?;
        if added {
            info!("device tainted");
        }
        Ok(added)
    }

    /// Removes a taint reason. The device returns to the pool once its last
    /// reason is gone.
    #[instrument(skip(self))]
    pub async fn untaint(&self, uid: &str, reason: &str) -> Result<bool, AllocatorError> {
        let deadline = Instant::now() + self.settings.request_timeout;
        let removed = self
            .update_state("untaint device", deadline, &CancellationToken::new(), |state| {
                Ok(state.untaint(uid, reason))
            })
            .await?;
        if removed {
            info!("taint removed");
        }
        Ok(removed)
    }

    /// Mirrors a discovery snapshot into the allocatable devices.
    #[instrument(skip_all, fields(devices = snapshot.len()))]
    pub async fn reconcile(&self, snapshot: &DiscoverySnapshot) -> Result<ReconcileOutcome, AllocatorError> {
        let deadline = Instant::now() + self.settings.request_timeout;
        let outcome = self
            .update_state("reconcile devices", deadline, &CancellationToken::new(), |state| {
                Ok(state.reconcile_allocatable(snapshot))
            })
            .await?;
        if !outcome.is_empty() {
            info!(
                added = ?outcome.added,
                removed = ?outcome.removed,
                preserved = ?outcome.preserved,
                "allocatable devices changed"
            );
        }
        Ok(outcome)
    }

    pub async fn state(&self) -> Result<Versioned<AllocationState>, AllocatorError> {
        Ok(self.store.read().await?)
    }

    pub async fn prepared_claim(&self, claim_id: &str) -> Option<PreparedClaim> {
        self.prepared.get(claim_id).await
    }

    /// Runs `mutate` against a fresh copy of the state and writes the result
    /// if it changed. A lost race reruns `mutate` on the newer state; a
    /// cancelled or expired request gives up before writing.
    async fn update_state<T, F>(
        &self,
        description: &str,
        deadline: Instant,
        cancel: &CancellationToken,
        mutate: F,
    ) -> Result<T, AllocatorError>
    where
        F: Fn(&mut AllocationState) -> Result<T, AllocatorError>,
    {
        let policy = RetryPolicy::new(self.settings.max_conflict_retries, self.settings.conflict_backoff);
        let store = &self.store;
        let mutate = &mutate;

        let result = policy
            .run(
                description,
                move |_attempt| async move {
                    let current = store.read().await?;
                    let mut next = current.value.clone();
                    let output = mutate(&mut next)?;
                    if next == current.value {
                        return Ok::<T, AttemptError>(output);
                    }
                    if cancel.is_cancelled() {
                        return Err(AllocatorError::Cancelled(description.to_string()).into());
                    }
                    if Instant::now() >= deadline {
                        return Err(AllocatorError::Cancelled(format!("{description} (deadline exceeded)")).into());
                    }
                    store.write(current.version, &next).await?;
                    Ok::<T, AttemptError>(output)
                },
                AttemptError::is_retryable,
            )
            .await;

        result.map_err(|e| match e {
            RetryError::Exhausted { attempts, .. } => AllocatorError::ConcurrentModification {
                node: self.store.node().to_string(),
                attempts,
            },
            RetryError::Permanent(AttemptError::Store(e)) => e.into(),
            RetryError::Permanent(AttemptError::Decision(e)) => e,
        })
    }

    async fn release_after_failure(&self, claim_id: &str) {
        let deadline = Instant::now() + self.settings.request_timeout;
        let released = self
            .update_state("roll back claim", deadline, &CancellationToken::new(), |state| {
                Ok(state.release(claim_id))
            })
            .await;
        match released {
            Ok(Some(claim)) => self.remove_idle_vfs(&claim).await,
            Ok(None) => {}
            Err(e) => warn!(claim_id, error = %e, "failed to roll back allocation"),
        }
    }

    /// Removes the VFs of GPUs that a released claim took VFs from, once no
    /// other claim holds one of their VFs. The GPU stays tainted while its
    /// VFs go away so nothing picks them in the meantime. Failures are only
    /// logged: the VFs then stay and can serve later claims.
    async fn remove_idle_vfs(&self, released: &AllocatedClaim) {
        let Some(provisioning) = &self.provisioning else {
            return;
        };
        let parents: BTreeSet<String> = released
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::VirtualFunction)
            .filter_map(|d| d.parent_uid.clone())
            .collect();
        if parents.is_empty() {
            return;
        }

        let deadline = Instant::now() + self.settings.request_timeout;
        let idle = self
            .update_state("mark idle VF parents", deadline, &CancellationToken::new(), |state| {
                let mut idle = Vec::new();
                for uid in &parents {
                    let Some(parent) = state.allocatable_devices.get(uid) else {
                        continue;
                    };
                    let in_use = state.consumption(uid, None).allocated_children > 0;
                    let has_vfs = state.virtual_functions_of(uid).next().is_some();
                    if in_use || !has_vfs || state.is_tainted(uid) {
                        continue;
                    }
                    idle.push(parent.clone());
                }
                for parent in &idle {
                    state.taint(&parent.uid, VF_TEARDOWN_TAINT);
                }
                Ok(idle)
            })
            .await;
        let idle = match idle {
            Ok(idle) if idle.is_empty() => return,
            Ok(idle) => idle,
            Err(e) => {
                warn!(error = %e, "cannot mark GPUs for VF removal");
                return;
            }
        };

        for parent in &idle {
            if let Err(e) = provisioning.provisioner.remove_all(parent).await {
                warn!(parent = %parent.uid, error = %e, "failed to remove idle VFs");
            }
        }

        let snapshot = match provisioning.discovery.discover(provisioning.naming_style).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "rediscovery after VF removal failed");
                None
            }
        };
        let deadline = Instant::now() + self.settings.request_timeout;
        let settled = self
            .update_state("finish VF removal", deadline, &CancellationToken::new(), |state| {
                if let Some(snapshot) = &snapshot {
                    state.reconcile_allocatable(snapshot);
                }
                for parent in &idle {
                    state.untaint(&parent.uid, VF_TEARDOWN_TAINT);
                }
                Ok(())
            })
            .await;
        if let Err(e) = settled {
            warn!(error = %e, "failed to clear VF removal taint");
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_gpu, snapshot_of, FLEX170},
        ClaimRequestBuilder,
        RequestedDeviceType,
    };
    use state_store::in_memory::InMemoryBackend;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        cdi::{entries::GPU_KIND, spec::CdiSpec, store::InMemoryRegistry},
        discovery::models::ModelNames,
        testing::{FakeKernel, FakeSysfs},
        vf_sizing::builtin_catalog,
    };

    struct Harness {
        backend: Arc<InMemoryBackend>,
        registry: Arc<InMemoryRegistry>,
        handler: ClaimHandler,
        _dir: TempDir,
    }

    async fn harness(devices: Vec<DeviceDescriptor>) -> Harness {
        harness_with(devices, None).await
    }

    /// A handler that creates VFs through a fake kernel, on one bare Flex 170.
    async fn provisioning_harness() -> (Harness, Arc<FakeKernel>) {
        let sysfs = Arc::new(FakeSysfs::new().unwrap());
        sysfs.add_gpu("0000:03:00.0", FLEX170, 0, 16384, 16).unwrap();
        let catalog = Arc::new(builtin_catalog());
        let kernel = Arc::new(FakeKernel::new(sysfs.clone(), catalog.clone()));
        let discovery = DiscoveryEngine::new(
            sysfs.repository(),
            Arc::new(ModelNames::builtin()),
            catalog,
            Duration::from_secs(5),
        );
        let devices = discovery
            .discover(NamingStyle::Machine)
            .await
            .unwrap()
            .into_values()
            .collect();
        let provisioning = VfProvisioning {
            provisioner: kernel.clone(),
            discovery,
            naming_style: NamingStyle::Machine,
        };
        (harness_with(devices, Some(provisioning)).await, kernel)
    }

    async fn harness_with(devices: Vec<DeviceDescriptor>, provisioning: Option<VfProvisioning>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::default());
        let registry = Arc::new(InMemoryRegistry::default());
        let store = StateStore::new(backend.clone(), "node-1", Duration::from_secs(1));
        let prepared = PreparedClaimsFile::new(dir.path().join("prepared_claims.json"))
            .await
            .unwrap();
        let mut handler = ClaimHandler::new(
            store,
            Arc::new(prepared),
            Arc::new(RegistrySynchronizer::new(registry.clone(), "/dev")),
            Arc::new(builtin_catalog()),
            HandlerSettings {
                conflict_backoff: Backoff::None,
                ..Default::default()
            },
        );
        if let Some(provisioning) = provisioning {
            handler = handler.with_provisioning(provisioning);
        }
        handler.reconcile(&snapshot_of(devices)).await.unwrap();
        Harness {
            backend,
            registry,
            handler,
            _dir: dir,
        }
    }

    fn claim(id: &str) -> ClaimRequest {
        ClaimRequestBuilder::default().claim_id(id).build().unwrap()
    }

    fn vf_claim(id: &str, memory_mib: u64) -> ClaimRequest {
        ClaimRequestBuilder::default()
            .claim_id(id)
            .device_type(RequestedDeviceType::VirtualFunction)
            .memory_mib(memory_mib)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let h = harness(vec![mock_gpu("0000:03:00.0", FLEX170, 0)]).await;
        let cancel = CancellationToken::new();

        let first = h.handler.prepare(&claim("c1"), &cancel).await.unwrap();
        assert_eq!(first[0].cdi_device, "intel.com/gpu=0000-03-00-0-0x56c0");
        let writes = h.backend.write_count();

        let again = h.handler.prepare(&claim("c1"), &cancel).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(h.backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_unprepare_is_idempotent() {
        let h = harness(vec![mock_gpu("0000:03:00.0", FLEX170, 0)]).await;
        let cancel = CancellationToken::new();
        h.handler.unprepare("never-allocated", &cancel).await.unwrap();

        h.handler.prepare(&claim("c1"), &cancel).await.unwrap();
        h.handler.unprepare("c1", &cancel).await.unwrap();
        h.handler.unprepare("c1", &cancel).await.unwrap();
        assert!(h.handler.prepared_claim("c1").await.is_none());
        assert!(h.handler.state().await.unwrap().value.allocated_claims.is_empty());

        h.handler.prepare(&claim("c2"), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_then_reported() {
        let h = harness(vec![mock_gpu("0000:03:00.0", FLEX170, 0)]).await;
        let cancel = CancellationToken::new();

        h.backend.inject_conflicts(2);
        h.handler.prepare(&claim("c1"), &cancel).await.unwrap();

        h.backend.inject_conflicts(100);
        let err = h.handler.unprepare("c1", &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            AllocatorError::ConcurrentModification { attempts: 6, .. }
        ));
        assert_eq!(err.kind(), crate::errors::ErrorKind::RetryLater);
    }

    #[tokio::test]
    async fn test_exposure_failure_rolls_back() {
        let h = harness(vec![mock_gpu("0000:03:00.0", FLEX170, 0)]).await;
        let cancel = CancellationToken::new();
        h.registry.fail_writes_to("intel.com-gpu.json");

        let err = h.handler.prepare(&claim("c1"), &cancel).await.unwrap_err();
        assert!(matches!(err, AllocatorError::ExposureSyncFailure(_)));
        let state = h.handler.state().await.unwrap().value;
        assert!(state.allocated_claims.is_empty());
        assert!(h.handler.prepared_claim("c1").await.is_none());

        h.registry.heal();
        h.handler.prepare(&claim("c1"), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_retry_keeps_allocation_of_earlier_call() {
        let h = harness(vec![mock_gpu("0000:03:00.0", FLEX170, 0)]).await;
        let cancel = CancellationToken::new();
        let first = h.handler.prepare(&claim("c1"), &cancel).await.unwrap();

        // The earlier call allocated but its prepared record is gone, and
        // this time the registry refuses the write.
        h.handler.prepared.remove("c1").await.unwrap();
        h.registry.insert("intel.com-gpu.json", CdiSpec::new(GPU_KIND, vec![]));
        h.registry.fail_writes_to("intel.com-gpu.json");

        let err = h.handler.prepare(&claim("c1"), &cancel).await.unwrap_err();
        assert!(matches!(err, AllocatorError::ExposureSyncFailure(_)));
        let state = h.handler.state().await.unwrap().value;
        assert!(state.allocated_claims.contains_key("c1"));
        assert!(state.is_allocated("0000-03-00-0-0x56c0"));

        h.registry.heal();
        let again = h.handler.prepare(&claim("c1"), &cancel).await.unwrap();
        assert_eq!(again[0].uid, first[0].uid);
    }

    #[tokio::test]
    async fn test_vf_claim_on_bare_gpu_creates_vfs() {
        let (h, kernel) = provisioning_harness().await;
        let cancel = CancellationToken::new();

        let devices = h.handler.prepare(&vf_claim("vf-claim", 4000), &cancel).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].uid, "0000-03-00-1-0x56c0");
        assert_eq!(devices[0].kind, DeviceKind::VirtualFunction);
        assert_eq!(devices[0].cdi_device, "intel.com/gpu=0000-03-00-1-0x56c0");
        assert_eq!(devices[0].memory_mib, 7680);
        assert_eq!(devices[0].compute_share_milli, 500);
        assert_eq!(devices[0].profile.as_deref(), Some("flex170_m2"));
        assert_eq!(kernel.created_count(), 1);

        let state = h.handler.state().await.unwrap().value;
        assert_eq!(state.allocatable_devices.len(), 3);
        assert!(!state.allocated_claims["vf-claim"].has_planned_devices());
        assert!(h.registry.get("intel.com-gpu.json").unwrap().device("0000-03-00-1-0x56c0").is_some());

        // The second VF of the split serves the next claim as it is.
        let second = h.handler.prepare(&vf_claim("vf-2", 4000), &cancel).await.unwrap();
        assert_eq!(second[0].uid, "0000-03-00-2-0x56c0");
        assert_eq!(kernel.created_count(), 1);
        assert!(matches!(
            h.handler.prepare(&vf_claim("vf-3", 4000), &cancel).await,
            Err(AllocatorError::InsufficientResources { .. })
        ));

        h.handler.unprepare("vf-claim", &cancel).await.unwrap();
        let state = h.handler.state().await.unwrap().value;
        assert_eq!(state.allocatable_devices.len(), 3);

        h.handler.unprepare("vf-2", &cancel).await.unwrap();
        let state = h.handler.state().await.unwrap().value;
        assert_eq!(
            state.allocatable_devices.keys().collect::<Vec<_>>(),
            vec!["0000-03-00-0-0x56c0"]
        );
        assert!(state.tainted_devices.is_empty());

        h.handler.prepare(&claim("whole"), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_vf_creation_rolls_back() {
        let (h, kernel) = provisioning_harness().await;
        let cancel = CancellationToken::new();
        kernel.reject_creation(true);

        let err = h.handler.prepare(&vf_claim("vf-claim", 4000), &cancel).await.unwrap_err();
        assert!(matches!(err, AllocatorError::Environment(ref m) if m.contains("sriov_numvfs")));
        let state = h.handler.state().await.unwrap().value;
        assert!(state.allocated_claims.is_empty());
        assert_eq!(state.allocatable_devices.len(), 1);

        kernel.reject_creation(false);
        let devices = h.handler.prepare(&vf_claim("vf-claim", 4000), &cancel).await.unwrap();
        assert_eq!(devices[0].profile.as_deref(), Some("flex170_m2"));
    }

    #[tokio::test]
    async fn test_cancelled_request_writes_nothing() {
        let h = harness(vec![mock_gpu("0000:03:00.0", FLEX170, 0)]).await;
        let writes = h.backend.write_count();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.handler.prepare(&claim("c1"), &cancel).await.unwrap_err();
        assert!(matches!(err, AllocatorError::Cancelled(_)));
        assert_eq!(h.backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_taints() {
        let h = harness(vec![mock_gpu("0000:03:00.0", FLEX170, 0)]).await;
        let cancel = CancellationToken::new();
        let uid = "0000-03-00-0-0x56c0";

        assert!(h.handler.taint(uid, "ecc-errors").await.unwrap());
        assert!(!h.handler.taint(uid, "ecc-errors").await.unwrap());
        assert!(matches!(
            h.handler.taint("unknown", "x").await,
            Err(AllocatorError::NotFound { .. })
        ));
        assert!(matches!(
            h.handler.prepare(&claim("c1"), &cancel).await,
            Err(AllocatorError::InsufficientResources { .. })
        ));

        assert!(h.handler.untaint(uid, "ecc-errors").await.unwrap());
        assert!(!h.handler.untaint(uid, "ecc-errors").await.unwrap());
        h.handler.prepare(&claim("c1"), &cancel).await.unwrap();
    }
}
