//! Per-volume NVMe-oF initiator lifecycle: attach the remote namespace,
//! wrap it in a linear device-mapper target and publish a stable endpoint
//! node. The dm indirection is what makes hot retargeting possible: the
//! endpoint keeps its device numbers while the backing namespace is
//! swapped underneath a suspend/reload/resume.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    device::{self, BridgedDevice, KernelDevice},
    dmsetup,
    error::{self, Error},
    executor::Executor,
    filelock::{FileLock, LOCK_FILE, LOCK_TIMEOUT},
    nvme,
};

/// Discover/connect retry budget.
pub const MAX_CONNECT_RETRIES: u32 = 15;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Budget for the namespace device to appear after connecting.
pub const MAX_WAIT_DEVICE_RETRIES: u32 = 60;
const WAIT_DEVICE_INTERVAL: Duration = Duration::from_secs(1);

/// Budget in seconds for the mapper node to appear after a dm create.
const VALIDATE_DM_CREATION_RETRIES: u32 = 30;

/// One initiator per name per process; the name is also the dm device
/// name and the endpoint file name.
static ACTIVE_INITIATORS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// The per-volume lifecycle object. All state-mutating operations take
/// the cross-process file lock for their whole duration when a host /proc
/// path was given.
#[derive(Debug)]
pub struct Initiator {
    name: String,
    subsystem_nqn: String,
    transport_address: String,
    transport_service_id: String,
    controller_name: String,
    namespace_name: String,
    endpoint: PathBuf,
    dev: Option<BridgedDevice>,
    is_up: bool,
    host_proc: Option<String>,
    executor: Executor,
}

impl Initiator {
    /// Create an initiator for the given volume name and subsystem NQN.
    /// `host_proc` points at the host's /proc when the managed state lives
    /// in another set of namespaces. Transport address and service id are
    /// learnt on start; an initiator without them is still valid for stop.
    pub async fn new(
        name: &str,
        subsystem_nqn: &str,
        host_proc: Option<&str>,
    ) -> Result<Initiator, Error> {
        if name.is_empty() || subsystem_nqn.is_empty() {
            return error::InitiatorParamsSnafu {}.fail();
        }

        {
            let mut active = ACTIVE_INITIATORS
                .lock()
                .expect("initiator registry poisoned");
            if !active.insert(name.to_string()) {
                return error::InitiatorExistsSnafu { name }.fail();
            }
        }

        let executor = match Executor::new(host_proc).await {
            Ok(executor) => executor,
            Err(err) => {
                ACTIVE_INITIATORS
                    .lock()
                    .expect("initiator registry poisoned")
                    .remove(name);
                return Err(err);
            }
        };

        Ok(Initiator {
            name: name.to_string(),
            subsystem_nqn: subsystem_nqn.to_string(),
            transport_address: String::new(),
            transport_service_id: String::new(),
            controller_name: String::new(),
            namespace_name: String::new(),
            endpoint: device::endpoint_path(name),
            dev: None,
            is_up: false,
            host_proc: host_proc.map(str::to_string),
            executor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subsystem_nqn(&self) -> &str {
        &self.subsystem_nqn
    }

    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    pub fn namespace_name(&self) -> &str {
        &self.namespace_name
    }

    pub fn transport_address(&self) -> &str {
        &self.transport_address
    }

    pub fn transport_service_id(&self) -> &str {
        &self.transport_service_id
    }

    /// The published endpoint node, once it is up.
    pub fn endpoint(&self) -> Option<&Path> {
        if self.is_up {
            Some(&self.endpoint)
        } else {
            None
        }
    }

    /// The cross process lock is only relevant when managing host state.
    async fn lock(&self) -> Result<Option<FileLock>, Error> {
        match &self.host_proc {
            Some(_) => Ok(Some(FileLock::acquire(LOCK_FILE, LOCK_TIMEOUT).await?)),
            None => Ok(None),
        }
    }

    /// Discover the subsystem NQN served at the given address.
    pub async fn discover_target(&self, traddr: &str, trsvcid: &str) -> Result<String, Error> {
        let _lock = self.lock().await?;
        nvme::discover_target(traddr, trsvcid, &self.executor).await
    }

    /// Connect to the subsystem at the given address.
    pub async fn connect_target(
        &self,
        traddr: &str,
        trsvcid: &str,
        nqn: &str,
    ) -> Result<String, Error> {
        let _lock = self.lock().await?;
        nvme::connect_target(traddr, trsvcid, nqn, &self.executor).await
    }

    /// Disconnect every controller of this initiator's subsystem.
    pub async fn disconnect_target(&self) -> Result<(), Error> {
        let _lock = self.lock().await?;
        nvme::disconnect_target(&self.subsystem_nqn, &self.executor).await
    }

    /// Attach the target at `traddr:trsvcid`, wait for the namespace to
    /// appear, wrap it and publish the endpoint. With `cleanup_required`
    /// false the endpoint is a direct mknod of the namespace and no dm
    /// device is involved.
    ///
    /// Returns whether the dm device was found busy and left in place
    /// with its old backing (the in-place retarget failed); on a clean
    /// start or a successful retarget this is false.
    pub async fn start(
        &mut self,
        traddr: &str,
        trsvcid: &str,
        cleanup_required: bool,
    ) -> Result<bool, Error> {
        match self.start_inner(traddr, trsvcid, cleanup_required).await {
            Ok(dm_device_busy) => Ok(dm_device_busy),
            Err(source) => Err(Error::StartFailed {
                name: self.name.clone(),
                source: Box::new(source),
            }),
        }
    }

    async fn start_inner(
        &mut self,
        traddr: &str,
        trsvcid: &str,
        cleanup_required: bool,
    ) -> Result<bool, Error> {
        info!(
            "starting initiator {} for {}:{}, cleanup required {}",
            self.name, traddr, trsvcid, cleanup_required
        );

        if traddr.is_empty() || trsvcid.is_empty() {
            return error::InvalidTransportAddressSnafu {
                name: self.name.clone(),
                traddr,
                trsvcid,
            }
            .fail();
        }

        let _lock = self.lock().await?;

        // Already launched with the right address and a loadable endpoint?
        let (recorded_addr, recorded_svc, recorded_nqn) = (
            self.transport_address.clone(),
            self.transport_service_id.clone(),
            self.subsystem_nqn.clone(),
        );
        if self
            .load_device_info(&recorded_addr, &recorded_svc, &recorded_nqn)
            .await
            .is_ok()
        {
            if self.transport_address == traddr && self.transport_service_id == trsvcid {
                match self.load_endpoint(false).await {
                    Ok(()) => {
                        info!(
                            "initiator {} is already launched with correct params",
                            self.name
                        );
                        return Ok(false);
                    }
                    Err(err) => warn!(
                        "initiator {} is launched but failed to load the endpoint: {}",
                        self.name, err
                    ),
                }
            } else {
                warn!(
                    "initiator {} is launched with address {}:{}, required {}:{}, relaunching",
                    self.name,
                    self.transport_address,
                    self.transport_service_id,
                    traddr,
                    trsvcid
                );
            }
        }

        // Whatever is there is stale; stop it blindly before starting.
        // Each step is best effort.
        info!("stopping initiator {} blindly before starting", self.name);
        let mut dm_device_busy = self.stop_locked(cleanup_required, false, false).await?;

        info!("launching initiator {}", self.name);
        let mut last_err = None;
        for _ in 0 .. MAX_CONNECT_RETRIES {
            // Re-discovering an already discovered target is fine.
            let nqn = match nvme::discover_target(traddr, trsvcid, &self.executor).await {
                Ok(nqn) => nqn,
                Err(err) => {
                    warn!("failed to discover target {}:{}: {}", traddr, trsvcid, err);
                    last_err = Some(err);
                    sleep(CONNECT_RETRY_INTERVAL).await;
                    continue;
                }
            };
            match nvme::connect_target(traddr, trsvcid, &nqn, &self.executor).await {
                Ok(controller) => {
                    self.subsystem_nqn = nqn;
                    self.controller_name = controller;
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("failed to connect target {}:{}: {}", traddr, trsvcid, err);
                    last_err = Some(err);
                    sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
        if let Some(source) = last_err {
            return Err(Error::ConnectRetriesExhausted {
                name: self.name.clone(),
                retries: MAX_CONNECT_RETRIES,
                source: Box::new(source),
            });
        }

        // Wait for the namespace block device to appear and resolve. The
        // recorded address fields are empty after the stop above, so the
        // lookup filters by NQN alone and relearns the address from the
        // controller.
        let mut last_err = None;
        for _ in 0 .. MAX_WAIT_DEVICE_RETRIES {
            let (addr, svc, nqn) = (
                self.transport_address.clone(),
                self.transport_service_id.clone(),
                self.subsystem_nqn.clone(),
            );
            match self.load_device_info(&addr, &svc, &nqn).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    last_err = Some(err);
                    sleep(WAIT_DEVICE_INTERVAL).await;
                }
            }
        }
        if let Some(source) = last_err {
            return Err(Error::WaitDevice {
                name: self.name.clone(),
                source: Box::new(source),
            });
        }

        let mut need_make_endpoint = true;
        if cleanup_required {
            if dm_device_busy {
                // The endpoint already exists and is held open; swap the
                // backing device under it instead.
                need_make_endpoint = false;
                info!(
                    "dm device of initiator {} is busy, replacing the backing target in place",
                    self.name
                );
                match self.replace_dm_device_target().await {
                    Ok(()) => {
                        info!("replaced the backing target of initiator {}", self.name);
                        dm_device_busy = false;
                    }
                    Err(err) => warn!(
                        "failed to replace the backing target of initiator {}: {}",
                        self.name, err
                    ),
                }
            } else {
                info!("creating linear dm device for initiator {}", self.name);
                self.create_linear_dm_device().await?;
            }
        } else {
            info!(
                "skipping dm device creation for initiator {}",
                self.name
            );
            if let Some(dev) = self.dev.as_mut() {
                dev.export = dev.nvme.clone();
            }
        }

        if need_make_endpoint {
            info!("creating endpoint {}", self.endpoint.display());
            self.make_endpoint()?;
        }

        info!(
            "launched initiator {}: controller {}, namespace {}, endpoint {}",
            self.name,
            self.controller_name,
            self.namespace_name,
            self.endpoint.display()
        );

        Ok(dm_device_busy)
    }

    /// Tear the initiator down: remove the dm device and endpoint (when
    /// `cleanup_required`), then disconnect the subsystem. A dm device
    /// that is still held open fails the removal with busy; with
    /// `err_on_busy` false that is reported as a `true` return instead of
    /// an error and the endpoint is left in place. Safe to call when
    /// nothing is attached.
    pub async fn stop(
        &mut self,
        cleanup_required: bool,
        defer_dm: bool,
        err_on_busy: bool,
    ) -> Result<bool, Error> {
        let _lock = self.lock().await?;
        self.stop_locked(cleanup_required, defer_dm, err_on_busy).await
    }

    async fn stop_locked(
        &mut self,
        cleanup_required: bool,
        defer_dm: bool,
        err_on_busy: bool,
    ) -> Result<bool, Error> {
        let mut dm_device_busy = false;
        if cleanup_required {
            dm_device_busy = self
                .remove_dm_device_and_endpoint(defer_dm, err_on_busy)
                .await?;
        }

        if let Err(source) = nvme::disconnect_target(&self.subsystem_nqn, &self.executor).await {
            return Err(Error::Disconnect {
                name: self.name.clone(),
                source: Box::new(source),
            });
        }

        self.controller_name.clear();
        self.namespace_name.clear();
        self.transport_address.clear();
        self.transport_service_id.clear();

        Ok(dm_device_busy)
    }

    async fn remove_dm_device_and_endpoint(
        &mut self,
        defer_dm: bool,
        err_on_busy: bool,
    ) -> Result<bool, Error> {
        if let Err(err) = self.remove_linear_dm_device(false, defer_dm).await {
            if err.is_dm_device_busy() {
                if err_on_busy {
                    return Err(err);
                }
                warn!(
                    "dm device of initiator {} is busy, leaving it and the endpoint in place",
                    self.name
                );
                return Ok(true);
            }
            return Err(err);
        }
        self.remove_endpoint().await?;
        Ok(false)
    }

    async fn remove_linear_dm_device(&self, force: bool, deferred: bool) -> Result<(), Error> {
        let dev_path = dmsetup::device_path(&self.name);
        match std::fs::metadata(&dev_path) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("linear dm device {} doesn't exist", dev_path.display());
                return Ok(());
            }
            Err(source) => {
                return Err(Error::DeviceIo {
                    op: "stat",
                    path: dev_path,
                    source,
                })
            }
            Ok(_) => {}
        }

        info!("removing linear dm device {}", self.name);
        dmsetup::remove(&self.name, force, deferred, &self.executor).await
    }

    fn make_endpoint(&mut self) -> Result<(), Error> {
        let Some(dev) = &self.dev else {
            return error::NoBackingDeviceSnafu {
                name: self.name.clone(),
            }
            .fail();
        };
        device::duplicate_device(&dev.export, &self.endpoint)?;
        self.is_up = true;
        Ok(())
    }

    async fn remove_endpoint(&mut self) -> Result<(), Error> {
        device::remove_device(&self.endpoint).await?;
        self.dev = None;
        self.is_up = false;
        Ok(())
    }

    /// Load the attached controller and namespace for this initiator,
    /// resolve the namespace block device and record the transport
    /// address the controller reports. Empty filter strings match
    /// anything.
    pub async fn load_nvme_device_info(
        &mut self,
        traddr: &str,
        trsvcid: &str,
        nqn: &str,
    ) -> Result<(), Error> {
        let _lock = self.lock().await?;
        self.load_device_info(traddr, trsvcid, nqn).await
    }

    async fn load_device_info(
        &mut self,
        traddr: &str,
        trsvcid: &str,
        nqn: &str,
    ) -> Result<(), Error> {
        let opt = |value: &str| {
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };
        let devices = nvme::get_devices(
            opt(traddr).as_deref(),
            opt(trsvcid).as_deref(),
            opt(nqn).as_deref(),
            &self.executor,
        )
        .await?;

        if devices.len() != 1 {
            return error::DeviceCountMismatchSnafu {
                name: self.name.clone(),
            }
            .fail();
        }
        let device = &devices[0];
        if device.namespaces.len() != 1 {
            return error::NamespaceCountMismatchSnafu {
                name: self.name.clone(),
            }
            .fail();
        }
        let Some(controller) = device.controllers.first() else {
            return error::DeviceCountMismatchSnafu {
                name: self.name.clone(),
            }
            .fail();
        };

        if !self.controller_name.is_empty() && self.controller_name != controller.controller {
            return error::ControllerMismatchSnafu {
                name: self.name.clone(),
                found: controller.controller.clone(),
                recorded: self.controller_name.clone(),
            }
            .fail();
        }

        self.controller_name = controller.controller.clone();
        self.namespace_name = device.namespaces[0].name_space.clone();
        let (addr, svc) = nvme::split_controller_address(&controller.address);
        self.transport_address = addr;
        self.transport_service_id = svc;

        let namespace_path = device::device_path(&self.namespace_name);
        let nvme_dev = device::detect_device(&namespace_path, &self.executor).await?;
        match self.dev.as_mut() {
            Some(dev) => dev.nvme = nvme_dev,
            None => {
                self.dev = Some(BridgedDevice {
                    nvme: nvme_dev,
                    export: KernelDevice::default(),
                })
            }
        }
        Ok(())
    }

    /// Load the published endpoint state, verifying through the dm deps
    /// that the mapping still points at the recorded namespace unless the
    /// dm device is busy.
    pub async fn load_endpoint(&mut self, dm_device_busy: bool) -> Result<(), Error> {
        let endpoint_dev = device::detect_device(&self.endpoint, &self.executor).await?;
        let dep_devices = dmsetup::deps(&endpoint_dev.name, &self.executor).await?;

        if dm_device_busy {
            debug!(
                "skipping endpoint {} verification for initiator {} due to device busy",
                self.endpoint.display(),
                self.name
            );
        } else if !self.namespace_name.is_empty()
            && !dep_devices.iter().any(|dep| dep == &self.namespace_name)
        {
            return error::NamespaceMismatchSnafu {
                name: self.name.clone(),
                device: self.namespace_name.clone(),
                endpoint: self.endpoint.display().to_string(),
            }
            .fail();
        }

        match self.dev.as_mut() {
            Some(dev) => dev.export = endpoint_dev,
            None => {
                self.dev = Some(BridgedDevice {
                    nvme: KernelDevice::default(),
                    export: endpoint_dev,
                })
            }
        }
        self.is_up = true;
        Ok(())
    }

    async fn create_linear_dm_device(&mut self) -> Result<(), Error> {
        let Some(dev) = &self.dev else {
            return error::NoBackingDeviceSnafu {
                name: self.name.clone(),
            }
            .fail();
        };
        let nvme_path = device::device_path(&dev.nvme.name);
        let sectors = device::get_device_sectors(&nvme_path, &self.executor).await?;

        // Same size as the backing namespace.
        let table = dmsetup::linear_table(sectors, &nvme_path);
        info!(
            "creating linear dm device {} with table '{}'",
            self.name, table
        );
        dmsetup::create(&self.name, &table, &self.executor).await?;

        let dm_path = dmsetup::device_path(&self.name);
        validate_device_creation(&dm_path, VALIDATE_DM_CREATION_RETRIES).await?;

        let (major, minor) = device::get_device_numbers(&dm_path, &self.executor).await?;
        if let Some(dev) = self.dev.as_mut() {
            dev.export = KernelDevice {
                name: self.name.clone(),
                major,
                minor,
            };
        }
        Ok(())
    }

    /// Swap the backing device of the live mapping: suspend with flush
    /// and lockfs so no in-flight write crosses the change, reload the
    /// recomputed table, resume. The endpoint keeps its device numbers.
    async fn replace_dm_device_target(&mut self) -> Result<(), Error> {
        self.suspend_locked(false, false).await?;
        self.reload_linear_dm_device().await?;
        self.resume_locked().await
    }

    /// Suspend the dm device, holding I/O in the kernel. Idempotent: a
    /// device that is already suspended is left alone.
    pub async fn suspend(&self, noflush: bool, nolockfs: bool) -> Result<(), Error> {
        let _lock = self.lock().await?;
        self.suspend_locked(noflush, nolockfs).await
    }

    async fn suspend_locked(&self, noflush: bool, nolockfs: bool) -> Result<(), Error> {
        if self.is_suspended_locked().await? {
            return Ok(());
        }
        info!("suspending linear dm device {}", self.name);
        dmsetup::suspend(&self.name, noflush, nolockfs, &self.executor).await
    }

    /// Resume the dm device, releasing held I/O onto the (possibly
    /// reloaded) live table.
    pub async fn resume(&self) -> Result<(), Error> {
        let _lock = self.lock().await?;
        self.resume_locked().await
    }

    async fn resume_locked(&self) -> Result<(), Error> {
        info!("resuming linear dm device {}", self.name);
        dmsetup::resume(&self.name, &self.executor).await
    }

    /// Whether the dm device is currently suspended.
    pub async fn is_suspended(&self) -> Result<bool, Error> {
        self.is_suspended_locked().await
    }

    async fn is_suspended_locked(&self) -> Result<bool, Error> {
        let devices = dmsetup::info(&self.name, &self.executor).await?;
        devices
            .iter()
            .find(|device| device.name == self.name)
            .map(|device| device.suspended)
            .ok_or_else(|| Error::DmDeviceNotFound {
                name: self.name.clone(),
            })
    }

    /// Recompute the linear table from the current namespace and load it
    /// into the inactive slot. Takes effect on the next resume; this does
    /// not suspend or resume by itself.
    pub async fn reload_dm_device(&self) -> Result<(), Error> {
        let _lock = self.lock().await?;
        self.reload_linear_dm_device().await
    }

    async fn reload_linear_dm_device(&self) -> Result<(), Error> {
        let Some(dev) = &self.dev else {
            return error::NoBackingDeviceSnafu {
                name: self.name.clone(),
            }
            .fail();
        };
        let dev_path = device::device_path(&dev.nvme.name);
        let sectors = device::get_device_sectors(&dev_path, &self.executor).await?;
        let table = dmsetup::linear_table(sectors, &dev_path);

        info!(
            "reloading linear dm device {} with table '{}'",
            self.name, table
        );
        dmsetup::reload(&self.name, &table, &self.executor).await
    }

    /// Poll until the namespace is attached and resolvable.
    pub async fn wait_for_connect(
        &mut self,
        max_retries: u32,
        retry_interval: Duration,
    ) -> Result<(), Error> {
        let _lock = self.lock().await?;

        let mut last_err = None;
        for _ in 0 .. max_retries {
            let (addr, svc, nqn) = (
                self.transport_address.clone(),
                self.transport_service_id.clone(),
                self.subsystem_nqn.clone(),
            );
            match self.load_device_info(&addr, &svc, &nqn).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    sleep(retry_interval).await;
                }
            }
        }
        match last_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Poll until the subsystem is gone, recognized by the typed
    /// device-not-found error from enumeration.
    pub async fn wait_for_disconnect(
        &mut self,
        max_retries: u32,
        retry_interval: Duration,
    ) -> Result<(), Error> {
        let _lock = self.lock().await?;

        for _ in 0 .. max_retries {
            let (addr, svc, nqn) = (
                self.transport_address.clone(),
                self.transport_service_id.clone(),
                self.subsystem_nqn.clone(),
            );
            match self.load_device_info(&addr, &svc, &nqn).await {
                Err(err) if err.is_valid_nvme_device_not_found() => return Ok(()),
                _ => sleep(retry_interval).await,
            }
        }
        error::StillConnectedSnafu {
            nqn: self.subsystem_nqn.clone(),
            retries: max_retries,
        }
        .fail()
    }
}

impl Drop for Initiator {
    fn drop(&mut self) {
        if let Ok(mut active) = ACTIVE_INITIATORS.lock() {
            active.remove(&self.name);
        }
    }
}

async fn validate_device_creation(path: &Path, retries: u32) -> Result<(), Error> {
    for _ in 0 .. retries {
        if device::is_block_device(path) {
            return Ok(());
        }
        sleep(Duration::from_secs(1)).await;
    }
    error::DeviceValidationSnafu {
        path: path.to_path_buf(),
    }
    .fail()
}
