//! Device lifecycle: the dedupe class and its control requests.
//!
//! A [`DedupeClass`] owns one content store (the dedupe domain) and every
//! device created against it. Topology changes (create, destroy, attach,
//! orphan, wipe) are serialized by one async mutex; I/O never takes it.
//!
//! Destroying a device detaches it: its block map stays in the store and is
//! persisted with every checkpoint, so `attach_existing` on the labelled
//! provider brings the data back. Only `wipe` gives the blocks up.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::{DedupeConfig, DeviceOptions};
use crate::content_store::ContentStore;
use crate::debug::DebugLevel;
use crate::dedupe_debug;
use crate::device::{provider_name, DedupeDevice, DeviceInfo, PROVIDER_PREFIX};
use crate::error::{DedupeError, DedupeResult, ErrorKind};
use crate::metadata::{clear_label, label_offset, read_label, validate_name, write_label, Label};
use crate::pipeline::DeviceIo;
use crate::provider::{Provider, ProviderRegistry};

/// Class name used in log output.
pub const CLASS_NAME: &str = "DEDUPE";

/// Operations the class exposes to the control plane.
#[async_trait]
pub trait ClassOps: Send + Sync {
    /// Create device `name` over `provider` and label the provider.
    async fn create(&self, name: &str, provider: &str) -> DedupeResult<Arc<DedupeDevice>>;

    /// Detach device `name`, keeping its mappings. Fails with `Busy` if
    /// open and not forced.
    async fn destroy(&self, name: &str, force: bool) -> DedupeResult<()>;

    /// Drop the mappings of detached device `name` and clear its label.
    /// Returns how many references were released.
    async fn wipe(&self, name: &str) -> DedupeResult<usize>;

    /// Attach a device from the label on `provider`.
    async fn attach_existing(&self, provider: &str) -> DedupeResult<Arc<DedupeDevice>>;

    /// Look for a dedupe label on `provider`.
    async fn taste(&self, provider: &str) -> DedupeResult<Option<Label>>;

    /// The underlying `provider` went away: force-destroy its devices.
    /// Every victim is destroyed even if one fails; the first error wins.
    async fn orphan(&self, provider: &str) -> DedupeResult<Vec<String>>;

    /// Apply `key=value` options to device `name`.
    fn configure(&self, name: &str, settings: &[String]) -> DedupeResult<DeviceOptions>;

    /// Configuration dump of device `name`.
    fn dumpconf(&self, name: &str) -> DedupeResult<DeviceInfo>;

    /// Names of live devices, sorted.
    fn list(&self) -> Vec<String>;
}

/// Structured error recorded on a failed control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtlError {
    /// Error kind
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

/// A control request: named string arguments plus an error slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CtlRequest {
    args: BTreeMap<String, String>,
    /// Set when the request failed
    pub error: Option<CtlError>,
}

impl CtlRequest {
    /// Empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Argument by name.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> DedupeResult<&str> {
        self.arg(key)
            .ok_or_else(|| DedupeError::invalid(format!("missing argument {:?}", key)))
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.arg(key), Some("1" | "true" | "yes"))
    }

    /// Record `err` in the error slot.
    pub fn set_error(&mut self, err: &DedupeError) {
        self.error = Some(CtlError {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

/// The dedupe class: content store, devices and debug level.
pub struct DedupeClass {
    config: DedupeConfig,
    registry: Arc<ProviderRegistry>,
    store: Arc<ContentStore>,
    devices: DashMap<String, Arc<DedupeDevice>>,
    dbg: Arc<DebugLevel>,
    topology: AsyncMutex<()>,
}

impl DedupeClass {
    /// Load the class with its content store on provider `store_backing`,
    /// restoring the block maps of its last checkpoint.
    pub async fn init(
        config: DedupeConfig,
        registry: Arc<ProviderRegistry>,
        store_backing: &str,
    ) -> DedupeResult<Self> {
        config.validate()?;
        let backing = registry.get(store_backing)?;
        let store = Arc::new(ContentStore::open(config.store_config(), backing).await?);
        let dbg = Arc::new(DebugLevel::new(config.debug_level));
        info!(
            class = CLASS_NAME,
            store = store_backing,
            block_size = config.block_size,
            debug = config.debug_level,
            volumes = store.volume_names().len(),
            generation = store.stats().generation,
            "class loaded"
        );
        Ok(Self {
            config,
            registry,
            store,
            devices: DashMap::new(),
            dbg,
            topology: AsyncMutex::new(()),
        })
    }

    /// Unload: detach every device, commit a final checkpoint and reset the
    /// debug level.
    pub async fn fini(&self) -> DedupeResult<()> {
        let _topo = self.topology.lock().await;
        let mut first_err = None;
        for name in self.list() {
            if let Err(e) = self.detach_locked(&name, true).await {
                warn!(device = %name, error = %e, "destroy on unload failed");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.store.checkpoint().await {
            warn!(error = %e, "checkpoint on unload failed");
            first_err.get_or_insert(e);
        }
        self.dbg.reset();
        info!(class = CLASS_NAME, "class unloaded");
        first_err.map_or(Ok(()), Err)
    }

    /// Class configuration.
    pub fn config(&self) -> &DedupeConfig {
        &self.config
    }

    /// The provider namespace.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The shared content store.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// The class debug level.
    pub fn debug_level(&self) -> &Arc<DebugLevel> {
        &self.dbg
    }

    /// Live device by name.
    pub fn device(&self, name: &str) -> DedupeResult<Arc<DedupeDevice>> {
        self.devices
            .get(name)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| DedupeError::ProviderNotFound {
                name: provider_name(name),
            })
    }

    fn consumer_of(&self, provider: &str) -> Option<String> {
        self.devices
            .iter()
            .find(|d| d.value().consumer().name() == provider)
            .map(|d| d.key().clone())
    }

    /// Check `pp` can carry a device; any failure is `AttachFailed`.
    fn check_attach(&self, pp: &Arc<dyn Provider>) -> DedupeResult<()> {
        let fail = |reason: String| DedupeError::AttachFailed {
            provider: pp.name().to_string(),
            reason,
        };
        if pp.access_counts().exclusive > 0 {
            return Err(fail("provider is open exclusively".to_string()));
        }
        if let Some(owner) = self.consumer_of(pp.name()) {
            return Err(fail(format!("already consumed by {}", provider_name(&owner))));
        }
        if let Some(stacked) = pp.name().strip_prefix(PROVIDER_PREFIX) {
            if self.device(stacked).map(|d| d.io().is_orphaned()).unwrap_or(false) {
                return Err(fail("provider is orphaned".to_string()));
            }
        }
        let sector = pp.sector_size();
        if sector == 0 || self.config.block_size % sector != 0 {
            return Err(fail(format!(
                "sector size {} incompatible with block size {}",
                sector, self.config.block_size
            )));
        }
        if pp.media_size() < sector as u64 + self.config.block_size as u64 {
            return Err(fail(format!("media size {} too small", pp.media_size())));
        }
        Ok(())
    }

    /// Build and register a device for `label` over `pp`.
    fn attach(&self, label: Label, pp: Arc<dyn Provider>) -> DedupeResult<Arc<DedupeDevice>> {
        let exposed = provider_name(&label.name);
        let media_size = label_offset(pp.as_ref())?;
        let io = DeviceIo::new(
            exposed.clone(),
            media_size,
            self.config.lock_stripes,
            self.store.volume(&label.name),
            Arc::clone(&self.store),
            pp,
            Arc::clone(&self.dbg),
        )?;
        let device = Arc::new(DedupeDevice::new(label, io));
        self.registry.insert(device.clone())?;
        self.devices
            .insert(device.device_name().to_string(), device.clone());
        Ok(device)
    }

    async fn create_locked(&self, name: &str, provider: &str) -> DedupeResult<Arc<DedupeDevice>> {
        validate_name(name)?;
        let exposed = provider_name(name);
        if self.devices.contains_key(name)
            || self.registry.contains(&exposed)
            || self.store.has_volume(name)
        {
            return Err(DedupeError::AlreadyExists { name: exposed });
        }
        let pp = self.registry.get(provider)?;
        dedupe_debug!(
            self.dbg,
            1,
            provider = %pp.name(),
            sector_size = pp.sector_size(),
            media_size = pp.media_size(),
            "using provider"
        );
        self.check_attach(&pp)?;

        let label = Label::new(name, pp.media_size())?;
        write_label(pp.as_ref(), &label)
            .await
            .map_err(|e| DedupeError::AttachFailed {
                provider: provider.to_string(),
                reason: format!("writing label: {}", e),
            })?;

        match self.attach(label, Arc::clone(&pp)) {
            Ok(device) => {
                info!(device = %exposed, provider, "device created");
                Ok(device)
            }
            Err(e) => {
                if let Err(clear) = clear_label(pp.as_ref()).await {
                    warn!(provider, error = %clear, "clearing label after failed create");
                }
                self.store.drop_volume(name).await?;
                Err(e)
            }
        }
    }

    async fn destroy_locked(&self, name: &str, force: bool) -> DedupeResult<()> {
        if !force {
            self.check_detach(name)?;
            self.store.checkpoint().await?;
        }
        self.detach_locked(name, force).await?;
        if force {
            self.store.checkpoint().await?;
        }
        info!(device = %provider_name(name), "device destroyed");
        Ok(())
    }

    /// Fail with `Busy` if device `name` is open or consumed.
    fn check_detach(&self, name: &str) -> DedupeResult<()> {
        let device = self.device(name)?;
        let exposed = provider_name(name);
        let access = device.access_counts();
        if access.is_open() {
            return Err(DedupeError::Busy {
                name: exposed,
                reason: format!(
                    "open r{}w{}e{}",
                    access.read, access.write, access.exclusive
                ),
            });
        }
        if let Some(upper) = self.consumer_of(&exposed) {
            return Err(DedupeError::Busy {
                name: exposed,
                reason: format!("consumed by {}", provider_name(&upper)),
            });
        }
        Ok(())
    }

    /// Unregister device `name` and stop its I/O; its map stays in the store.
    async fn detach_locked(&self, name: &str, force: bool) -> DedupeResult<()> {
        if !force {
            self.check_detach(name)?;
        }
        let device = self.device(name)?;
        let exposed = provider_name(name);
        let access = device.access_counts();
        if access.is_open() {
            warn!(device = %exposed, ?access, "destroying open device");
        }
        if let Some(upper) = self.consumer_of(&exposed) {
            self.device(&upper)?.orphan();
        }

        self.registry.remove(&exposed);
        self.devices.remove(name);
        device.detach().await;
        Ok(())
    }

    async fn wipe_locked(&self, name: &str) -> DedupeResult<usize> {
        let exposed = provider_name(name);
        if self.devices.contains_key(name) {
            return Err(DedupeError::Busy {
                name: exposed,
                reason: "device is attached".to_string(),
            });
        }
        if !self.store.has_volume(name) {
            return Err(DedupeError::ProviderNotFound { name: exposed });
        }

        for provider in self.registry.names() {
            if provider == self.store.backing().name() || self.consumer_of(&provider).is_some() {
                continue;
            }
            match self.taste_label(&provider).await {
                Ok(Some(label)) if label.name == name => {
                    let cleared = match self.registry.get(&provider) {
                        Ok(pp) => clear_label(pp.as_ref()).await,
                        Err(e) => Err(e),
                    };
                    match cleared {
                        Ok(()) => dedupe_debug!(self.dbg, 1, provider = %provider, "label cleared"),
                        Err(e) => warn!(provider = %provider, error = %e, "clearing label failed"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(provider = %provider, error = %e, "taste during wipe failed"),
            }
        }

        let released = self.store.drop_volume(name).await?;
        self.store.checkpoint().await?;
        info!(device = %exposed, released, "device wiped");
        Ok(released)
    }

    async fn attach_existing_locked(&self, provider: &str) -> DedupeResult<Arc<DedupeDevice>> {
        let pp = self.registry.get(provider)?;
        let label = read_label(pp.as_ref()).await?;
        if pp.media_size() < label.provider_size {
            return Err(DedupeError::AttachFailed {
                provider: provider.to_string(),
                reason: format!(
                    "provider shrank from {} to {} bytes",
                    label.provider_size,
                    pp.media_size()
                ),
            });
        }
        let exposed = provider_name(&label.name);
        if self.devices.contains_key(&label.name) || self.registry.contains(&exposed) {
            return Err(DedupeError::AlreadyExists { name: exposed });
        }
        self.check_attach(&pp)?;
        let known = self.store.has_volume(&label.name);
        if !known {
            warn!(device = %exposed, provider, "no stored block map, attaching empty");
        }
        let name = label.name.clone();
        match self.attach(label, pp) {
            Ok(device) => {
                info!(device = %exposed, provider, "device attached");
                Ok(device)
            }
            Err(e) => {
                if !known {
                    self.store.drop_volume(&name).await?;
                }
                Err(e)
            }
        }
    }

    async fn taste_label(&self, provider: &str) -> DedupeResult<Option<Label>> {
        let pp = self.registry.get(provider)?;
        if pp.media_size() < pp.sector_size() as u64 {
            return Ok(None);
        }
        match read_label(pp.as_ref()).await {
            Ok(label) => {
                dedupe_debug!(self.dbg, 1, provider, name = %label.name, "label found");
                Ok(Some(label))
            }
            Err(DedupeError::InvalidMetadata { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Offer every registered provider to taste and attach those carrying a
    /// label. Our own exposed providers, the store's backing provider and
    /// providers already consumed are skipped. Returns attached device names.
    pub async fn taste_all(&self) -> Vec<String> {
        let _topo = self.topology.lock().await;
        let mut attached = Vec::new();
        for provider in self.registry.names() {
            if provider.starts_with(PROVIDER_PREFIX)
                || provider == self.store.backing().name()
                || self.consumer_of(&provider).is_some()
            {
                continue;
            }
            match self.taste_label(&provider).await {
                Ok(Some(_)) => match self.attach_existing_locked(&provider).await {
                    Ok(device) => attached.push(device.device_name().to_string()),
                    Err(e) => warn!(provider = %provider, error = %e, "taste attach failed"),
                },
                Ok(None) => {}
                Err(e) => warn!(provider = %provider, error = %e, "taste failed"),
            }
        }
        attached
    }

    /// Run a control verb. Failures land in `req.error`.
    pub async fn ctl(&self, verb: &str, req: &mut CtlRequest) {
        dedupe_debug!(self.dbg, 1, verb, "ctl request");
        req.error = None;
        let result = match verb {
            "create" => match (req.require("arg0"), req.require("arg1")) {
                (Ok(name), Ok(provider)) => self.create(name, provider).await.map(|_| ()),
                (Err(e), _) | (_, Err(e)) => Err(e),
            },
            "destroy" => match req.require("arg0") {
                Ok(name) => self.destroy(name, req.flag("force")).await,
                Err(e) => Err(e),
            },
            "wipe" => match req.require("arg0") {
                Ok(name) => self.wipe(name).await.map(|_| ()),
                Err(e) => Err(e),
            },
            "configure" => match (req.require("arg0"), req.require("options")) {
                (Ok(name), Ok(options)) => {
                    let settings: Vec<String> = options
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                    self.configure(name, &settings).map(|_| ())
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            },
            other => Err(DedupeError::invalid(format!("unknown verb {:?}", other))),
        };
        if let Err(e) = result {
            warn!(verb, error = %e, "ctl request failed");
            req.set_error(&e);
        }
    }
}

#[async_trait]
impl ClassOps for DedupeClass {
    async fn create(&self, name: &str, provider: &str) -> DedupeResult<Arc<DedupeDevice>> {
        let _topo = self.topology.lock().await;
        self.create_locked(name, provider).await
    }

    async fn destroy(&self, name: &str, force: bool) -> DedupeResult<()> {
        let _topo = self.topology.lock().await;
        self.destroy_locked(name, force).await
    }

    async fn wipe(&self, name: &str) -> DedupeResult<usize> {
        let _topo = self.topology.lock().await;
        self.wipe_locked(name).await
    }

    async fn attach_existing(&self, provider: &str) -> DedupeResult<Arc<DedupeDevice>> {
        let _topo = self.topology.lock().await;
        self.attach_existing_locked(provider).await
    }

    async fn taste(&self, provider: &str) -> DedupeResult<Option<Label>> {
        let _topo = self.topology.lock().await;
        self.taste_label(provider).await
    }

    async fn orphan(&self, provider: &str) -> DedupeResult<Vec<String>> {
        let _topo = self.topology.lock().await;
        self.registry.remove(provider);
        let victims: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.value().consumer().name() == provider)
            .map(|d| d.key().clone())
            .collect();
        let mut first_err = None;
        for name in &victims {
            let detached = match self.device(name) {
                Ok(device) => {
                    device.orphan();
                    self.detach_locked(name, true).await
                }
                Err(e) => Err(e),
            };
            match detached {
                Ok(()) => info!(device = %provider_name(name), provider, "device destroyed"),
                Err(e) => {
                    warn!(device = %provider_name(name), error = %e, "destroy of orphan failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        if !victims.is_empty() {
            if let Err(e) = self.store.checkpoint().await {
                warn!(provider, error = %e, "checkpoint after orphan failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(victims), Err)
    }

    fn configure(&self, name: &str, settings: &[String]) -> DedupeResult<DeviceOptions> {
        let device = self.device(name)?;
        let options = device.options().apply(settings)?;
        device.set_options(options);
        info!(device = %provider_name(name), ?options, "device configured");
        Ok(options)
    }

    fn dumpconf(&self, name: &str) -> DedupeResult<DeviceInfo> {
        Ok(self.device(name)?.info())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.iter().map(|d| d.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{IoFaults, MemProvider};
    use bytes::Bytes;

    const MIB: u64 = 1 << 20;

    async fn class_over(providers: &[Arc<MemProvider>]) -> DedupeClass {
        let registry = Arc::new(ProviderRegistry::new());
        for p in providers {
            registry.insert(p.clone()).unwrap();
        }
        DedupeClass::init(DedupeConfig::default(), registry, "pool0")
            .await
            .unwrap()
    }

    fn providers() -> Vec<Arc<MemProvider>> {
        vec![
            Arc::new(MemProvider::new("pool0", 512, 16 * MIB)),
            Arc::new(MemProvider::new("md0", 512, 4 * MIB)),
            Arc::new(MemProvider::new("md1", 512, 4 * MIB)),
        ]
    }

    async fn class() -> DedupeClass {
        class_over(&providers()).await
    }

    #[tokio::test]
    async fn test_create_registers_provider() {
        let class = class().await;
        let dev = class.create("dd0", "md0").await.unwrap();
        assert_eq!(dev.name(), "dedupe/dd0");
        assert_eq!(dev.media_size(), 4 * MIB - 512);
        assert_eq!(dev.sector_size(), 512);
        assert!(class.registry().contains("dedupe/dd0"));
        assert_eq!(class.list(), vec!["dd0".to_string()]);

        let md0 = class.registry().get("md0").unwrap();
        let label = read_label(md0.as_ref()).await.unwrap();
        assert_eq!(label.name, "dd0");
        assert_eq!(label.provider_size, 4 * MIB);
    }

    #[tokio::test]
    async fn test_create_errors() {
        let class = class().await;
        assert!(matches!(
            class.create("dd0", "nope").await,
            Err(DedupeError::ProviderNotFound { .. })
        ));
        class.create("dd0", "md0").await.unwrap();
        assert!(matches!(
            class.create("dd0", "md1").await,
            Err(DedupeError::AlreadyExists { .. })
        ));
        assert!(matches!(
            class.create("dd1", "md0").await,
            Err(DedupeError::AttachFailed { .. })
        ));
        assert!(matches!(
            class.create("much-too-long-name", "md1").await,
            Err(DedupeError::InvalidRequest { .. })
        ));
        assert_eq!(class.list().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_exclusive_and_small_providers() {
        let class = class().await;
        class.registry().get("md1").unwrap().access(0, 0, 1).unwrap();
        assert!(matches!(
            class.create("dd1", "md1").await,
            Err(DedupeError::AttachFailed { .. })
        ));

        class
            .registry()
            .insert(Arc::new(MemProvider::new("tiny", 512, 1024)))
            .unwrap();
        assert!(matches!(
            class.create("dd2", "tiny").await,
            Err(DedupeError::AttachFailed { .. })
        ));

        class
            .registry()
            .insert(Arc::new(MemProvider::new("ssd0", 8192, 4 * MIB)))
            .unwrap();
        assert!(matches!(
            class.create("dd3", "ssd0").await,
            Err(DedupeError::AttachFailed { .. })
        ));
        assert!(class.list().is_empty());
        assert!(!class.registry().contains("dedupe/dd1"));
    }

    #[tokio::test]
    async fn test_destroy_busy_unless_forced() {
        let class = class().await;
        let dev = class.create("dd0", "md0").await.unwrap();
        dev.write_at(0, Bytes::from(vec![1u8; 4096])).await.unwrap();
        dev.access(1, 0, 0).unwrap();

        assert!(matches!(
            class.destroy("dd0", false).await,
            Err(DedupeError::Busy { .. })
        ));
        class.destroy("dd0", true).await.unwrap();
        assert!(class.list().is_empty());
        assert!(!class.registry().contains("dedupe/dd0"));
        assert_eq!(class.store().len(), 1);
        assert!(class.store().has_volume("dd0"));
        assert!(!class.registry().get("md0").unwrap().access_counts().is_open());
        assert!(matches!(
            class.destroy("dd0", false).await,
            Err(DedupeError::ProviderNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_attach_existing_after_destroy() {
        let class = class().await;
        let dev = class.create("dd0", "md0").await.unwrap();
        dev.write_at(8192, Bytes::from(vec![0x5Au8; 4096])).await.unwrap();
        class.destroy("dd0", false).await.unwrap();
        assert!(class.store().stats().generation >= 1);

        let dev = class.attach_existing("md0").await.unwrap();
        assert_eq!(dev.device_name(), "dd0");
        assert_eq!(dev.read_at(8192, 4096).await.unwrap(), Bytes::from(vec![0x5Au8; 4096]));
        assert_eq!(dev.info().mapped_blocks, 1);
        assert!(matches!(
            class.attach_existing("md1").await,
            Err(DedupeError::InvalidMetadata { .. })
        ));
    }

    #[tokio::test]
    async fn test_attach_existing_version_mismatch() {
        let class = class().await;
        let md1 = class.registry().get("md1").unwrap();
        let mut raw = Label::new("old", 4 * MIB).unwrap().encode(512).unwrap().to_vec();
        raw[16..20].copy_from_slice(&9u32.to_le_bytes());
        md1.write_at(4 * MIB - 512, Bytes::from(raw)).await.unwrap();
        assert!(matches!(
            class.attach_existing("md1").await,
            Err(DedupeError::VersionMismatch { found: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_attach_existing_shrunk_provider() {
        let class = class().await;
        let label = Label::new("dd9", 8 * MIB).unwrap();
        let md1 = class.registry().get("md1").unwrap();
        write_label(md1.as_ref(), &label).await.unwrap();
        assert!(matches!(
            class.attach_existing("md1").await,
            Err(DedupeError::AttachFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_taste_all() {
        let class = class().await;
        class.create("dd0", "md0").await.unwrap();
        class.destroy("dd0", false).await.unwrap();
        write_label(
            class.registry().get("md1").unwrap().as_ref(),
            &Label::new("dd1", 4 * MIB).unwrap(),
        )
        .await
        .unwrap();

        assert!(class.taste("md0").await.unwrap().is_some());
        assert!(class.taste("pool0").await.unwrap().is_none());

        let attached = class.taste_all().await;
        assert_eq!(attached, vec!["dd0".to_string(), "dd1".to_string()]);
        assert!(class.taste_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_configure() {
        let class = class().await;
        class.create("dd0", "md0").await.unwrap();
        let opts = class
            .configure("dd0", &["rfailprob=5".to_string(), "wfailprob=7".to_string()])
            .unwrap();
        assert_eq!(opts.read_fail_prob, 5);
        assert_eq!(class.dumpconf("dd0").unwrap().options.write_fail_prob, 7);
        assert!(matches!(
            class.configure("dd0", &["nope=1".to_string()]),
            Err(DedupeError::InvalidRequest { .. })
        ));
        assert!(class.configure("dd9", &[]).is_err());
    }

    #[tokio::test]
    async fn test_orphan_destroys_consumers() {
        let class = class().await;
        let dev = class.create("dd0", "md0").await.unwrap();
        dev.write_at(0, Bytes::from(vec![2u8; 4096])).await.unwrap();
        dev.access(1, 1, 0).unwrap();

        let gone = class.orphan("md0").await.unwrap();
        assert_eq!(gone, vec!["dd0".to_string()]);
        assert!(class.list().is_empty());
        assert!(!class.registry().contains("md0"));
        assert_eq!(class.store().len(), 1);
        assert!(class.store().has_volume("dd0"));
        assert!(matches!(
            dev.read_at(0, 4096).await,
            Err(DedupeError::IoError { .. })
        ));
    }

    #[tokio::test]
    async fn test_orphan_destroys_victims_despite_commit_failure() {
        let providers = providers();
        let class = class_over(&providers).await;
        let dev = class.create("dd0", "md0").await.unwrap();
        dev.write_at(0, Bytes::from(vec![2u8; 4096])).await.unwrap();
        providers[0].inject_faults(IoFaults {
            fail_flushes: true,
            ..IoFaults::default()
        });

        assert!(matches!(
            class.orphan("md0").await,
            Err(DedupeError::IoError { .. })
        ));
        assert!(class.list().is_empty());
        assert!(!class.registry().contains("dedupe/dd0"));
        assert!(dev.io().is_orphaned());
    }

    #[tokio::test]
    async fn test_destroy_aborts_when_commit_fails() {
        let providers = providers();
        let class = class_over(&providers).await;
        class.create("dd0", "md0").await.unwrap();
        providers[0].inject_faults(IoFaults {
            fail_flushes: true,
            ..IoFaults::default()
        });
        assert!(class.destroy("dd0", false).await.is_err());
        assert_eq!(class.list(), vec!["dd0".to_string()]);

        providers[0].inject_faults(IoFaults::default());
        class.destroy("dd0", false).await.unwrap();
        assert!(class.list().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_detached_name() {
        let class = class().await;
        class.create("dd0", "md0").await.unwrap();
        class.destroy("dd0", false).await.unwrap();
        assert!(matches!(
            class.create("dd0", "md1").await,
            Err(DedupeError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_wipe() {
        let class = class().await;
        let dev = class.create("dd0", "md0").await.unwrap();
        dev.write_at(0, Bytes::from(vec![7u8; 8192])).await.unwrap();
        assert!(matches!(
            class.wipe("dd0").await,
            Err(DedupeError::Busy { .. })
        ));

        class.destroy("dd0", false).await.unwrap();
        assert_eq!(class.wipe("dd0").await.unwrap(), 2);
        assert!(class.store().is_empty());
        assert!(!class.store().has_volume("dd0"));
        assert!(class.taste("md0").await.unwrap().is_none());
        assert!(matches!(
            class.wipe("dd0").await,
            Err(DedupeError::ProviderNotFound { .. })
        ));

        // The name is free again.
        class.create("dd0", "md1").await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_restores_devices() {
        let providers = providers();
        {
            let class = class_over(&providers).await;
            let dd0 = class.create("dd0", "md0").await.unwrap();
            let dd1 = class.create("dd1", "md1").await.unwrap();
            dd0.write_at(0, Bytes::from(vec![1u8; 8192])).await.unwrap();
            dd1.write_at(4096, Bytes::from(vec![1u8; 4096])).await.unwrap();
            dd0.flush().await.unwrap();
        }

        let class = class_over(&providers).await;
        assert_eq!(class.store().volume_names(), vec!["dd0".to_string(), "dd1".to_string()]);
        assert_eq!(class.taste_all().await, vec!["dd0".to_string(), "dd1".to_string()]);
        let dd1 = class.device("dd1").unwrap();
        assert_eq!(dd1.read_at(4096, 4096).await.unwrap(), Bytes::from(vec![1u8; 4096]));

        let mapped: u64 = class
            .list()
            .iter()
            .map(|name| class.device(name).unwrap().info().mapped_blocks as u64)
            .sum();
        let refs: u64 = class.store().snapshot().await.iter().map(|(_, n)| n).sum();
        assert_eq!(mapped, 3);
        assert_eq!(refs, mapped);
    }

    #[tokio::test]
    async fn test_stacked_device() {
        let class = class().await;
        class.create("lower", "md0").await.unwrap();
        let upper = class.create("upper", "dedupe/lower").await.unwrap();
        assert_eq!(upper.media_size(), 4 * MIB - 1024);
        upper.write_at(0, Bytes::from(vec![4u8; 4096])).await.unwrap();
        assert_eq!(upper.read_at(0, 4096).await.unwrap(), Bytes::from(vec![4u8; 4096]));

        assert!(matches!(
            class.destroy("lower", false).await,
            Err(DedupeError::Busy { .. })
        ));
        class.destroy("lower", true).await.unwrap();
        assert!(class.dumpconf("upper").unwrap().orphaned);
        class.destroy("upper", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_ctl_dispatch() {
        let class = class().await;
        let mut req = CtlRequest::new().with_arg("arg0", "dd0").with_arg("arg1", "md0");
        class.ctl("create", &mut req).await;
        assert!(req.error.is_none());

        let mut req = CtlRequest::new()
            .with_arg("arg0", "dd0")
            .with_arg("options", "rfailprob=1, wfailprob=2");
        class.ctl("configure", &mut req).await;
        assert!(req.error.is_none());
        assert_eq!(class.dumpconf("dd0").unwrap().options.write_fail_prob, 2);

        let mut req = CtlRequest::new().with_arg("arg0", "dd0").with_arg("arg1", "md1");
        class.ctl("create", &mut req).await;
        assert_eq!(req.error.as_ref().unwrap().kind, ErrorKind::AlreadyExists);

        let mut req = CtlRequest::new().with_arg("arg0", "dd0");
        class.ctl("frobnicate", &mut req).await;
        assert_eq!(req.error.as_ref().unwrap().kind, ErrorKind::InvalidRequest);

        let mut req = CtlRequest::new();
        class.ctl("destroy", &mut req).await;
        assert_eq!(req.error.as_ref().unwrap().kind, ErrorKind::InvalidRequest);

        let mut req = CtlRequest::new().with_arg("arg0", "dd0").with_arg("force", "1");
        class.ctl("destroy", &mut req).await;
        assert!(req.error.is_none());
        assert!(class.list().is_empty());

        let mut req = CtlRequest::new().with_arg("arg0", "dd0");
        class.ctl("wipe", &mut req).await;
        assert!(req.error.is_none());
        class.ctl("wipe", &mut req).await;
        assert_eq!(req.error.as_ref().unwrap().kind, ErrorKind::ProviderNotFound);
    }

    #[tokio::test]
    async fn test_init_and_fini() {
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .insert(Arc::new(MemProvider::new("pool0", 512, 4 * MIB)))
            .unwrap();
        registry
            .insert(Arc::new(MemProvider::new("md0", 512, 4 * MIB)))
            .unwrap();
        let config = DedupeConfig {
            debug_level: 2,
            ..DedupeConfig::default()
        };
        assert!(DedupeClass::init(config.clone(), registry.clone(), "missing")
            .await
            .is_err());

        let class = DedupeClass::init(config, registry, "pool0").await.unwrap();
        assert_eq!(class.debug_level().get(), 2);
        class.create("dd0", "md0").await.unwrap();
        class.fini().await.unwrap();
        assert!(class.list().is_empty());
        assert_eq!(class.debug_level().get(), 0);
        assert_eq!(class.store().stats().generation, 1);
    }
}
