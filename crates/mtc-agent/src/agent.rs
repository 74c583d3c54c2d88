//! Agent kernel
//!
//! Owns the device registry, the data-item lookup map (weak handles only),
//! the circular observation buffer, and the asset store. All kernel state is
//! mutated through the methods here; sources and sinks call in from their
//! own tasks and never hold a kernel lock across a suspension point.
//!
//! Lock order: registry -> data_items -> buffer | assets. The buffer lock is
//! held across sink fan-out so sinks see admissions in sequence order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use chrono::{Local, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use mtc_buffer::{AssetBuffer, CircularBuffer};
use mtc_config::AgentConfig;
use mtc_model::{
    Asset, DataItem, DataSet, DataSetEntry, DataSetValue, Device, DeviceRegistry, Observation,
    SchemaVersion, Value, AVAILABLE, UNAVAILABLE,
};
use mtc_pipeline::{
    AgentCommand, AssetCommand, ConnectionStatus, PipelineContract,
};
use mtc_printer::{DocumentHeader, JsonPrinter, Printer, XmlPrinter};

use crate::agent_device;
use crate::loopback::LoopbackSource;
use crate::sink::Sink;
use crate::source::Source;
use crate::{AgentError, Result};

pub struct Agent {
    device_xml_path: PathBuf,
    version_device_xml: bool,
    disable_agent_device: bool,
    advertised_address: String,
    configured_version: Option<SchemaVersion>,
    instance_id: u64,
    buffer_capacity: usize,
    asset_capacity: usize,

    schema_version: RwLock<SchemaVersion>,
    registry: RwLock<DeviceRegistry>,
    data_items: RwLock<AHashMap<String, Weak<DataItem>>>,
    buffer: Mutex<CircularBuffer>,
    assets: Mutex<AssetBuffer>,
    printers: HashMap<&'static str, Arc<dyn Printer>>,
    sinks: RwLock<Vec<Arc<dyn Sink>>>,
    sources: Mutex<Vec<Arc<dyn Source>>>,
    loopback: Arc<LoopbackSource>,
    agent_device: RwLock<Option<Arc<Device>>>,

    initialized: AtomicBool,
    observations_initialized: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: Notify,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> Arc<Self> {
        let mut printers: HashMap<&'static str, Arc<dyn Printer>> = HashMap::new();
        printers.insert("xml", Arc::new(XmlPrinter::new(config.pretty)));
        printers.insert(
            "json",
            Arc::new(JsonPrinter::new(config.json_version, config.pretty)),
        );

        let configured_version = config
            .schema_version
            .as_deref()
            .and_then(SchemaVersion::parse);

        Arc::new_cyclic(|weak: &Weak<Agent>| Agent {
            device_xml_path: config.device_xml.clone(),
            version_device_xml: config.version_device_xml_updates,
            disable_agent_device: config.disable_agent_device,
            advertised_address: config.advertised_address(),
            configured_version,
            instance_id: Utc::now().timestamp() as u64,
            buffer_capacity: config.buffer_capacity(),
            asset_capacity: config.max_assets,
            schema_version: RwLock::new(configured_version.unwrap_or(SchemaVersion::DEFAULT)),
            registry: RwLock::new(DeviceRegistry::new()),
            data_items: RwLock::new(AHashMap::new()),
            buffer: Mutex::new(CircularBuffer::new(
                config.buffer_size,
                config.checkpoint_frequency,
            )),
            assets: Mutex::new(AssetBuffer::new(config.max_assets)),
            printers,
            sinks: RwLock::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
            loopback: Arc::new(LoopbackSource::new(weak.clone())),
            agent_device: RwLock::new(None),
            initialized: AtomicBool::new(false),
            observations_initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Load the descriptor, resolve the schema version, create the agent
    /// device, and register every declared device. Failures here are fatal
    /// intake errors (exit code 1 at the binary).
    pub fn initialize(&self) -> Result<()> {
        let xml = std::fs::read_to_string(&self.device_xml_path).map_err(|e| {
            error!(path = %self.device_xml_path.display(), "cannot read device descriptor");
            AgentError::Io(e)
        })?;
        let (document_version, devices) = mtc_model::parse_devices(&xml)?;

        let version = self
            .configured_version
            .or(document_version)
            .unwrap_or(SchemaVersion::DEFAULT);
        *self.schema_version.write() = version;
        for printer in self.printers.values() {
            printer.set_schema_version(version);
        }
        info!(%version, devices = devices.len(), "loaded device descriptor");

        if !self.disable_agent_device && version >= SchemaVersion::V1_7 {
            let device = agent_device::create_agent_device(&self.advertised_address);
            info!(uuid = %device.uuid(), "created agent device");
            *self.agent_device.write() = Some(Arc::clone(&device));
            self.add_device(device)?;
        }

        for device in devices {
            self.add_device(device)?;
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    // --- lifecycle -------------------------------------------------------

    /// Bring up sinks, seed initial observations, then start sources.
    pub async fn start(&self) -> Result<()> {
        let sinks: Vec<_> = self.sinks.read().clone();
        for sink in sinks {
            sink.start().await.map_err(|e| {
                AgentError::SinkStartup(sink.name().to_string(), e.to_string())
            })?;
        }

        self.initial_observations()?;

        if let Some(agent_dev) = self.agent_device.read().clone() {
            if let Some(avail) = agent_dev.data_item_by_name(agent_device::AVAILABILITY_ID) {
                self.loopback.receive(&avail, AVAILABLE);
            }
        }

        let sources: Vec<_> = self.sources.lock().clone();
        for source in sources {
            source.start().await?;
        }
        info!("agent started");
        Ok(())
    }

    /// Stop sources first (no new input), then sinks, then release every
    /// blocked observer with the terminal sentinel.
    pub async fn stop(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down sources");
        let sources: Vec<_> = self.sources.lock().clone();
        for source in sources {
            source.stop().await;
        }

        info!("shutting down sinks");
        let sinks: Vec<_> = self.sinks.read().clone();
        for sink in sinks {
            sink.stop().await;
        }

        info!("signaling observers to close sessions");
        let items: Vec<_> = self
            .data_items
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for item in items {
            item.signal_observers(0);
        }

        self.shutdown.notify_waiters();
        info!("shutdown completed");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Resolves when `stop` ran (from any path, including source failure)
    pub async fn wait_for_shutdown(&self) {
        let notified = self.shutdown.notified();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    /// Seed the initial value of every data item through the loopback, then
    /// announce each device. Idempotent.
    pub fn initial_observations(&self) -> Result<()> {
        if self.observations_initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let devices: Vec<_> = self.registry.read().devices().to_vec();
        for device in &devices {
            self.initialize_data_items(device)?;
        }
        if let Some(agent_dev) = self.agent_device.read().clone() {
            if let Some(added) = agent_dev.data_item_by_name(agent_device::DEVICE_ADDED_ID) {
                for device in &devices {
                    self.loopback.receive(&added, &device.uuid());
                }
            }
        }
        Ok(())
    }

    // --- sources & sinks -------------------------------------------------

    pub fn loopback(&self) -> &Arc<LoopbackSource> {
        &self.loopback
    }

    pub fn add_sink(&self, sink: Arc<dyn Sink>) {
        self.sinks.write().push(sink);
    }

    /// Register a source. Non-loopback sources get an adapter component on
    /// the agent device.
    pub fn add_source(&self, source: Arc<dyn Source>) -> Result<()> {
        let identity = source.identity().to_string();
        self.sources.lock().push(source);

        if let Some(agent_dev) = self.agent_device.read().clone() {
            agent_device::add_adapter(&agent_dev, &identity);
            if self.observations_initialized.load(Ordering::Acquire) {
                self.initialize_data_items(&agent_dev)?;
            }
            self.touch_model();
        }
        Ok(())
    }

    /// A source cannot recover. Remove it; without any remaining external
    /// source the agent has nothing to serve and shuts down.
    pub async fn source_failed(&self, identity: &str) {
        let (failed, externals_remain) = {
            let mut sources = self.sources.lock();
            let failed = sources
                .iter()
                .position(|s| s.identity() == identity)
                .map(|index| sources.remove(index));
            let externals_remain = sources.iter().any(|s| !s.is_loopback());
            (failed, externals_remain)
        };

        let Some(failed) = failed else {
            error!(identity, "cannot find failed source");
            return;
        };
        failed.stop().await;

        if externals_remain {
            error!(identity, "source failed");
        } else {
            error!(identity, "source failed; no external adapters present, shutting down");
            self.stop().await;
        }
    }

    // --- observation path ------------------------------------------------

    /// Admit an observation; on admission fan out to every sink in
    /// registration order. The buffer lock is held across the fan-out so no
    /// sink ever sees sequence S before S-1.
    pub fn receive_observation(&self, observation: Arc<Observation>) {
        let mut buffer = self.buffer.lock();
        if buffer.add_to_buffer(Arc::clone(&observation)) != 0 {
            let sinks = self.sinks.read();
            for sink in sinks.iter() {
                sink.publish_observation(&observation);
            }
        }
    }

    // --- asset path ------------------------------------------------------

    pub fn receive_asset(&self, asset: Arc<Asset>) {
        let device = asset
            .device_uuid()
            .and_then(|key| self.find_device(&key))
            .or_else(|| self.default_device());

        if let Some(device) = &device {
            let uuid = device.uuid();
            let id = asset.asset_id();
            if let Some(rest) = id.strip_prefix('@') {
                asset.set_asset_id(format!("{uuid}{rest}"));
            }
            if asset.device_uuid().as_deref() != Some(uuid.as_str()) {
                asset.set_device_uuid(uuid);
            }
        }

        self.assets.lock().add_asset(Arc::clone(&asset));

        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.publish_asset(&asset);
        }

        if let Some(device) = &device {
            let item = if asset.is_removed() {
                device.asset_removed()
            } else {
                device.asset_changed()
            };
            if let Some(item) = item {
                self.loopback.receive_with(
                    &item,
                    Value::Text(asset.asset_id()),
                    Some(asset.asset_type()),
                    None,
                );
            }
            self.update_asset_counts(device, Some(asset.asset_type()));
        }
    }

    /// Tombstone one asset: fan out, emit ASSET_REMOVED, knock out a stale
    /// ASSET_CHANGED, refresh counts.
    pub fn remove_asset(&self, device: Option<Arc<Device>>, id: &str) -> bool {
        let Some(asset) = self.assets.lock().remove_asset(id) else {
            return false;
        };

        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.publish_asset(&asset);
        }

        self.notify_asset_removed(device.clone(), &asset);

        let device = device.or_else(|| {
            asset
                .device_uuid()
                .and_then(|uuid| self.registry.read().by_uuid(&uuid))
        });
        if let Some(device) = device {
            self.update_asset_counts(&device, Some(asset.asset_type()));
        }
        true
    }

    /// Tombstone every matching asset.
    pub fn remove_all_assets(
        &self,
        device_key: Option<&str>,
        asset_type: Option<&str>,
    ) -> Vec<Arc<Asset>> {
        let device = device_key.and_then(|key| self.find_device(key));
        let uuid = device.as_ref().map(|d| d.uuid());
        let uuid_key = uuid.as_deref().or(device_key);

        let removed = self.assets.lock().remove_all(uuid_key, asset_type, None);

        let sinks = self.sinks.read().clone();
        for asset in &removed {
            for sink in &sinks {
                sink.publish_asset(asset);
            }
            self.notify_asset_removed(None, asset);
        }

        match device {
            Some(device) => self.update_asset_counts(&device, asset_type),
            None => {
                let devices: Vec<_> = self.registry.read().devices().to_vec();
                for device in devices {
                    self.update_asset_counts(&device, asset_type);
                }
            }
        }
        removed
    }

    fn notify_asset_removed(&self, device: Option<Arc<Device>>, asset: &Arc<Asset>) {
        let device = device.or_else(|| {
            asset
                .device_uuid()
                .and_then(|uuid| self.registry.read().by_uuid(&uuid))
        });
        let Some(device) = device else {
            return;
        };
        let Some(removed_item) = device.asset_removed() else {
            return;
        };

        self.loopback.receive_with(
            &removed_item,
            Value::Text(asset.asset_id()),
            Some(asset.asset_type()),
            None,
        );

        if let Some(changed) = device.asset_changed() {
            let last = self.latest(changed.id());
            let matches = last
                .map(|l| !l.is_unavailable() && l.value().to_text() == asset.asset_id())
                .unwrap_or(false);
            if matches {
                self.loopback.receive_with(
                    &changed,
                    Value::Unavailable,
                    Some(asset.asset_type()),
                    None,
                );
            }
        }
    }

    /// Re-emit ASSET_COUNT for a device: a single typed entry, or the whole
    /// per-type map with RESET_COUNTS.
    fn update_asset_counts(&self, device: &Arc<Device>, asset_type: Option<&str>) {
        let Some(count_item) = device.asset_count() else {
            return;
        };
        let uuid = device.uuid();

        let entry = |count: usize| -> DataSetEntry {
            if count > 0 {
                DataSetEntry::value(DataSetValue::Int(count as i64))
            } else {
                DataSetEntry::removed()
            }
        };

        match asset_type {
            Some(asset_type) => {
                let count = self
                    .assets
                    .lock()
                    .count_for_device_and_type(&uuid, asset_type);
                let mut set = DataSet::new();
                set.insert(asset_type.to_string(), entry(count));
                self.loopback
                    .receive_value(&count_item, Value::DataSet(set));
            }
            None => {
                let counts = self.assets.lock().counts_by_type_for_device(&uuid);
                let mut set = DataSet::new();
                for (asset_type, count) in counts {
                    set.insert(asset_type, entry(count));
                }
                self.loopback.receive_with(
                    &count_item,
                    Value::DataSet(set),
                    None,
                    Some("RESET_COUNTS"),
                );
            }
        }
    }

    // --- device intake and update ----------------------------------------

    /// Register a device at startup (or a genuinely new device later).
    /// A duplicate uuid is a fatal intake error.
    pub fn add_device(&self, device: Arc<Device>) -> Result<()> {
        let uuid = device.uuid();
        if self.registry.read().by_uuid(&uuid).is_some() {
            error!(%uuid, "device already exists; in-place re-add is not supported");
            return Err(AgentError::DeviceExists(uuid));
        }

        self.verify_device(&device);
        self.registry.write().add_device(Arc::clone(&device))?;

        if self.observations_initialized.load(Ordering::Acquire) {
            self.initialize_data_items(&device)?;
            if !device.is_agent() {
                self.emit_device_event(agent_device::DEVICE_ADDED_ID, &uuid);
            }
        }

        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.publish_device(&device);
        }
        self.touch_model();
        Ok(())
    }

    /// Diff-and-replace intake from reload or an upstream probe. Returns
    /// `true` when the model changed.
    pub fn receive_device(&self, device: Arc<Device>, version: bool) -> Result<bool> {
        let uuid = device.uuid();
        if uuid.is_empty() {
            error!(name = %device.name(), "received device without a uuid");
            return Ok(false);
        }

        let old = {
            let registry = self.registry.read();
            registry
                .by_uuid(&uuid)
                .or_else(|| registry.by_name(&device.name()))
        };

        let Some(old) = old else {
            info!(%uuid, "received new device, adding");
            self.add_device(device)?;
            if version {
                self.version_device_xml();
            }
            return Ok(true);
        };

        // carry forward the device-level lifecycle items the new tree omits
        // so buffered observations keep their bindings
        if let (Some(item), None) = (old.asset_changed(), device.asset_changed()) {
            device.adopt_data_item(item);
        }
        if let (Some(item), None) = (old.asset_removed(), device.asset_removed()) {
            device.adopt_data_item(item);
        }
        if let (Some(item), None) = (old.availability(), device.availability()) {
            device.adopt_data_item(item);
        }
        if let (Some(item), None) = (old.asset_count(), device.asset_count()) {
            device.adopt_data_item(item);
        }
        self.verify_device(&device);

        debug!(%uuid, "checking if device has changed");
        if device.same_structure(&old) {
            info!(%uuid, "device did not change, ignoring");
            return Ok(false);
        }

        info!(%uuid, "device changed, updating model");
        {
            let mut map = self.data_items.write();
            for item in old.data_items() {
                map.remove(item.id());
            }
        }
        self.registry
            .write()
            .replace_device(&old.uuid(), Arc::clone(&device))?;
        self.initialize_data_items(&device)?;

        debug!(%uuid, "rebinding circular buffer handles");
        {
            let map = self.data_items.read();
            self.buffer.lock().update_data_items(&map);
        }

        if version {
            self.version_device_xml();
        }
        self.emit_device_event(agent_device::DEVICE_CHANGED_ID, &uuid);

        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.publish_device(&device);
        }
        self.touch_model();
        Ok(true)
    }

    /// Re-parse the descriptor. A schema version mismatch rejects the whole
    /// reload; the operator must restart instead.
    pub fn reload_devices(&self, path: &Path) -> Result<bool> {
        let xml = std::fs::read_to_string(path)?;
        let (document_version, devices) = mtc_model::parse_devices(&xml)?;

        if let Some(version) = document_version {
            if version != *self.schema_version.read() {
                warn!(
                    %version,
                    agent_version = %*self.schema_version.read(),
                    "schema version does not match running agent, rejecting reload"
                );
                return Ok(false);
            }
        }

        for device in devices {
            self.receive_device(device, false)?;
        }
        Ok(true)
    }

    /// Ensure the device-level data items the effective schema version
    /// requires, with their deterministic ids.
    fn verify_device(&self, device: &Arc<Device>) {
        let version = *self.schema_version.read();
        let device_id = device.id();

        let make = |id: String, type_name: &str, representation: Option<&str>| {
            let mut attrs: HashMap<String, String> = [
                ("id".to_string(), id),
                ("type".to_string(), type_name.to_string()),
                ("category".to_string(), "EVENT".to_string()),
            ]
            .into();
            if let Some(representation) = representation {
                attrs.insert("representation".to_string(), representation.to_string());
            }
            DataItem::make(&attrs).expect("well-formed required data item")
        };

        if device.availability().is_none() {
            device.add_data_item(make(format!("{device_id}_avail"), "AVAILABILITY", None));
        }
        if device.asset_changed().is_none() && version >= SchemaVersion::V1_2 {
            device.add_data_item(make(format!("{device_id}_asset_chg"), "ASSET_CHANGED", None));
        }
        if version >= SchemaVersion::V1_5 {
            if let Some(changed) = device.asset_changed() {
                if !changed.is_discrete() {
                    changed.make_discrete();
                }
            }
        }
        if device.asset_removed().is_none() && version >= SchemaVersion::V1_3 {
            device.add_data_item(make(
                format!("{device_id}_asset_rem"),
                "ASSET_REMOVED",
                None,
            ));
        }
        if device.asset_count().is_none() && version >= SchemaVersion::V2_0 {
            device.add_data_item(make(
                format!("{device_id}_asset_count"),
                "ASSET_COUNT",
                Some("DATA_SET"),
            ));
        }
        device.attach_items();
    }

    /// Map every data item and seed its initial value: UNAVAILABLE, or the
    /// declared constant. An id bound to a different item is fatal.
    fn initialize_data_items(&self, device: &Arc<Device>) -> Result<()> {
        for item in device.data_items() {
            let existing = self
                .data_items
                .read()
                .get(item.id())
                .and_then(Weak::upgrade);
            match existing {
                Some(existing) if !Arc::ptr_eq(&existing, &item) => {
                    error!(
                        id = item.id(),
                        device = %device.name(),
                        "duplicate data item id"
                    );
                    return Err(AgentError::DuplicateDataItemId(item.id().to_string()));
                }
                Some(_) => {}
                None => {
                    self.data_items
                        .write()
                        .insert(item.id().to_string(), Arc::downgrade(&item));
                    let value = if item.is_condition() {
                        Value::Unavailable
                    } else if let Some(constant) = item.constant_value() {
                        Value::Text(constant.to_string())
                    } else {
                        Value::Unavailable
                    };
                    self.loopback.receive_value(&item, value);
                }
            }
        }
        Ok(())
    }

    /// Back up the descriptor with a local-timestamp suffix and write a
    /// fresh probe document without the agent device.
    fn version_device_xml(&self) {
        if !self.version_device_xml {
            return;
        }
        let suffix = Local::now().format("%Y-%m-%dT%H:%M:%S%.6f");
        let backup = PathBuf::from(format!("{}.{suffix}", self.device_xml_path.display()));
        if !backup.exists() {
            if let Err(e) = std::fs::rename(&self.device_xml_path, &backup) {
                warn!(error = %e, "cannot back up device descriptor");
                return;
            }
        }

        let printer = XmlPrinter::new(true);
        printer.set_schema_version(*self.schema_version.read());
        let devices: Vec<_> = self
            .registry
            .read()
            .devices()
            .iter()
            .filter(|d| !d.is_agent())
            .cloned()
            .collect();
        let probe = printer.print_probe(&devices, &self.document_header());
        if let Err(e) = std::fs::write(&self.device_xml_path, probe) {
            warn!(error = %e, "cannot write device descriptor");
        } else {
            info!(path = %self.device_xml_path.display(), "versioned device descriptor");
        }
    }

    fn emit_device_event(&self, event_id: &str, uuid: &str) {
        if let Some(agent_dev) = self.agent_device.read().clone() {
            if let Some(item) = agent_dev.data_item_by_name(event_id) {
                self.loopback.receive(&item, uuid);
            }
        }
    }

    fn touch_model(&self) {
        let time = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        for printer in self.printers.values() {
            printer.set_model_change_time(time.clone());
        }
    }

    // --- command dispatch ------------------------------------------------

    /// Dispatch a `*<name>: <value>` adapter command.
    pub fn receive_command(&self, device_key: &str, command: &str, value: &str, source: &str) {
        let device = self.find_device(device_key);
        let Some(device) = device else {
            warn!(device = device_key, command, "command for unknown device");
            return;
        };
        let old_uuid = device.uuid();
        let old_name = device.name();

        match command {
            "uuid" => {
                if device.preserve_uuid() {
                    debug!(uuid = %old_uuid, "device preserves uuid, ignoring re-key");
                    return;
                }
                let rekeyed = self.registry.write().modify_uuid(&old_uuid, value);
                match rekeyed {
                    Ok(device) => self.device_changed(&device, &old_uuid, &old_name),
                    Err(e) => warn!(error = %e, "cannot re-key device"),
                }
            }
            "manufacturer" => {
                device.set_manufacturer(value);
                self.device_changed(&device, &old_uuid, &old_name);
            }
            "station" => {
                device.set_station(value);
                self.device_changed(&device, &old_uuid, &old_name);
            }
            "serialnumber" => {
                device.set_serial_number(value);
                self.device_changed(&device, &old_uuid, &old_name);
            }
            "description" => {
                device.set_description_value(value);
                self.device_changed(&device, &old_uuid, &old_name);
            }
            "nativename" => {
                device.set_native_name(value);
                self.device_changed(&device, &old_uuid, &old_name);
            }
            "calibration" => {
                self.apply_calibration(&device, value);
                self.device_changed(&device, &old_uuid, &old_name);
            }
            "adapterversion" => {
                self.receive_adapter_data_item(source, "_adapter_software_version", value);
            }
            "mtconnectversion" => {
                self.receive_adapter_data_item(source, "_mtconnect_version", value);
            }
            other => {
                warn!(command = other, device = device_key, "unknown command, ignoring");
            }
        }
    }

    /// `name|factor|offset` triples applied as unit conversions
    fn apply_calibration(&self, device: &Arc<Device>, value: &str) {
        let mut fields = value.split('|');
        while let (Some(name), Some(factor), Some(offset)) =
            (fields.next(), fields.next(), fields.next())
        {
            let Some(item) = device.data_item_by_name(name) else {
                warn!(name, "cannot find data item to calibrate");
                continue;
            };
            match (factor.trim().parse::<f64>(), offset.trim().parse::<f64>()) {
                (Ok(factor), Ok(offset)) => {
                    item.set_conversion(mtc_model::UnitConversion::new(factor, offset));
                }
                _ => warn!(name, factor, offset, "malformed calibration triple"),
            }
        }
    }

    fn receive_adapter_data_item(&self, source: &str, suffix: &str, value: &str) {
        let Some(agent_dev) = self.agent_device.read().clone() else {
            return;
        };
        let id = format!("{}{suffix}", agent_device::sanitize(source));
        match agent_dev.data_item_by_name(&id) {
            Some(item) => self.loopback.receive(&item, value),
            None => warn!(%id, source, "no agent data item for adapter command"),
        }
    }

    /// Emit the right lifecycle events after an in-place device mutation.
    fn device_changed(&self, device: &Arc<Device>, old_uuid: &str, old_name: &str) {
        let uuid = device.uuid();
        let rekeyed = uuid != old_uuid;
        if rekeyed {
            self.emit_device_event(agent_device::DEVICE_REMOVED_ID, old_uuid);
        }

        if rekeyed || device.name() != old_name {
            self.version_device_xml();
        }

        if rekeyed {
            self.emit_device_event(agent_device::DEVICE_ADDED_ID, &uuid);
        } else {
            self.emit_device_event(agent_device::DEVICE_CHANGED_ID, &uuid);
        }

        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.publish_device(device);
        }
        self.touch_model();
    }

    // --- connection coordinator ------------------------------------------

    pub fn connecting(&self, adapter: &str) {
        if let Some(agent_dev) = self.agent_device.read().clone() {
            if let Some(status) = agent_device::connection_status(&agent_dev, adapter) {
                self.loopback.receive(&status, "LISTENING");
            }
        }
    }

    pub fn connected(&self, adapter: &str, devices: &[String], auto_available: bool) {
        if let Some(agent_dev) = self.agent_device.read().clone() {
            if let Some(status) = agent_device::connection_status(&agent_dev, adapter) {
                self.loopback.receive(&status, "ESTABLISHED");
            }
        }
        if !auto_available {
            return;
        }
        for name in devices {
            let Some(device) = self.find_device(name) else {
                warn!(device = %name, adapter, "unknown device on adapter connect");
                continue;
            };
            match device.availability() {
                Some(avail) => self.loopback.receive(&avail, AVAILABLE),
                None => debug!(device = %name, "device has no availability item"),
            }
        }
    }

    /// Everything this adapter fed goes UNAVAILABLE (or back to its
    /// constant); availability flips when the adapter owned it.
    pub fn disconnected(&self, adapter: &str, devices: &[String], auto_available: bool) {
        debug!(adapter, "adapter disconnected, resetting its data items");
        if let Some(agent_dev) = self.agent_device.read().clone() {
            if let Some(status) = agent_device::connection_status(&agent_dev, adapter) {
                self.loopback.receive(&status, "CLOSED");
            }
        }

        for name in devices {
            let Some(device) = self.find_device(name) else {
                warn!(device = %name, adapter, "unknown device on adapter disconnect");
                continue;
            };
            for item in device.data_items() {
                let from_adapter = item.data_source().as_deref() == Some(adapter);
                let auto_availability = auto_available
                    && item.data_source().is_none()
                    && item.type_name() == mtc_model::device::TYPE_AVAILABILITY;
                if !from_adapter && !auto_availability {
                    continue;
                }
                let Some(latest) = self.latest(item.id()) else {
                    continue;
                };
                if let Some(constant) = item.constant_value() {
                    self.loopback.receive(&item, constant);
                } else if !latest.is_unavailable() {
                    self.loopback.receive(&item, UNAVAILABLE);
                }
            }
        }
    }

    // --- queries (sink surface) ------------------------------------------

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// True once the descriptor finished intake
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn schema_version(&self) -> SchemaVersion {
        *self.schema_version.read()
    }

    pub fn printer(&self, format: &str) -> Option<Arc<dyn Printer>> {
        self.printers.get(format).cloned()
    }

    pub fn document_header(&self) -> DocumentHeader {
        let (first, next) = {
            let buffer = self.buffer.lock();
            (buffer.first_sequence(), buffer.next_sequence())
        };
        DocumentHeader {
            instance_id: self.instance_id,
            sender: self.advertised_address.clone(),
            buffer_size: self.buffer_capacity,
            asset_buffer_size: self.asset_capacity,
            asset_count: self.assets.lock().active_count(),
            first_sequence: first,
            last_sequence: next.saturating_sub(1),
            next_sequence: next,
        }
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.read().devices().to_vec()
    }

    pub fn agent_device(&self) -> Option<Arc<Device>> {
        self.agent_device.read().clone()
    }

    pub fn find_device(&self, key: &str) -> Option<Arc<Device>> {
        self.registry.read().find_by_uuid_or_name(key)
    }

    pub fn default_device(&self) -> Option<Arc<Device>> {
        self.registry.read().default_device()
    }

    pub fn data_item(&self, id: &str) -> Option<Arc<DataItem>> {
        self.data_items.read().get(id).and_then(Weak::upgrade)
    }

    /// Latest merged value for a data item
    pub fn latest(&self, data_item_id: &str) -> Option<Arc<Observation>> {
        self.buffer.lock().get_latest(data_item_id)
    }

    /// Latest-per-item snapshot, optionally reconstructed at sequence `at`
    pub fn current(&self, at: Option<u64>) -> Vec<Arc<Observation>> {
        let buffer = self.buffer.lock();
        match at {
            Some(sequence) => buffer.checkpoint_at(sequence).observations(),
            None => buffer.latest_checkpoint().observations(),
        }
    }

    /// Sequence-range read: (first retained, observations, resume point)
    pub fn sample(&self, from: u64, count: usize) -> (u64, Vec<Arc<Observation>>, u64) {
        self.buffer.lock().get_from(from, count)
    }

    pub fn sequence_bounds(&self) -> (u64, u64) {
        let buffer = self.buffer.lock();
        (buffer.first_sequence(), buffer.next_sequence())
    }

    pub fn asset(&self, id: &str) -> Option<Arc<Asset>> {
        self.assets.lock().get(id)
    }

    pub fn assets(
        &self,
        device_key: Option<&str>,
        asset_type: Option<&str>,
        include_removed: bool,
    ) -> Vec<Arc<Asset>> {
        let uuid = device_key
            .and_then(|key| self.find_device(key))
            .map(|d| d.uuid());
        self.assets
            .lock()
            .assets(uuid.as_deref(), asset_type, include_removed)
    }

    pub fn asset_count(&self) -> usize {
        self.assets.lock().active_count()
    }
}

/// The pipeline delivers into the kernel through this contract.
impl PipelineContract for Agent {
    fn find_device(&self, key: &str) -> Option<Arc<Device>> {
        Agent::find_device(self, key)
    }

    fn default_device(&self) -> Option<Arc<Device>> {
        Agent::default_device(self)
    }

    fn find_data_item_by_id(&self, id: &str) -> Option<Arc<DataItem>> {
        self.data_item(id)
    }

    fn deliver_observation(&self, observation: Arc<Observation>) {
        self.receive_observation(observation);
    }

    fn deliver_asset(&self, asset: Arc<Asset>) {
        self.receive_asset(asset);
    }

    fn deliver_asset_command(&self, command: AssetCommand) {
        match command {
            AssetCommand::RemoveAsset { device, asset_id } => {
                let device = device.and_then(|key| Agent::find_device(self, &key));
                self.remove_asset(device, &asset_id);
            }
            AssetCommand::RemoveAll { device, asset_type } => {
                self.remove_all_assets(device.as_deref(), asset_type.as_deref());
            }
        }
    }

    fn deliver_command(&self, command: AgentCommand) {
        self.receive_command(
            command.device.as_deref().unwrap_or(""),
            &command.command,
            &command.value,
            &command.source,
        );
    }

    fn deliver_connect_status(&self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connecting { source } => self.connecting(&source),
            ConnectionStatus::Connected {
                source,
                devices,
                auto_available,
            } => self.connected(&source, &devices, auto_available),
            ConnectionStatus::Disconnected {
                source,
                devices,
                auto_available,
            } => self.disconnected(&source, &devices, auto_available),
        }
    }
}
