//! Concurrency-safe device registry.
//!
//! Device entries are shared between the polling scheduler (which mutates
//! tag state) and the API layer (which reads it). Mutations go through a
//! per-device lock on the tag map and atomics for counters, so reading one
//! device never contends with updates to another and no caller ever locks
//! the registry as a whole.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fieldgate_core::{
    ConfigError, DeviceConfig, DeviceId, DeviceStatus, Quality, Result, Tag, TagDef, TagValue,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Runtime state of one registered device.
pub struct DeviceEntry {
    config: DeviceConfig,
    connected: AtomicBool,
    last_seen: Mutex<Option<DateTime<Utc>>>,
    tags: RwLock<BTreeMap<String, Tag>>,
    polls_total: AtomicU64,
    read_errors: AtomicU64,
    writes_total: AtomicU64,
}

impl DeviceEntry {
    fn new(config: DeviceConfig) -> Self {
        let tags = config
            .tags
            .iter()
            .map(|def| (def.address.clone(), Tag::from_def(def)))
            .collect();
        Self {
            config,
            connected: AtomicBool::new(false),
            last_seen: Mutex::new(None),
            tags: RwLock::new(tags),
            polls_total: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            writes_total: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The configuration-time definition for a tag address.
    pub fn tag_def(&self, address: &str) -> Option<&TagDef> {
        self.config.tags.iter().find(|t| t.address == address)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Some(Utc::now());
    }

    pub fn bump_polls(&self) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_read_errors(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_writes(&self) {
        self.writes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    /// Records a successful read: value, GOOD quality, fresh timestamp.
    /// Returns the updated tag for broadcasting.
    pub fn apply_reading(&self, address: &str, value: TagValue) -> Option<Tag> {
        let mut tags = self.tags.write();
        let tag = tags.get_mut(address)?;
        tag.value = Some(value);
        tag.quality = Quality::Good;
        tag.updated_at = Some(Utc::now());
        Some(tag.clone())
    }

    /// Records a failed read: the last value is kept, quality drops to BAD.
    pub fn mark_bad(&self, address: &str) -> Option<Tag> {
        let mut tags = self.tags.write();
        let tag = tags.get_mut(address)?;
        tag.quality = Quality::Bad;
        tag.updated_at = Some(Utc::now());
        Some(tag.clone())
    }

    /// Marks every tag STALE. Called when the device becomes unreachable;
    /// last values stay intact.
    pub fn mark_all_stale(&self) {
        let now = Utc::now();
        let mut tags = self.tags.write();
        for tag in tags.values_mut() {
            if tag.quality == Quality::Good {
                tag.quality = Quality::Stale;
                tag.updated_at = Some(now);
            }
        }
    }

    pub fn tag(&self, address: &str) -> Option<Tag> {
        self.tags.read().get(address).cloned()
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.tags.read().values().cloned().collect()
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.config.id.clone(),
            protocol: self.config.protocol,
            host: self.config.host.clone(),
            port: self.config.port,
            connected: self.is_connected(),
            last_seen: *self.last_seen.lock(),
            tag_count: self.config.tags.len(),
            polls_total: self.polls_total.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            writes_total: self.writes_total.load(Ordering::Relaxed),
        }
    }
}

/// The concurrency-safe map of registered devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Arc<DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device. The definition is validated and duplicate
    /// identifiers are rejected; identifiers are immutable once assigned.
    pub fn register(&self, config: DeviceConfig) -> Result<Arc<DeviceEntry>> {
        config.validate()?;
        let id = config.id.clone();
        let entry = Arc::new(DeviceEntry::new(config));
        match self.devices.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConfigError::DuplicateDevice { id }.into())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                info!(device_id = %id, "Device registered");
                Ok(entry)
            }
        }
    }

    pub fn remove(&self, id: &str) -> Result<Arc<DeviceEntry>> {
        self.devices
            .remove(id)
            .map(|(_, entry)| {
                info!(device_id = %id, "Device removed");
                entry
            })
            .ok_or_else(|| ConfigError::UnknownDevice { id: id.to_string() }.into())
    }

    pub fn get(&self, id: &str) -> Result<Arc<DeviceEntry>> {
        self.devices
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| ConfigError::UnknownDevice { id: id.to_string() }.into())
    }

    pub fn list(&self) -> Vec<Arc<DeviceEntry>> {
        self.devices.iter().map(|entry| entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|entry| entry.is_connected())
            .count()
    }
}
