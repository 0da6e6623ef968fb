pub mod device;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cache::MetadataCache;
use crate::config::AppConfig;
use crate::db::{EthoscopeUpdate, Registry};
use crate::mdns::BrowseEvent;
use crate::notify::Notifier;

pub use device::Device;

/// Everything a collaborator needs, passed explicitly at construction.
/// There is no process-wide state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Registry,
    pub cache: MetadataCache,
    pub notifier: Arc<dyn Notifier>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        registry: Registry,
        cache: MetadataCache,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        AppContext {
            config: Arc::new(config),
            registry,
            cache,
            notifier,
        }
    }
}

/// Discovers devices over mDNS and owns the live device directory.
///
/// The directory is keyed by IP — the fastest stable handle at discovery
/// time; authoritative device identity (the 32-hex id) is fetched from the
/// device itself. The directory is append-mostly: devices going offline
/// stay listed with `skip_scanning` latched, and only explicit retirement
/// removes them.
pub struct Scanner {
    ctx: AppContext,
    devices: Arc<DashMap<String, Device>>,
}

impl Scanner {
    pub fn new(ctx: AppContext) -> Self {
        Scanner {
            ctx,
            devices: Arc::new(DashMap::new()),
        }
    }

    /// Consume browse events until the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<BrowseEvent>) {
        info!("Device scanner started");
        while let Some(event) = events.recv().await {
            match event {
                BrowseEvent::Added {
                    ip,
                    port,
                    name,
                    device_id,
                } => {
                    self.add(&ip, port, name, device_id).await;
                }
                BrowseEvent::Removed { ip } => {
                    self.remove(&ip).await;
                }
            }
        }
        info!("Device scanner event channel closed");
    }

    /// Handle an advertisement. Re-advertisement of a known IP re-enables
    /// the device (clearing any `skip_scanning` latch) and forces an
    /// identity refresh; a new IP spawns a fresh polling actor.
    pub async fn add(
        &self,
        ip: &str,
        port: u16,
        name: Option<String>,
        device_id: Option<String>,
    ) {
        if let Some(existing) = self.devices.get(ip).map(|d| d.value().clone()) {
            let was_skipping = existing.skip_scanning();
            info!(
                ip = %ip,
                was_skipping,
                "Device already known, refreshing from new advertisement"
            );

            existing.set_zeroconf_name(name.clone()).await;
            existing.reset_error_state().await;
            existing.set_skip_scanning(false).await;

            // Devices get renamed through the web UI; the advertisement is
            // the moment to notice the id changed underneath us.
            match existing.refresh_identity().await {
                Ok((old_id, new_id)) if old_id != new_id => {
                    info!(ip = %ip, old = %old_id, new = %new_id, "Device id changed");
                    self.handle_id_change(&existing, &old_id, &new_id).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(ip = %ip, error = %e, "Failed to refresh device id");
                }
            }

            existing.reset_status_to_offline().await;
            return;
        }

        let device = Device::spawn(self.ctx.clone(), ip, port);
        device.set_zeroconf_name(name.clone()).await;
        self.devices.insert(ip.to_string(), device);
        info!(
            ip = %ip,
            port,
            name = name.as_deref().unwrap_or("pending"),
            id = device_id.as_deref().unwrap_or("pending"),
            "Added device"
        );
    }

    /// Handle a service removal: stop interrogating the device but keep it
    /// in the directory.
    pub async fn remove(&self, ip: &str) {
        let Some(device) = self.devices.get(ip).map(|d| d.value().clone()) else {
            return;
        };
        let id = device.id().await;
        info!(ip = %ip, id = %id, "Device went offline via mDNS removal");
        device.set_skip_scanning(true).await;
        device.reset_status_to_offline().await;
    }

    /// Registry bookkeeping for a renamed device: the old record is
    /// retired with a comment, the new id gets an active record on the
    /// same IP.
    async fn handle_id_change(&self, device: &Device, old_id: &str, new_id: &str) {
        let name = device.name().await;
        let ip = device.ip().to_string();

        if !old_id.is_empty() {
            if let Err(e) = self
                .ctx
                .registry
                .update_ethoscope(EthoscopeUpdate::new(old_id).active(false))
                .await
            {
                warn!(old = %old_id, error = %e, "Failed to retire old device record");
            }
        }

        let mut update = EthoscopeUpdate::new(new_id)
            .last_ip(ip)
            .status("offline");
        if !name.is_empty() {
            update = update.name(name);
        }
        if !old_id.is_empty() {
            update = update.comments(format!("Renamed from {old_id}"));
        }
        if let Err(e) = self.ctx.registry.update_ethoscope(update).await {
            error!(new = %new_id, error = %e, "Failed to record renamed device");
        }
    }

    /// Look a live device up by its authoritative id.
    pub async fn get_device(&self, device_id: &str) -> Option<Device> {
        for entry in self.devices.iter() {
            if entry.value().id().await == device_id {
                return Some(entry.value().clone());
            }
        }
        None
    }

    /// Ids of all live devices that have resolved their identity.
    pub async fn current_device_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for entry in self.devices.iter() {
            let id = entry.value().id().await;
            if !id.is_empty() {
                ids.push(id);
            }
        }
        ids
    }

    /// Aggregate device info for external readers: persistent registry
    /// rows first (so known-but-offline devices appear), live loop info
    /// overlaid on top. Factory-default `ETHOSCOPE_000` devices are shown
    /// live under their name but never come from the registry.
    pub async fn all_devices_info(&self) -> Map<String, Value> {
        let mut result = Map::new();

        match self.ctx.registry.list_ethoscopes(false).await {
            Ok(records) => {
                for record in records {
                    if record.ethoscope_id.trim().is_empty() {
                        continue;
                    }
                    result.insert(
                        record.ethoscope_id.clone(),
                        json!({
                            "id": record.ethoscope_id,
                            "name": record.ethoscope_name,
                            "ip": record.last_ip,
                            "status": record.status,
                            "active": record.active,
                            "last_seen": record.last_seen,
                        }),
                    );
                }
            }
            Err(e) => error!(error = %e, "Failed to list registry devices"),
        }

        for entry in self.devices.iter() {
            let device = entry.value();
            let id = device.id().await;
            let info = device.info().await;
            let name = info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            if id.trim().is_empty() && name.is_empty() {
                continue;
            }

            let key = if name == "ETHOSCOPE_000" { name.clone() } else { id };
            if key.is_empty() {
                continue;
            }

            match result.entry(key) {
                serde_json::map::Entry::Occupied(mut occupied) => {
                    if let Value::Object(existing) = occupied.get_mut() {
                        let db_name = existing
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        for (k, v) in info {
                            existing.insert(k, v);
                        }
                        // A device that has not resolved a proper name yet
                        // must not clobber the one the registry remembers.
                        let live_name = existing
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if (live_name.is_empty() || live_name == "unknown_name")
                            && !db_name.is_empty()
                        {
                            existing.insert("name".into(), Value::String(db_name));
                        }
                    }
                }
                serde_json::map::Entry::Vacant(vacant) => {
                    vacant.insert(Value::Object(info));
                }
            }
        }

        result
    }

    /// Retire a device: flips its registry record inactive and stops any
    /// live polling actor.
    pub async fn retire_device(&self, device_id: &str) -> anyhow::Result<()> {
        self.ctx.registry.retire_ethoscope(device_id, false).await?;

        let mut retired_ip = None;
        for entry in self.devices.iter() {
            if entry.value().id().await == device_id {
                retired_ip = Some(entry.key().clone());
                break;
            }
        }
        if let Some(ip) = retired_ip {
            if let Some((_, device)) = self.devices.remove(&ip) {
                device.stop().await;
            }
        }
        info!(device = %device_id, "Device retired");
        Ok(())
    }

    /// Stop every device loop. The scanner can be dropped afterwards.
    pub async fn stop(&self) {
        for entry in self.devices.iter() {
            entry.value().stop().await;
        }
        info!("Device scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;

    async fn test_ctx() -> (AppContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(":memory:").await.unwrap();
        let mut config = AppConfig::default();
        config.node.results_dir = dir.path().join("results").display().to_string();
        config.node.cache_dir = dir.path().join("cache").display().to_string();
        let cache = MetadataCache::new(dir.path().join("cache"));
        let ctx = AppContext::new(config, registry, cache, Arc::new(NullNotifier));
        (ctx, dir)
    }

    #[tokio::test]
    async fn test_add_and_remove_keep_device_in_directory() {
        let (ctx, _dir) = test_ctx().await;
        let scanner = Scanner::new(ctx);

        scanner
            .add("127.0.0.1", 1, Some("ETHOSCOPE_001".into()), None)
            .await;
        assert_eq!(scanner.devices.len(), 1);

        // Service removal latches skip_scanning but never drops the entry.
        scanner.remove("127.0.0.1").await;
        assert_eq!(scanner.devices.len(), 1);
        let device = scanner.devices.get("127.0.0.1").unwrap().value().clone();
        assert!(device.skip_scanning());

        // A fresh advertisement re-enables scanning.
        scanner
            .add("127.0.0.1", 1, Some("ETHOSCOPE_001".into()), None)
            .await;
        assert_eq!(scanner.devices.len(), 1);
        let device = scanner.devices.get("127.0.0.1").unwrap().value().clone();
        assert!(!device.skip_scanning());

        scanner.stop().await;
    }

    #[tokio::test]
    async fn test_aggregate_info_includes_registry_devices() {
        let (ctx, _dir) = test_ctx().await;
        ctx.registry
            .update_ethoscope(
                EthoscopeUpdate::new("etho_offline")
                    .name("ETHOSCOPE_OFF")
                    .status("offline")
                    .last_ip("192.168.1.50"),
            )
            .await
            .unwrap();

        let scanner = Scanner::new(ctx);
        let info = scanner.all_devices_info().await;

        let device = info.get("etho_offline").expect("registry device listed");
        assert_eq!(device["name"], "ETHOSCOPE_OFF");
        assert_eq!(device["status"], "offline");
    }

    #[tokio::test]
    async fn test_rename_updates_registry() {
        let (ctx, _dir) = test_ctx().await;
        ctx.registry
            .update_ethoscope(
                EthoscopeUpdate::new("old_id_1")
                    .name("ETHOSCOPE_A")
                    .last_ip("192.168.1.10"),
            )
            .await
            .unwrap();

        let scanner = Scanner::new(ctx.clone());
        let device = Device::spawn(ctx.clone(), "192.168.1.10", 9000);
        device.set_zeroconf_name(Some("ETHOSCOPE_A".into())).await;
        scanner.handle_id_change(&device, "old_id_1", "new_id_2").await;

        let old = ctx.registry.get_ethoscope("old_id_1").await.unwrap().unwrap();
        assert_eq!(old.active, 0, "old record retired");

        let new = ctx.registry.get_ethoscope("new_id_2").await.unwrap().unwrap();
        assert_eq!(new.active, 1);
        assert_eq!(new.last_ip.as_deref(), Some("192.168.1.10"));
        assert_eq!(new.comments, "Renamed from old_id_1");

        device.stop().await;
    }

    #[tokio::test]
    async fn test_retire_device_removes_live_entry() {
        let (ctx, _dir) = test_ctx().await;
        ctx.registry
            .update_ethoscope(EthoscopeUpdate::new("etho_r").name("ETHOSCOPE_R"))
            .await
            .unwrap();

        let scanner = Scanner::new(ctx.clone());
        scanner.retire_device("etho_r").await.unwrap();

        let record = ctx.registry.get_ethoscope("etho_r").await.unwrap().unwrap();
        assert_eq!(record.active, 0);
    }
}
