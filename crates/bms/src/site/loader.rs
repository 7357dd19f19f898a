//! Site Loader
//!
//! Loads site configuration from disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use bms_types::DeviceId;

use super::config::*;

/// Error type for site loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Site path does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("Site manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Site loader
pub struct SiteLoader;

impl SiteLoader {
    /// Load a site from the given path
    pub async fn load(path: impl AsRef<Path>) -> Result<Site, LoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(LoadError::PathNotFound(path.to_path_buf()));
        }

        info!("Loading site from: {}", path.display());

        let manifest_path = path.join("site.toml");
        if !manifest_path.exists() {
            return Err(LoadError::ManifestNotFound(manifest_path));
        }

        let manifest_content = fs::read_to_string(&manifest_path).await?;
        let manifest: SiteManifest = toml::from_str(&manifest_content)?;
        info!("Loaded site manifest: {} ({})", manifest.site.name, manifest.site.id);

        let mut rejected = Vec::new();
        let devices = Self::load_devices(path, &mut rejected).await?;
        info!(
            "Loaded {} devices, {} files rejected",
            devices.len(),
            rejected.len()
        );

        Ok(Site {
            path: path.to_path_buf(),
            manifest,
            devices,
            rejected,
        })
    }

    /// Load all devices from the devices/ directory
    async fn load_devices(
        site_path: &Path,
        rejected: &mut Vec<(PathBuf, String)>,
    ) -> Result<HashMap<DeviceId, SiteDevice>, LoadError> {
        let devices_dir = site_path.join("devices");
        let mut devices = HashMap::new();

        if !devices_dir.exists() {
            debug!("No devices directory found");
            return Ok(devices);
        }

        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&devices_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.ends_with(".device.toml"))
            {
                paths.push(path);
            }
        }
        // Directory order is unspecified; keep duplicate handling deterministic
        paths.sort();

        let mut point_ids = HashSet::new();
        for path in paths {
            let loaded = Self::load_device(&path).await.and_then(|device| {
                if devices.contains_key(&device.device.id) {
                    return Err(LoadError::Invalid(format!(
                        "duplicate device id {}",
                        device.device.id
                    )));
                }
                if let Some(point) = device.points.iter().find(|p| point_ids.contains(&p.id)) {
                    return Err(LoadError::Invalid(format!("duplicate point id {}", point.id)));
                }
                Ok(device)
            });

            match loaded {
                Ok(device) => {
                    debug!("Loaded device: {} ({})", device.device.name, device.device.id);
                    point_ids.extend(device.points.iter().map(|p| p.id));
                    devices.insert(device.device.id, device);
                }
                Err(e) => {
                    warn!("Failed to load device from {}: {}", path.display(), e);
                    rejected.push((path, e.to_string()));
                }
            }
        }

        Self::reject_orphans(&mut devices, rejected);
        Ok(devices)
    }

    /// Load a single device configuration
    async fn load_device(path: &Path) -> Result<SiteDevice, LoadError> {
        let content = fs::read_to_string(path).await?;
        let config: DeviceConfig = toml::from_str(&content)?;
        let (device, points) = config.resolve().map_err(LoadError::Invalid)?;
        Ok(SiteDevice {
            device,
            points,
            source: path.to_path_buf(),
        })
    }

    /// Drop devices whose parent gateway is not part of the site, repeating
    /// until every remaining parent chain is complete
    fn reject_orphans(
        devices: &mut HashMap<DeviceId, SiteDevice>,
        rejected: &mut Vec<(PathBuf, String)>,
    ) {
        loop {
            let orphans: Vec<(DeviceId, DeviceId)> = devices
                .values()
                .filter_map(|d| {
                    d.device
                        .parent_id
                        .filter(|parent| !devices.contains_key(parent))
                        .map(|parent| (d.device.id, parent))
                })
                .collect();
            if orphans.is_empty() {
                return;
            }
            for (id, parent) in orphans {
                if let Some(device) = devices.remove(&id) {
                    let reason = format!("device {} references unknown parent {}", id, parent);
                    warn!("Failed to load device from {}: {}", device.source.display(), reason);
                    rejected.push((device.source, reason));
                }
            }
        }
    }
}
