/// Volume inventory
///
/// Lists volumes with their driver and the containers mounting them. The
/// listing is cached as a snapshot until a volume event or a mutating
/// operation marks it stale.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::error::{VolumeError, VolumeResult};
use crate::core::executor::DockerCli;
use crate::utils::constants::CONTAINER_LABEL;

/// Runtime facts about one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub driver: String,
    pub containers: Vec<String>,
}

/// One row of `GET /volumes`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeSummary {
    pub driver: String,
    /// Formatted size, `None` until it has been measured
    pub size: Option<String>,
    pub containers: Vec<String>,
}

#[derive(Deserialize)]
struct VolumeLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: String,
}

#[derive(Deserialize)]
struct ContainerLine {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Mounts", default)]
    mounts: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

/// Build the inventory from `docker volume ls` and `docker ps` JSON lines
pub fn parse_inventory(
    volumes_out: &str,
    containers_out: &str,
) -> VolumeResult<BTreeMap<String, VolumeInfo>> {
    let mut inventory = BTreeMap::new();

    for line in volumes_out.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let volume: VolumeLine = serde_json::from_str(line)
            .map_err(|e| VolumeError::Parse(format!("volume listing: {}: {}", e, line)))?;
        inventory.insert(
            volume.name,
            VolumeInfo {
                driver: volume.driver,
                containers: Vec::new(),
            },
        );
    }

    for line in containers_out.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let container: ContainerLine = serde_json::from_str(line)
            .map_err(|e| VolumeError::Parse(format!("container listing: {}: {}", e, line)))?;

        // Our own helpers are not users of the volume
        if container.labels.contains(CONTAINER_LABEL) {
            continue;
        }

        // Bind mounts show up as host paths and simply match no volume
        for mount in container.mounts.split(',').map(str::trim) {
            if let Some(info) = inventory.get_mut(mount) {
                if !info.containers.contains(&container.names) {
                    info.containers.push(container.names.clone());
                }
            }
        }
    }

    Ok(inventory)
}

pub struct InventoryReader {
    cli: DockerCli,
    snapshot: Mutex<Option<BTreeMap<String, VolumeInfo>>>,
    stale: AtomicBool,
}

impl InventoryReader {
    pub fn new(cli: DockerCli) -> Self {
        Self {
            cli,
            snapshot: Mutex::new(None),
            stale: AtomicBool::new(true),
        }
    }

    /// Current inventory, refreshed from the runtime when the snapshot is stale
    pub async fn list_volumes(&self) -> VolumeResult<BTreeMap<String, VolumeInfo>> {
        let mut snapshot = self.snapshot.lock().await;

        // Clear before fetching so events arriving mid-refresh mark it stale again
        let stale = self.stale.swap(false, Ordering::SeqCst);
        if let (false, Some(current)) = (stale, snapshot.as_ref()) {
            return Ok(current.clone());
        }

        match self.fetch().await {
            Ok(fresh) => {
                debug!("inventory refreshed: {} volumes", fresh.len());
                *snapshot = Some(fresh.clone());
                Ok(fresh)
            }
            Err(e) => {
                self.stale.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    async fn fetch(&self) -> VolumeResult<BTreeMap<String, VolumeInfo>> {
        let volumes = self
            .cli
            .run_checked(
                &[
                    "volume".to_string(),
                    "ls".to_string(),
                    "--format".to_string(),
                    "{{json .}}".to_string(),
                ],
                "list volumes",
            )
            .await?;

        let containers = self
            .cli
            .run_checked(
                &[
                    "ps".to_string(),
                    "--all".to_string(),
                    "--no-trunc".to_string(),
                    "--format".to_string(),
                    "{{json .}}".to_string(),
                ],
                "list containers",
            )
            .await?;

        parse_inventory(&volumes, &containers)
    }
}
