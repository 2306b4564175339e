/// Volume service facade
///
/// Owns the shared inventory, size cache and event channel, and exposes every
/// operation the HTTP API and the command line offer.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::error::{VolumeError, VolumeResult};
use crate::core::events::{invalidate_on_events, EventWatcher, VolumeEvent};
use crate::core::executor::{CommandRunner, DockerCli, ProcessRunner};
use crate::core::inventory::{InventoryReader, VolumeSummary};
use crate::core::lifecycle::{RunningContainer, VolumeLifecycle};
use crate::core::size::SizeCalculator;
use crate::core::transfer::{require_volume_name, TransferEngine, TransferJob};
use crate::utils::constants::{CONTAINER_PREFIX, DEFAULT_RUN_TARGET};
use crate::utils::{format_size, AppConfig};

pub struct VolumeService {
    inventory: Arc<InventoryReader>,
    sizes: Arc<SizeCalculator>,
    transfers: Arc<TransferEngine>,
    lifecycle: Arc<VolumeLifecycle>,
    events: broadcast::Sender<VolumeEvent>,
    watcher: Mutex<Option<EventWatcher>>,
    size_concurrency: usize,
}

impl VolumeService {
    /// Service talking to the real runtime CLI
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let runner = Arc::new(ProcessRunner::new(config.timeout()?));
        Self::with_runner(runner, config)
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>, config: &AppConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let (backoff_initial, backoff_max) = config.events_backoff()?;

        let cli = DockerCli::new(runner, config.docker_binary.clone());
        let inventory = Arc::new(InventoryReader::new(cli.clone()));
        let sizes = Arc::new(SizeCalculator::new(cli.clone(), config.helper_image.clone()));
        let transfers = Arc::new(TransferEngine::new(
            cli.clone(),
            config.helper_image.clone(),
            sizes.clone(),
            inventory.clone(),
        ));
        let lifecycle = Arc::new(VolumeLifecycle::new(
            cli.clone(),
            config.helper_image.clone(),
            sizes.clone(),
            inventory.clone(),
        ));
        let watcher = EventWatcher::new(cli, backoff_initial, backoff_max);

        Ok(Self {
            inventory,
            sizes,
            transfers,
            lifecycle,
            events: watcher.sender(),
            watcher: Mutex::new(Some(watcher)),
            size_concurrency: config.size_concurrency.max(1),
        })
    }

    /// Start the event subscription and the cache invalidation consumer.
    ///
    /// Only the first call starts anything.
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let watcher = match self.watcher.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(watcher) = watcher else {
            return Vec::new();
        };

        let consumer = tokio::spawn(invalidate_on_events(
            self.events.subscribe(),
            self.sizes.clone(),
            self.inventory.clone(),
        ));
        let watcher = tokio::spawn(watcher.run());
        info!("volume event watcher started");

        vec![watcher, consumer]
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VolumeEvent> {
        self.events.subscribe()
    }

    /// Volumes with driver and containers; sizes are measured when asked for,
    /// otherwise only already cached sizes are included
    pub async fn list_volumes(&self, with_sizes: bool) -> VolumeResult<BTreeMap<String, VolumeSummary>> {
        let inventory = self.inventory.list_volumes().await?;

        let mut measured: BTreeMap<String, u64> = BTreeMap::new();
        if with_sizes {
            let results: Vec<(String, VolumeResult<u64>)> = stream::iter(inventory.keys().cloned())
                .map(|name| async move {
                    let size = self.sizes.calculate_size(&name).await;
                    (name, size)
                })
                .buffer_unordered(self.size_concurrency)
                .collect()
                .await;

            for (name, size) in results {
                match size {
                    Ok(bytes) => {
                        measured.insert(name, bytes);
                    }
                    // Removed while listing, or unreadable; listed without a size
                    Err(e) => warn!("could not measure volume {}: {}", name, e),
                }
            }
        }

        Ok(inventory
            .into_iter()
            .map(|(name, info)| {
                let bytes = measured
                    .get(&name)
                    .copied()
                    .or_else(|| self.sizes.cache().peek(&name).map(|c| c.bytes));
                let summary = VolumeSummary {
                    driver: info.driver,
                    size: bytes.map(format_size),
                    containers: info.containers,
                };
                (name, summary)
            })
            .collect())
    }

    pub async fn volume_size(&self, name: &str) -> VolumeResult<u64> {
        require_volume_name(name)?;
        self.sizes.calculate_size(name).await
    }

    /// Size formatted for display, `"0B"` for an empty volume
    pub async fn size_string(&self, name: &str) -> VolumeResult<String> {
        Ok(format_size(self.volume_size(name).await?))
    }

    pub async fn export_volume(&self, name: &str, path: &str) -> VolumeResult<TransferJob> {
        let (transfers, name, path) = (self.transfers.clone(), name.to_string(), path.to_string());
        detached(async move { transfers.export_volume(&name, &path).await }).await
    }

    pub async fn import_volume(&self, name: &str, path: &str) -> VolumeResult<TransferJob> {
        let (transfers, name, path) = (self.transfers.clone(), name.to_string(), path.to_string());
        detached(async move { transfers.import_volume(&name, &path).await }).await
    }

    pub async fn clone_volume(&self, name: &str, destination: &str) -> VolumeResult<TransferJob> {
        let (transfers, name, destination) =
            (self.transfers.clone(), name.to_string(), destination.to_string());
        detached(async move { transfers.clone_volume(&name, &destination).await }).await
    }

    /// Save into `image`, or into `vackup-<name>:latest` when none is given
    pub async fn save_volume(&self, name: &str, image: Option<&str>) -> VolumeResult<TransferJob> {
        let image = image
            .filter(|i| !i.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_image_name(name));
        let (transfers, name) = (self.transfers.clone(), name.to_string());
        detached(async move { transfers.save_volume(&name, &image).await }).await
    }

    pub async fn load_volume(&self, name: &str, image: &str) -> VolumeResult<TransferJob> {
        let (transfers, name, image) = (self.transfers.clone(), name.to_string(), image.to_string());
        detached(async move { transfers.load_volume(&name, &image).await }).await
    }

    pub async fn transfer_volume(&self, name: &str, path: &str) -> VolumeResult<TransferJob> {
        let (transfers, name, path) = (self.transfers.clone(), name.to_string(), path.to_string());
        detached(async move { transfers.transfer_volume(&name, &path).await }).await
    }

    pub async fn empty_volume(&self, name: &str) -> VolumeResult<()> {
        let (lifecycle, name) = (self.lifecycle.clone(), name.to_string());
        detached(async move { lifecycle.empty_volume(&name).await }).await
    }

    pub async fn delete_volume(&self, name: &str) -> VolumeResult<()> {
        let (lifecycle, name) = (self.lifecycle.clone(), name.to_string());
        detached(async move { lifecycle.delete_volume(&name).await }).await
    }

    /// Start a long-running container from `image` with the volume mounted at `target`
    pub async fn run_container(
        &self,
        name: &str,
        image: &str,
        target: Option<&str>,
    ) -> VolumeResult<RunningContainer> {
        let target = target.unwrap_or(DEFAULT_RUN_TARGET).to_string();
        let (lifecycle, name, image) = (self.lifecycle.clone(), name.to_string(), image.to_string());
        detached(async move { lifecycle.run_container(&name, &image, &target).await }).await
    }
}

/// Image a volume is saved to when the caller names none
pub fn default_image_name(volume: &str) -> String {
    format!("{}-{}:latest", CONTAINER_PREFIX, volume.to_lowercase())
}

/// Run a mutating operation on its own task.
///
/// The caller may go away (an HTTP client disconnecting drops the handler
/// future); the operation still runs to completion or failure, including its
/// cleanup and cache invalidation.
async fn detached<T, F>(operation: F) -> VolumeResult<T>
where
    F: Future<Output = VolumeResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(operation)
        .await
        .map_err(|e| VolumeError::Aborted(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::CommandResult;
    use crate::core::testing::ScriptedRuntime;
    use std::time::Duration;

    fn service(runtime: &Arc<ScriptedRuntime>) -> VolumeService {
        let config = AppConfig {
            events_backoff_initial: "1ms".to_string(),
            events_backoff_max: "5ms".to_string(),
            ..AppConfig::default()
        };
        VolumeService::with_runner(runtime.clone(), &config).unwrap()
    }

    #[tokio::test]
    async fn test_list_volumes_without_sizes() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("data1", 4_200_000);
        runtime.add_volume("cache", 0);
        runtime.attach("web", "data1");
        let service = service(&runtime);

        let volumes = service.list_volumes(false).await.unwrap();

        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes["data1"].driver, "local");
        assert_eq!(volumes["data1"].containers, vec!["web".to_string()]);
        assert_eq!(volumes["data1"].size, None);
        assert_eq!(runtime.count_scripts("stat -c %s"), 0);
    }

    #[tokio::test]
    async fn test_list_volumes_with_sizes() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("data1", 4_200_000);
        runtime.add_volume("cache", 0);
        runtime.add_volume("logs", 12_300_000);
        let service = service(&runtime);

        let volumes = service.list_volumes(true).await.unwrap();

        assert_eq!(volumes["data1"].size.as_deref(), Some("4.2MB"));
        assert_eq!(volumes["cache"].size.as_deref(), Some("0B"));
        assert_eq!(volumes["logs"].size.as_deref(), Some("12.3MB"));
        assert_eq!(runtime.count_scripts("stat -c %s"), 3);

        // Cached sizes show up in a plain listing as well
        let plain = service.list_volumes(false).await.unwrap();
        assert_eq!(plain["logs"].size.as_deref(), Some("12.3MB"));
        assert_eq!(runtime.count_scripts("stat -c %s"), 3);
    }

    #[tokio::test]
    async fn test_size_scenario_with_empty() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("data1", 4_200_000);
        let service = service(&runtime);

        assert_eq!(service.size_string("data1").await.unwrap(), "4.2MB");
        service.empty_volume("data1").await.unwrap();
        assert_eq!(service.size_string("data1").await.unwrap(), "0B");
    }

    #[tokio::test]
    async fn test_inventory_refreshes_after_mutation() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("src", 10);
        let service = service(&runtime);

        assert_eq!(service.list_volumes(false).await.unwrap().len(), 1);
        service.clone_volume("src", "copy").await.unwrap();

        let volumes = service.list_volumes(false).await.unwrap();
        assert!(volumes.contains_key("copy"));
    }

    /// Poll until `check` holds or a few seconds passed
    async fn eventually(check: impl Fn() -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_clone_finishes_after_caller_goes_away() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("src", 10);
        runtime.set_start_delay(Duration::from_millis(200));
        let service = service(&runtime);

        let gone = tokio::time::timeout(Duration::from_millis(50), service.clone_volume("src", "dst")).await;
        assert!(gone.is_err());

        assert!(eventually(|| runtime.volume_size("dst") == Some(10) && runtime.live_containers() == 0).await);
        runtime.set_start_delay(Duration::ZERO);
        assert_eq!(service.volume_size("dst").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_failed_clone_cleans_up_after_caller_goes_away() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("src", 10);
        runtime.set_start_delay(Duration::from_millis(200));
        runtime.fail_start(CommandResult::failed(1, "cp: out of space"));
        let service = service(&runtime);

        let gone = tokio::time::timeout(Duration::from_millis(50), service.clone_volume("src", "dst")).await;
        assert!(gone.is_err());

        assert!(eventually(|| runtime.count_calls("rm") == 1 && runtime.volume_size("dst").is_none()).await);
        assert!(eventually(|| runtime.count_calls("volume") >= 4).await);

        // Nothing left behind that would turn a retry into a conflict
        runtime.set_start_delay(Duration::ZERO);
        let job = service.clone_volume("src", "dst").await.unwrap();
        assert_eq!(job.destination, "dst");
        assert_eq!(runtime.volume_size("dst"), Some(10));
    }

    #[tokio::test]
    async fn test_empty_invalidates_after_caller_goes_away() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("data1", 4_200_000);
        let service = service(&runtime);
        assert_eq!(service.size_string("data1").await.unwrap(), "4.2MB");

        runtime.set_start_delay(Duration::from_millis(200));
        let gone = tokio::time::timeout(Duration::from_millis(50), service.empty_volume("data1")).await;
        assert!(gone.is_err());

        assert!(eventually(|| runtime.volume_size("data1") == Some(0) && runtime.live_containers() == 0).await);
        runtime.set_start_delay(Duration::ZERO);
        assert!(eventually(|| service.sizes.cache().peek("data1").is_none()).await);
        assert_eq!(service.size_string("data1").await.unwrap(), "0B");
    }

    #[tokio::test]
    async fn test_save_defaults_image_name() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("Data1", 300);
        let service = service(&runtime);

        let job = service.save_volume("Data1", None).await.unwrap();
        assert_eq!(job.destination, "vackup-data1:latest");
        assert_eq!(runtime.image_size("vackup-data1:latest"), Some(300));

        let job = service.save_volume("Data1", Some(" ")).await.unwrap();
        assert_eq!(job.destination, "vackup-data1:latest");
        assert!(job.replaced_existing);
    }

    #[tokio::test]
    async fn test_run_container_uses_default_target() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("data1", 10);
        let service = service(&runtime);

        let started = service.run_container("data1", "nginx", None).await.unwrap();
        assert_eq!(started.target, "/data");
        assert_eq!(started.volume, "data1");

        let volumes = service.list_volumes(false).await.unwrap();
        assert_eq!(volumes["data1"].containers.len(), 1);
    }

    #[tokio::test]
    async fn test_events_invalidate_sizes() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_volume("data1", 100);
        let service = service(&runtime);

        assert_eq!(service.volume_size("data1").await.unwrap(), 100);

        // Another container writes to the volume
        runtime.set_volume_size("data1", 900);
        runtime.push_event_session(&[
            r#"{"Type":"volume","Action":"unmount","Actor":{"ID":"data1","Attributes":{"container":"abc","read/write":"true"}},"time":1700000000}"#,
        ]);
        let mut events = service.subscribe_events();
        let handles = service.start_background();
        assert_eq!(handles.len(), 2);
        assert!(service.start_background().is_empty());

        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();

        let size = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let size = service.volume_size("data1").await.unwrap();
                if size == 900 {
                    return size;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(size, 900);

        for handle in handles {
            handle.abort();
        }
    }
}
