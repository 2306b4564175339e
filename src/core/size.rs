/// Volume size measurement and caching
///
/// A size is measured by a disposable helper container that mounts the volume
/// read-only. Results are cached per volume. Each volume has its own slot with
/// an async mutex, so a second request for a volume that is being measured
/// waits for that measurement instead of starting another container, while
/// other volumes are never blocked.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::core::container::{run_disposable, ContainerSpec, Mount};
use crate::core::error::{VolumeError, VolumeResult};
use crate::core::executor::DockerCli;
use crate::utils::constants::VOLUME_MOUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedSize {
    pub bytes: u64,
    pub computed_at: DateTime<Utc>,
    epoch: u64,
}

#[derive(Default)]
struct SizeSlot {
    value: tokio::sync::Mutex<Option<CachedSize>>,
    /// Bumped by every invalidation; a cached value is fresh only if it was
    /// computed in the current epoch
    epoch: AtomicU64,
}

impl SizeSlot {
    fn fresh(&self, cached: &Option<CachedSize>) -> Option<CachedSize> {
        cached.filter(|c| c.epoch == self.epoch.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct SizeCache {
    slots: Mutex<HashMap<String, Arc<SizeSlot>>>,
}

impl SizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SizeSlot>>> {
        // The map is only touched in short non-panicking sections
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, volume: &str) -> Arc<SizeSlot> {
        self.slots().entry(volume.to_string()).or_default().clone()
    }

    /// Cached size, or the result of `compute` run at most once at a time per volume
    pub async fn get_or_compute<F, Fut>(&self, volume: &str, compute: F) -> VolumeResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VolumeResult<u64>>,
    {
        let slot = self.slot(volume);
        let mut cached = slot.value.lock().await;

        if let Some(fresh) = slot.fresh(&cached) {
            return Ok(fresh.bytes);
        }

        // An invalidation racing with the measurement leaves the result stale
        let epoch = slot.epoch.load(Ordering::SeqCst);
        let bytes = match compute().await {
            Ok(bytes) => bytes,
            Err(e) => {
                if cached.is_none() {
                    self.release(volume, &slot);
                }
                return Err(e);
            }
        };
        *cached = Some(CachedSize {
            bytes,
            computed_at: Utc::now(),
            epoch,
        });
        Ok(bytes)
    }

    /// Drop a slot that holds nothing, unless another request is using it.
    ///
    /// New references are only handed out under the map lock, so a count of
    /// two (the map and the caller) cannot grow while it is held.
    fn release(&self, volume: &str, slot: &Arc<SizeSlot>) {
        let mut slots = self.slots();
        let unused = slots
            .get(volume)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && Arc::strong_count(slot) == 2);
        if unused {
            slots.remove(volume);
        }
    }

    /// Fresh cached value without waiting for an in-flight measurement
    pub fn peek(&self, volume: &str) -> Option<CachedSize> {
        let slot = self.slots().get(volume).cloned()?;
        let cached = slot.value.try_lock().ok()?;
        slot.fresh(&cached)
    }

    /// Whether a measurement for the volume is running right now
    pub fn in_progress(&self, volume: &str) -> bool {
        self.slots()
            .get(volume)
            .map(|slot| slot.value.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Make the next lookup measure again
    pub fn invalidate(&self, volume: &str) {
        if let Some(slot) = self.slots().get(volume) {
            slot.epoch.fetch_add(1, Ordering::SeqCst);
            debug!("size cache invalidated for {}", volume);
        }
    }

    /// Invalidate every volume, used when events were missed
    pub fn invalidate_all(&self) {
        for slot in self.slots().values() {
            slot.epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drop everything known about a removed volume
    pub fn forget(&self, volume: &str) {
        let mut slots = self.slots();
        let Some(slot) = slots.get(volume) else {
            return;
        };
        slot.epoch.fetch_add(1, Ordering::SeqCst);
        // A slot in use stays, so the next request queues behind the running
        // measurement instead of starting a second one
        if Arc::strong_count(slot) == 1 {
            slots.remove(volume);
        }
    }
}

/// Shell pipeline summing the apparent size of every regular file under the mount
pub fn measurement_script() -> String {
    format!(
        "find {} -type f -exec stat -c %s {{}} + | awk '{{s+=$1}} END {{printf \"%.0f\\n\", s}}'",
        VOLUME_MOUNT
    )
}

/// Parse the helper's output: a single byte count
pub fn parse_measurement(stdout: &str) -> VolumeResult<u64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<u64>().ok())
        .ok_or_else(|| VolumeError::Parse(format!("unexpected size output {:?}", stdout)))
}

pub struct SizeCalculator {
    cli: DockerCli,
    helper_image: String,
    cache: SizeCache,
}

impl SizeCalculator {
    pub fn new(cli: DockerCli, helper_image: impl Into<String>) -> Self {
        Self {
            cli,
            helper_image: helper_image.into(),
            cache: SizeCache::new(),
        }
    }

    pub fn cache(&self) -> &SizeCache {
        &self.cache
    }

    /// Size of the volume contents in bytes, measured at most once per invalidation
    pub async fn calculate_size(&self, volume: &str) -> VolumeResult<u64> {
        self.cache
            .get_or_compute(volume, || self.measure(volume))
            .await
    }

    async fn measure(&self, volume: &str) -> VolumeResult<u64> {
        // Mounting a missing volume would silently create it
        if !self.cli.volume_exists(volume).await? {
            return Err(VolumeError::NotFound(format!("volume {} does not exist", volume)));
        }

        let started = std::time::Instant::now();
        let spec = ContainerSpec::new("size", &self.helper_image)
            .mount(Mount::volume(volume, VOLUME_MOUNT, true))
            .shell(measurement_script());

        let result = run_disposable(&self.cli, &spec, &format!("measure volume {}", volume)).await?;
        let bytes = parse_measurement(&result.stdout)?;

        info!(
            "measured volume {}: {} bytes in {:?}",
            volume,
            bytes,
            started.elapsed()
        );
        Ok(bytes)
    }
}
