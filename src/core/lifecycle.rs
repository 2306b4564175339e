/// Empty, delete and run operations on whole volumes

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::core::container::{run_disposable, ContainerSpec, Mount};
use crate::core::error::{VolumeError, VolumeResult};
use crate::core::executor::DockerCli;
use crate::core::inventory::InventoryReader;
use crate::core::size::SizeCalculator;
use crate::core::transfer::{require_image_name, require_volume_name};
use crate::utils::constants::VOLUME_MOUNT;

/// A container started from an image with a volume mounted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningContainer {
    pub id: String,
    pub volume: String,
    pub image: String,
    pub target: String,
}

pub struct VolumeLifecycle {
    cli: DockerCli,
    helper_image: String,
    sizes: Arc<SizeCalculator>,
    inventory: Arc<InventoryReader>,
}

impl VolumeLifecycle {
    pub fn new(
        cli: DockerCli,
        helper_image: impl Into<String>,
        sizes: Arc<SizeCalculator>,
        inventory: Arc<InventoryReader>,
    ) -> Self {
        Self {
            cli,
            helper_image: helper_image.into(),
            sizes,
            inventory,
        }
    }

    /// Delete everything inside the volume, dotfiles included, keeping the
    /// volume itself
    pub async fn empty_volume(&self, name: &str) -> VolumeResult<()> {
        require_volume_name(name)?;
        if !self.cli.volume_exists(name).await? {
            return Err(VolumeError::NotFound(format!("volume {} does not exist", name)));
        }

        info!("emptying volume {}", name);
        let spec = ContainerSpec::new("empty", &self.helper_image)
            .mount(Mount::volume(name, VOLUME_MOUNT, false))
            .shell(format!(
                "find {} -mindepth 1 -maxdepth 1 -exec rm -rf {{}} +",
                VOLUME_MOUNT
            ));

        let outcome = run_disposable(&self.cli, &spec, &format!("empty volume {}", name)).await;
        // Partial deletion still changes the size
        self.sizes.cache().invalidate(name);
        self.inventory.invalidate();
        outcome?;

        info!("emptied volume {}", name);
        Ok(())
    }

    /// Remove the volume; refused while any container, running or stopped,
    /// still references it
    pub async fn delete_volume(&self, name: &str) -> VolumeResult<()> {
        require_volume_name(name)?;
        if !self.cli.volume_exists(name).await? {
            return Err(VolumeError::NotFound(format!("volume {} does not exist", name)));
        }

        let attached = self.cli.containers_using(name).await?;
        if !attached.is_empty() {
            return Err(VolumeError::conflict(format!(
                "volume {} is used by container(s): {}",
                name,
                attached.join(", ")
            )));
        }

        self.cli.remove_volume(name).await?;
        self.sizes.cache().forget(name);
        self.inventory.invalidate();

        info!("deleted volume {}", name);
        Ok(())
    }

    /// Start a detached container from `image` with the volume mounted at
    /// `target`. The container is the caller's and stays after this returns.
    pub async fn run_container(
        &self,
        name: &str,
        image: &str,
        target: &str,
    ) -> VolumeResult<RunningContainer> {
        require_volume_name(name)?;
        require_image_name(image)?;
        if !target.starts_with('/') || target.contains(',') || target.contains('\n') {
            return Err(VolumeError::invalid(format!(
                "mount target {:?} must be an absolute path without ','",
                target
            )));
        }
        if !self.cli.volume_exists(name).await? {
            return Err(VolumeError::NotFound(format!("volume {} does not exist", name)));
        }

        let stdout = self
            .cli
            .run_checked(
                &[
                    "run".to_string(),
                    "--detach".to_string(),
                    "--mount".to_string(),
                    Mount::volume(name, target, false).to_arg(),
                    image.to_string(),
                ],
                &format!("run image {} with volume {}", image, name),
            )
            .await?;
        self.inventory.invalidate();

        let id = stdout.trim().to_string();
        info!("started container {} from {} with volume {} at {}", id, image, name, target);
        Ok(RunningContainer {
            id,
            volume: name.to_string(),
            image: image.to_string(),
            target: target.to_string(),
        })
    }
}
