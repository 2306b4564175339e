/// Archive transfer engine
///
/// Export, import, clone, save, load and host transfer, each run as a
/// short sequence of runtime calls and disposable helper containers. Every
/// operation is attempted exactly once; on failure the caller gets the reason
/// and may invoke it again.
///
/// Operations on the same volume are not serialized against each other. A
/// concurrent export and import of one volume interleave in an undefined way;
/// the UI prevents that by disabling actions while one is in progress.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::container::{run_disposable, ContainerSpec, DisposableContainer, Mount};
use crate::core::error::{VolumeError, VolumeResult};
use crate::core::executor::DockerCli;
use crate::core::inventory::InventoryReader;
use crate::core::size::SizeCalculator;
use crate::utils::constants::{CLONE_TARGET_MOUNT, HOST_MOUNT, IMAGE_DATA_DIR, VOLUME_MOUNT};
use crate::utils::{is_dir_writable, is_file_readable, is_valid_image_name, is_valid_volume_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Export,
    Import,
    Clone,
    Save,
    Load,
    Transfer,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Export => "export",
            TransferKind::Import => "import",
            TransferKind::Clone => "clone",
            TransferKind::Save => "save",
            TransferKind::Load => "load",
            TransferKind::Transfer => "transfer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
}

/// Record of one transfer operation, alive for the duration of its request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJob {
    pub kind: TransferKind,
    pub source: String,
    pub destination: String,
    pub status: JobStatus,
    pub warnings: Vec<String>,
    /// Save only: an image with the same name existed and was replaced
    pub replaced_existing: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    pub fn new(kind: TransferKind, source: &str, destination: &str) -> Self {
        Self {
            kind,
            source: source.to_string(),
            destination: destination.to_string(),
            status: JobStatus::Pending,
            warnings: Vec::new(),
            replaced_existing: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Pending -> Running
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Running -> Succeeded
    pub fn succeed(&mut self) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = JobStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Pending | Running -> Failed
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = JobStatus::Failed {
            message: message.into(),
        };
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded | JobStatus::Failed { .. })
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

pub(crate) fn require_volume_name(name: &str) -> VolumeResult<()> {
    if is_valid_volume_name(name) {
        Ok(())
    } else {
        Err(VolumeError::invalid(format!("invalid volume name {:?}", name)))
    }
}

pub(crate) fn require_image_name(image: &str) -> VolumeResult<()> {
    if image.trim().is_empty() {
        return Err(VolumeError::invalid("image name must not be empty"));
    }
    if is_valid_image_name(image) {
        Ok(())
    } else {
        Err(VolumeError::invalid(format!("invalid image name {:?}", image)))
    }
}

/// Absolute host path that can be expressed in a `--mount` option
fn require_host_path(path: &str) -> VolumeResult<PathBuf> {
    if path.trim().is_empty() {
        return Err(VolumeError::invalid("path must not be empty"));
    }
    if path.contains(',') || path.contains('\n') {
        return Err(VolumeError::invalid(format!(
            "path {:?} contains characters that cannot be mounted",
            path
        )));
    }
    let path = PathBuf::from(path);
    if !path.is_absolute() {
        return Err(VolumeError::invalid(format!(
            "path {} must be absolute",
            path.display()
        )));
    }
    Ok(path)
}

/// Split an archive path into its (directory, file name)
fn split_archive_path(path: &Path) -> VolumeResult<(String, String)> {
    let dir = path.parent().map(|p| p.to_string_lossy().to_string());
    let file = path.file_name().map(|f| f.to_string_lossy().to_string());
    match (dir, file) {
        (Some(dir), Some(file)) if !dir.is_empty() => Ok((dir, file)),
        _ => Err(VolumeError::invalid(format!(
            "{} is not a file path",
            path.display()
        ))),
    }
}

pub struct TransferEngine {
    cli: DockerCli,
    helper_image: String,
    sizes: Arc<SizeCalculator>,
    inventory: Arc<InventoryReader>,
}

impl TransferEngine {
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

    async fn require_existing(&self, volume: &str) -> VolumeResult<()> {
        if self.cli.volume_exists(volume).await? {
            Ok(())
        } else {
            Err(VolumeError::NotFound(format!("volume {} does not exist", volume)))
        }
    }

    /// An empty volume has nothing to export, save or transfer
    async fn require_content(&self, volume: &str) -> VolumeResult<()> {
        if self.sizes.calculate_size(volume).await? == 0 {
            return Err(VolumeError::EmptyVolume(volume.to_string()));
        }
        Ok(())
    }

    /// Create the volume if it is missing; true when this call created it
    async fn ensure_volume(&self, volume: &str) -> VolumeResult<bool> {
        if self.cli.volume_exists(volume).await? {
            return Ok(false);
        }
        info!("creating volume {}", volume);
        self.cli.create_volume(volume).await?;
        self.inventory.invalidate();
        Ok(true)
    }

    /// Remove a volume this operation created before failing to fill it
    async fn discard_created(&self, volume: &str) {
        if let Err(e) = self.cli.remove_volume(volume).await {
            warn!("failed to remove partial volume {}: {}", volume, e);
        }
        self.sizes.cache().forget(volume);
        self.inventory.invalidate();
    }

    fn contents_changed(&self, volume: &str) {
        self.sizes.cache().invalidate(volume);
        self.inventory.invalidate();
    }

    async fn run_job<F, Fut>(&self, mut job: TransferJob, op: F) -> VolumeResult<TransferJob>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VolumeResult<Vec<String>>>,
    {
        job.start();
        info!(
            "{} started: {} -> {}",
            job.kind.as_str(),
            job.source,
            job.destination
        );

        match op().await {
            Ok(warnings) => {
                for warning in &warnings {
                    warn!("{} {}: {}", job.kind.as_str(), job.source, warning);
                }
                job.warnings = warnings;
                job.succeed();
                info!(
                    "{} finished: {} -> {} in {}ms",
                    job.kind.as_str(),
                    job.source,
                    job.destination,
                    job.duration().map(|d| d.num_milliseconds()).unwrap_or(0)
                );
                Ok(job)
            }
            Err(e) => {
                job.fail(e.to_string());
                warn!(
                    "{} failed: {} -> {}: {}",
                    job.kind.as_str(),
                    job.source,
                    job.destination,
                    e
                );
                Err(e)
            }
        }
    }

    /// Write a gzip'ed tarball of the volume contents to `path` on the host
    pub async fn export_volume(&self, volume: &str, path: &str) -> VolumeResult<TransferJob> {
        require_volume_name(volume)?;
        let archive = require_host_path(path)?;
        let (dir, file) = split_archive_path(&archive)?;
        if !is_dir_writable(&dir) {
            return Err(VolumeError::invalid(format!(
                "destination directory {} is not writable",
                dir
            )));
        }

        let job = TransferJob::new(TransferKind::Export, volume, path);
        self.run_job(job, || async {
            self.require_existing(volume).await?;
            self.require_content(volume).await?;

            let target = format!("{}/{}", HOST_MOUNT, file);
            let spec = ContainerSpec::new("export", &self.helper_image)
                .mount(Mount::volume(volume, VOLUME_MOUNT, true))
                .mount(Mount::bind(&dir, HOST_MOUNT, false))
                .shell_with_args(format!("tar -czf \"$1\" -C {} .", VOLUME_MOUNT), &[&target]);

            run_disposable(&self.cli, &spec, &format!("export volume {}", volume)).await?;
            Ok::<_, VolumeError>(Vec::new())
        })
        .await
    }

    /// Extract a gzip'ed tarball from the host into the volume, overwriting
    /// conflicting paths
    pub async fn import_volume(&self, volume: &str, path: &str) -> VolumeResult<TransferJob> {
        require_volume_name(volume)?;
        let archive = require_host_path(path)?;
        let (dir, file) = split_archive_path(&archive)?;
        if !is_file_readable(&archive) {
            return Err(VolumeError::invalid(format!(
                "archive {} is not a readable file",
                archive.display()
            )));
        }

        let job = TransferJob::new(TransferKind::Import, path, volume);
        self.run_job(job, || async {
            let created = self.ensure_volume(volume).await?;

            let source = format!("{}/{}", HOST_MOUNT, file);
            let spec = ContainerSpec::new("import", &self.helper_image)
                .mount(Mount::volume(volume, VOLUME_MOUNT, false))
                .mount(Mount::bind(&dir, HOST_MOUNT, true))
                .shell_with_args(format!("tar -xzf \"$1\" -C {}", VOLUME_MOUNT), &[&source]);

            let outcome = run_disposable(&self.cli, &spec, &format!("import into volume {}", volume)).await;
            // A failed extraction may still have written part of the archive
            self.contents_changed(volume);
            if outcome.is_err() && created {
                self.discard_created(volume).await;
            }
            outcome?;
            Ok::<_, VolumeError>(Vec::new())
        })
        .await
    }

    /// Copy a volume into a new volume; an existing destination is a conflict
    pub async fn clone_volume(&self, source: &str, destination: &str) -> VolumeResult<TransferJob> {
        require_volume_name(source)?;
        require_volume_name(destination)?;
        if source == destination {
            return Err(VolumeError::invalid("source and destination are the same volume"));
        }

        let job = TransferJob::new(TransferKind::Clone, source, destination);
        self.run_job(job, || async {
            self.require_existing(source).await?;
            if self.cli.volume_exists(destination).await? {
                return Err(VolumeError::conflict(format!(
                    "volume {} already exists",
                    destination
                )));
            }

            self.cli.create_volume(destination).await?;
            self.inventory.invalidate();

            let spec = ContainerSpec::new("clone", &self.helper_image)
                .mount(Mount::volume(source, VOLUME_MOUNT, true))
                .mount(Mount::volume(destination, CLONE_TARGET_MOUNT, false))
                .shell(format!("cp -Rp {}/. {}/", VOLUME_MOUNT, CLONE_TARGET_MOUNT));

            let copied = run_disposable(
                &self.cli,
                &spec,
                &format!("clone volume {} to {}", source, destination),
            )
            .await;

            if let Err(e) = copied {
                // Do not leave a half-filled clone behind
                self.discard_created(destination).await;
                return Err(e);
            }

            self.contents_changed(destination);
            Ok::<_, VolumeError>(Vec::new())
        })
        .await
    }

    /// Commit the volume contents into a local image under the data directory.
    ///
    /// An existing image with the same name is replaced; that is reported as a
    /// warning rather than refused.
    pub async fn save_volume(&self, volume: &str, image: &str) -> VolumeResult<TransferJob> {
        require_volume_name(volume)?;
        require_image_name(image)?;

        let job = TransferJob::new(TransferKind::Save, volume, image);
        let mut job = self.run_job(job, || async {
            self.require_existing(volume).await?;
            self.require_content(volume).await?;

            let mut warnings = Vec::new();
            if self.cli.image_exists(image).await? {
                warnings.push(format!("existing local image {} was replaced", image));
            }

            let spec = ContainerSpec::new("save", &self.helper_image)
                .mount(Mount::volume(volume, VOLUME_MOUNT, true))
                .shell(format!(
                    "mkdir -p {0} && cp -Rp {1}/. {0}/",
                    IMAGE_DATA_DIR, VOLUME_MOUNT
                ));

            let context = format!("save volume {} to image {}", volume, image);
            let container = DisposableContainer::create(&self.cli, &spec).await?;
            let outcome = async {
                container.start_attached().await?.check(&context)?;
                container.commit(image).await
            }
            .await;
            container.remove().await;
            outcome?;

            Ok::<_, VolumeError>(warnings)
        })
        .await?;

        job.replaced_existing = !job.warnings.is_empty();
        Ok(job)
    }

    /// Copy the data directory of an image into the volume, creating it if needed
    pub async fn load_volume(&self, volume: &str, image: &str) -> VolumeResult<TransferJob> {
        require_volume_name(volume)?;
        require_image_name(image)?;

        let job = TransferJob::new(TransferKind::Load, image, volume);
        self.run_job(job, || async {
            let created = self.ensure_volume(volume).await?;

            let spec = ContainerSpec::new("load", image)
                .mount(Mount::volume(volume, VOLUME_MOUNT, false))
                .shell(format!("cp -Rp {}/. {}/", IMAGE_DATA_DIR, VOLUME_MOUNT));

            let outcome = run_disposable(
                &self.cli,
                &spec,
                &format!("load image {} into volume {}", image, volume),
            )
            .await;
            self.contents_changed(volume);
            if outcome.is_err() && created {
                self.discard_created(volume).await;
            }
            outcome?;
            Ok::<_, VolumeError>(Vec::new())
        })
        .await
    }

    /// Copy the volume contents into a host directory, keeping the tree layout
    pub async fn transfer_volume(&self, volume: &str, path: &str) -> VolumeResult<TransferJob> {
        require_volume_name(volume)?;
        let dir = require_host_path(path)?;
        if !is_dir_writable(&dir) {
            return Err(VolumeError::invalid(format!(
                "destination directory {} is not writable",
                dir.display()
            )));
        }

        let job = TransferJob::new(TransferKind::Transfer, volume, path);
        self.run_job(job, || async {
            self.require_existing(volume).await?;
            self.require_content(volume).await?;

            let spec = ContainerSpec::new("transfer", &self.helper_image)
                .mount(Mount::volume(volume, VOLUME_MOUNT, true))
                .mount(Mount::bind(path, HOST_MOUNT, false))
                .shell(format!("cp -Rp {}/. {}/", VOLUME_MOUNT, HOST_MOUNT));

            run_disposable(&self.cli, &spec, &format!("transfer volume {}", volume)).await?;
            Ok::<_, VolumeError>(Vec::new())
        })
        .await
    }
}
