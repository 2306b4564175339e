/// Disposable helper containers
///
/// A disposable container is created for exactly one filesystem operation on
/// mounted volumes and removed afterwards. Removal is attempted on every exit
/// path: explicitly through [`DisposableContainer::remove`], or from `Drop`
/// when an error or panic skipped the explicit call.

use tracing::{debug, warn};

use crate::core::error::VolumeResult;
use crate::core::executor::{CommandResult, DockerCli};
use crate::utils::constants::{CONTAINER_LABEL, CONTAINER_PREFIX};
use crate::utils::generate_hex_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Volume,
    Bind,
}

/// One `--mount` entry of a helper container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn volume(name: &str, target: &str, read_only: bool) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.to_string(),
            target: target.to_string(),
            read_only,
        }
    }

    pub fn bind(path: &str, target: &str, read_only: bool) -> Self {
        Self {
            kind: MountKind::Bind,
            source: path.to_string(),
            target: target.to_string(),
            read_only,
        }
    }

    /// Value for `--mount`; sources never contain ',' (checked at the API boundary)
    pub fn to_arg(&self) -> String {
        let kind = match self.kind {
            MountKind::Volume => "volume",
            MountKind::Bind => "bind",
        };
        let mut arg = format!("type={},src={},dst={}", kind, self.source, self.target);
        if self.read_only {
            arg.push_str(",readonly");
        }
        arg
    }
}

/// What a helper container should run and with which mounts
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Short tag that ends up in the container name (size, export, ...)
    pub purpose: &'static str,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(purpose: &'static str, image: impl Into<String>) -> Self {
        Self {
            purpose,
            image: image.into(),
            mounts: Vec::new(),
            command: Vec::new(),
        }
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Run `script` through `/bin/sh -c`
    pub fn shell(self, script: impl Into<String>) -> Self {
        self.shell_with_args(script, &[])
    }

    /// Run `script` with positional parameters (`$1`, `$2`, ...).
    ///
    /// User supplied values go into `args`, never into the script text.
    pub fn shell_with_args(mut self, script: impl Into<String>, args: &[&str]) -> Self {
        self.command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.into(),
            CONTAINER_PREFIX.to_string(),
        ];
        self.command.extend(args.iter().map(|a| a.to_string()));
        self
    }

    fn create_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            CONTAINER_LABEL.to_string(),
        ];
        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_arg());
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// A created helper container that is removed again on every exit path
pub struct DisposableContainer {
    cli: DockerCli,
    name: String,
    removed: bool,
}

impl DisposableContainer {
    pub async fn create(cli: &DockerCli, spec: &ContainerSpec) -> VolumeResult<Self> {
        let name = format!(
            "{}-{}-{}",
            CONTAINER_PREFIX,
            spec.purpose,
            generate_hex_string(12)
        );

        let created = cli
            .run(&spec.create_args(&name))
            .await
            .and_then(|result| result.check(&format!("create {} container", spec.purpose)));

        match created {
            Ok(_) => {
                debug!("created helper container {}", name);
                Ok(Self {
                    cli: cli.clone(),
                    name,
                    removed: false,
                })
            }
            Err(e) => {
                // A half-failed create can still leave a container behind
                remove_container(cli, &name).await;
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the container and wait for it, capturing its output
    pub async fn start_attached(&self) -> VolumeResult<CommandResult> {
        self.cli
            .run(&[
                "start".to_string(),
                "--attach".to_string(),
                self.name.clone(),
            ])
            .await
    }

    /// Snapshot the container filesystem into a local image
    pub async fn commit(&self, image: &str) -> VolumeResult<()> {
        self.cli
            .run_checked(
                &[
                    "container".to_string(),
                    "commit".to_string(),
                    "--change".to_string(),
                    r#"CMD ["/bin/sh"]"#.to_string(),
                    self.name.clone(),
                    image.to_string(),
                ],
                &format!("commit {} to image {}", self.name, image),
            )
            .await?;
        Ok(())
    }

    pub async fn remove(mut self) {
        self.removed = true;
        remove_container(&self.cli, &self.name).await;
    }
}

impl Drop for DisposableContainer {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        let cli = self.cli.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_container(&cli, &name).await;
                });
            }
            Err(_) => warn!("no runtime to remove helper container {}", name),
        }
    }
}

async fn remove_container(cli: &DockerCli, name: &str) {
    let result = cli
        .run(&["rm".to_string(), "--force".to_string(), name.to_string()])
        .await;

    match result {
        Ok(r) if r.success() => debug!("removed helper container {}", name),
        // Nothing to remove when create never got that far
        Ok(r) if r.stderr.contains("No such container") => {}
        Ok(r) => warn!("failed to remove helper container {}: {}", name, r.stderr.trim()),
        Err(e) => warn!("failed to remove helper container {}: {}", name, e),
    }
}

/// Create, run and remove a helper container, failing on a nonzero exit
pub async fn run_disposable(
    cli: &DockerCli,
    spec: &ContainerSpec,
    context: &str,
) -> VolumeResult<CommandResult> {
    let container = DisposableContainer::create(cli, spec).await?;
    let outcome = container.start_attached().await;
    container.remove().await;

    outcome?.check(context)
}
