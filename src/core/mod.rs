pub mod container;
pub mod error;
pub mod events;
pub mod executor;
pub mod inventory;
pub mod lifecycle;
pub mod service;
pub mod size;
pub mod transfer;

#[cfg(test)]
pub mod testing;

pub use error::{VolumeError, VolumeResult};
pub use events::{VolumeAction, VolumeEvent};
pub use executor::{CommandResult, CommandRunner, DockerCli, ProcessRunner};
pub use inventory::VolumeSummary;
pub use lifecycle::RunningContainer;
pub use service::{default_image_name, VolumeService};
pub use transfer::{JobStatus, TransferJob, TransferKind};
