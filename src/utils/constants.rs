/// Mount points, image paths and runtime vocabulary shared by the service
///
/// Helper containers always see the volumes they work on at the same paths,
/// so scripts and argument lists can be built without any string templating.

/// Where the volume being operated on is mounted inside a helper container
pub const VOLUME_MOUNT: &str = "/vackup-volume";

/// Where a host directory is mounted for export/import/transfer
pub const HOST_MOUNT: &str = "/vackup";

/// Mount point of the destination volume during a clone
pub const CLONE_TARGET_MOUNT: &str = "/vackup-target";

/// Directory inside saved images that holds the volume contents
pub const IMAGE_DATA_DIR: &str = "/volume-data";

/// Prefix for every disposable container name
pub const CONTAINER_PREFIX: &str = "vackup";

/// Label attached to disposable containers so leftovers can be found by hand
pub const CONTAINER_LABEL: &str = "com.docker.desktop.extension.vackup=disposable";

/// Mount point of the volume in containers started by the run operation
pub const DEFAULT_RUN_TARGET: &str = "/data";

/// Formatted size of an empty volume
pub const ZERO_SIZE: &str = "0B";

/// Volume events that can change inventory or contents
pub const WATCHED_EVENT_ACTIONS: &[&str] = &["create", "destroy", "mount", "unmount"];

/// Stderr fragments the docker CLI prints when the daemon cannot be reached
pub const DAEMON_UNREACHABLE_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "error during connect",
    "Is the docker daemon running",
    "docker daemon is not running",
];

/// Stderr fragments reported for a missing volume
pub const NO_SUCH_VOLUME_MARKERS: &[&str] = &["no such volume", "No such volume"];

/// Default configuration values
pub const DEFAULT_DOCKER_BINARY: &str = "docker";
pub const DEFAULT_HELPER_IMAGE: &str = "busybox";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SIZE_CONCURRENCY: usize = 4;
pub const DEFAULT_EVENTS_BACKOFF_INITIAL: &str = "1s";
pub const DEFAULT_EVENTS_BACKOFF_MAX: &str = "30s";

/// Capacity of the internal volume event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
