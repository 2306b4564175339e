/// CLI argument parsing

use clap::{Parser, Subcommand};

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "vackup")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Docker CLI binary to run
    #[arg(long, global = true, env = "VACKUP_DOCKER")]
    pub docker: Option<String>,

    /// Upper bound for one runtime call, e.g. "30m"
    #[arg(long, global = true)]
    pub timeout: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run HTTP API server mode
    #[cfg(feature = "server")]
    Serve {
        /// Port to listen on (config default: 3000)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (config default: 127.0.0.1)
        #[arg(long)]
        host: Option<String>,

        /// Enable CORS for cross-origin requests
        #[arg(long)]
        cors: bool,
    },

    /// List volumes with driver and attached containers
    Volumes {
        /// Measure every volume
        #[arg(short, long)]
        sizes: bool,
    },

    /// Show the size of a volume's contents
    Size {
        volume: String,
    },

    /// Export a volume to a .tar.gz archive
    Export {
        volume: String,
        /// Destination archive path
        path: String,
    },

    /// Import a .tar.gz archive into a volume
    Import {
        volume: String,
        /// Archive to extract
        path: String,
    },

    /// Copy a volume into a new volume
    Clone {
        volume: String,
        destination: String,
    },

    /// Save a volume into a local image
    Save {
        volume: String,
        /// Image to create (default: vackup-<volume>:latest)
        image: Option<String>,
    },

    /// Load a volume from an image created by save
    Load {
        volume: String,
        image: String,
    },

    /// Copy a volume's contents into a host directory
    Transfer {
        volume: String,
        /// Existing, writable host directory
        path: String,
    },

    /// Start a container from an image with the volume mounted
    Run {
        volume: String,
        image: String,
        /// Mount point inside the container
        #[arg(long)]
        target: Option<String>,
    },

    /// Delete all contents of a volume
    Empty {
        volume: String,
    },

    /// Remove a volume
    Delete {
        volume: String,
    },

    /// Print volume events as they happen
    Events,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
