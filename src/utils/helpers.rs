/// Helper utilities for the vackup service

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::utils::constants::ZERO_SIZE;

/// Format a byte count the way the volume table displays it ("4.2MB", "0B")
///
/// Decimal units with one fractional digit; values below 1kB are printed as
/// whole bytes so an empty volume is always exactly "0B".
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["kB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return ZERO_SIZE.to_string();
    }
    if bytes < 1000 {
        return format!("{}B", bytes);
    }

    let mut size = bytes as f64 / 1000.0;
    let mut unit_index = 0;

    // 999.96kB would print as "1000.0kB"
    while size >= 999.95 && unit_index < UNITS.len() - 1 {
        size /= 1000.0;
        unit_index += 1;
    }

    format!("{:.1}{}", size, UNITS[unit_index])
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Generate a random hex string of specified length
pub fn generate_hex_string(length: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| format!("{:x}", rng.gen::<u8>() % 16))
        .collect()
}

fn volume_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("volume name pattern"))
}

fn image_reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-/:@]*$").expect("image reference pattern")
    })
}

/// Validate a volume name using the runtime's own naming rule
///
/// Names starting with '-' are rejected as well, so a name can never be
/// mistaken for a CLI flag.
pub fn is_valid_volume_name(name: &str) -> bool {
    volume_name_regex().is_match(name)
}

/// Validate an image reference (repository, optional tag or digest)
pub fn is_valid_image_name(image: &str) -> bool {
    image.len() <= 255 && image_reference_regex().is_match(image) && !image.ends_with(':')
}

/// Check if a file exists and is readable
pub fn is_file_readable<P: AsRef<Path>>(path: P) -> bool {
    std::fs::File::open(path.as_ref()).is_ok() && path.as_ref().is_file()
}

/// Check if a directory exists and is writable
pub fn is_dir_writable<P: AsRef<Path>>(path: P) -> bool {
    if let Ok(metadata) = std::fs::metadata(&path) {
        metadata.is_dir() && !metadata.permissions().readonly()
    } else {
        false
    }
}

/// Truncate string with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
