//! Human-readable rendering of transfer figures.

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// KB/s below 1 MiB/s, MB/s above.
pub fn format_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.1} KB", bytes / KIB)
    } else if bytes < GIB {
        format!("{:.1} MB", bytes / MIB)
    } else {
        format!("{:.2} GB", bytes / GIB)
    }
}

/// `mm:ss`, or `h:mm:ss` past an hour; `--:--` when unknown.
pub fn format_eta(eta_seconds: Option<f64>) -> String {
    let Some(seconds) = eta_seconds.filter(|s| s.is_finite() && *s >= 0.0) else {
        return "--:--".to_string();
    };
    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}
