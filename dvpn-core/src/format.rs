//! Human-readable traffic and duration formatting

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Format a byte count, e.g. `1.50 KB`
pub fn bytes_display(bytes: u64) -> String {
    let unit = |divisor: u64, suffix: &str| format!("{:.2} {}", bytes as f64 / divisor as f64, suffix);

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        unit(KB, "KB")
    } else if bytes < GB {
        unit(MB, "MB")
    } else {
        unit(GB, "GB")
    }
}

/// Format a duration in seconds as `HH:MM:SS`
///
/// Hours are not wrapped, so long sessions render as e.g. `100:00:00`.
pub fn time_display(seconds: u64) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_display() {
        assert_eq!(bytes_display(0), "0 B");
        assert_eq!(bytes_display(1023), "1023 B");
        assert_eq!(bytes_display(1536), "1.50 KB");
        assert_eq!(bytes_display(5 * MB), "5.00 MB");
        assert_eq!(bytes_display(3 * GB + GB / 4), "3.25 GB");
    }

    #[test]
    fn test_time_display() {
        assert_eq!(time_display(0), "00:00:00");
        assert_eq!(time_display(59), "00:00:59");
        assert_eq!(time_display(3661), "01:01:01");
        assert_eq!(time_display(360_000), "100:00:00");
    }
}
