//! Human-readable size formatting for dump footers and summaries.

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;
#[cfg(target_pointer_width = "64")]
pub const TB: usize = 1024 * GB;

/// Scale `bytes` down to the unit picked by [`human_unit`]. A value stays in
/// a unit until it exceeds 99 of them, so "102400" prints as "100 KB", not
/// "0 MB".
pub fn human_size(bytes: usize) -> usize {
    match human_unit(bytes) {
        "BYTES" => bytes,
        "KB" => bytes / KB,
        "MB" => bytes / MB,
        "GB" => bytes / GB,
        _ => {
            #[cfg(target_pointer_width = "64")]
            {
                bytes / TB
            }
            #[cfg(target_pointer_width = "32")]
            {
                bytes
            }
        }
    }
}

/// The unit [`human_size`] scaled to.
pub fn human_unit(bytes: usize) -> &'static str {
    if bytes <= 99 * KB {
        "BYTES"
    } else if bytes <= 99 * MB {
        "KB"
    } else if bytes <= 99 * GB {
        "MB"
    } else {
        #[cfg(target_pointer_width = "64")]
        {
            if bytes <= 99 * TB {
                "GB"
            } else {
                "TB"
            }
        }
        #[cfg(target_pointer_width = "32")]
        {
            "GB"
        }
    }
}

/// Two-letter variant of [`human_unit`] for narrow columns.
pub fn human_unit_short(bytes: usize) -> &'static str {
    match human_unit(bytes) {
        "BYTES" => "BY",
        unit => unit,
    }
}

/// A byte as it should appear in a hex dump's character gutter.
pub fn printable(b: u8) -> char {
    if (0x20..0x80).contains(&b) {
        b as char
    } else {
        '.'
    }
}
