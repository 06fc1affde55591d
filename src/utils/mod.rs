pub mod number_seq;

/// Human-readable byte sizes for log lines.
pub fn formatted_size(size: usize) -> String {
    formatted_sizef(size as f64)
}

pub fn formatted_sizef(size: f64) -> String {
    const K: f64 = 1024.0;
    if size < K {
        format!("{:.0}B", size)
    } else if size < K * K {
        format!("{:.1}KB", size / K)
    } else if size < K * K * K {
        format!("{:.1}MB", size / (K * K))
    } else {
        format!("{:.1}GB", size / (K * K * K))
    }
}
