use xxhash_rust::xxh3::xxh3_64;

/// 格式化字节大小为易读的字符串
pub fn format_size(size: u64) -> String {
    if size == 0 {
        return "0.00 B".to_string();
    }

    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = size as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

/// 计算分块内容的 XXH3 校验值（十六进制）
pub fn checksum(data: &[u8]) -> String {
    format!("{:016x}", xxh3_64(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_picks_largest_unit() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.00 MB");
    }

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        let a = checksum(b"chunk-0");
        assert_eq!(a, checksum(b"chunk-0"));
        assert_ne!(a, checksum(b"chunk-1"));
        assert_eq!(a.len(), 16);
    }
}
