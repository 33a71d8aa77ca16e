pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

/// Default partition alignment used by every partition table we create.
pub const PARTITION_ALIGN: u64 = MIB;

pub fn align_up(size: u64, block_size: u64) -> u64 {
    size.div_ceil(block_size) * block_size
}

pub fn align_down(size: u64, block_size: u64) -> u64 {
    (size / block_size) * block_size
}

pub fn human_size(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::{align_down, align_up, human_size, GIB, MIB};

    #[test]
    fn aligns_to_block_boundaries() {
        assert_eq!(align_up(1, MIB), MIB);
        assert_eq!(align_up(MIB, MIB), MIB);
        assert_eq!(align_up(0, MIB), 0);
        assert_eq!(align_down(MIB + 1, MIB), MIB);
        assert_eq!(align_down(MIB - 1, MIB), 0);
    }

    #[test]
    fn renders_human_sizes() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512 * MIB), "512.0 MiB");
        assert_eq!(human_size(25 * GIB), "25.0 GiB");
    }
}
