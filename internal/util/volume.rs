use std::path::Path;
use std::process::Command;

/// Filesystem free-space capability.
///
/// Rotation and the backup-directory preflight only need a single number,
/// and both must degrade gracefully when the probe cannot answer: callers
/// treat `None` as "assume enough" and log a warning.
pub trait SpaceProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> Option<u64>;
    fn capacity(&self, path: &Path) -> Option<u64>;
}

/// statvfs-backed probe, the default on unix.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        statvfs_usage(path).map(|usage| usage.free_bytes)
    }

    fn capacity(&self, path: &Path) -> Option<u64> {
        statvfs_usage(path).map(|usage| usage.capacity_bytes)
    }
}

/// `df -k` fallback for platforms where statvfs is unavailable or lies
/// (network mounts under some fuse drivers report zero blocks).
#[derive(Debug, Default, Clone, Copy)]
pub struct DfCommandProbe;

impl SpaceProbe for DfCommandProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        df_kilobytes(path).map(|(_, available)| available.saturating_mul(1024))
    }

    fn capacity(&self, path: &Path) -> Option<u64> {
        df_kilobytes(path).map(|(total, _)| total.saturating_mul(1024))
    }
}

/// Runtime-selected probe: statvfs first, `df` when statvfs cannot answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoProbe {
    statvfs: StatvfsProbe,
    df: DfCommandProbe,
}

impl SpaceProbe for AutoProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        match self.statvfs.free_space(path) {
            Some(bytes) if bytes > 0 => Some(bytes),
            _ => self.df.free_space(path),
        }
    }

    fn capacity(&self, path: &Path) -> Option<u64> {
        match self.statvfs.capacity(path) {
            Some(bytes) if bytes > 0 => Some(bytes),
            _ => self.df.capacity(path),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct VolumeUsage {
    capacity_bytes: u64,
    free_bytes: u64,
}

fn to_u64_saturated(value: u128) -> u64 {
    value.min(u64::MAX as u128) as u64
}

#[cfg(unix)]
fn statvfs_usage(path: &Path) -> Option<VolumeUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let raw = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(raw.as_ptr(), &mut stat) };
    if result != 0 {
        return None;
    }
    let block_size = u128::from(stat.f_frsize.max(stat.f_bsize));
    let capacity = block_size.saturating_mul(u128::from(stat.f_blocks));
    let free = block_size.saturating_mul(u128::from(stat.f_bavail));
    Some(VolumeUsage {
        capacity_bytes: to_u64_saturated(capacity),
        free_bytes: to_u64_saturated(free),
    })
}

#[cfg(not(unix))]
fn statvfs_usage(_path: &Path) -> Option<VolumeUsage> {
    None
}

fn df_kilobytes(path: &Path) -> Option<(u64, u64)> {
    let output = Command::new("df")
        .arg("-k")
        .arg(path.as_os_str())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_df_output(&String::from_utf8_lossy(&output.stdout))
}

// POSIX df -k: header line, then "<fs> <1k-blocks> <used> <available> ...".
fn parse_df_output(output: &str) -> Option<(u64, u64)> {
    let line = output.lines().nth(1)?;
    let mut fields = line.split_whitespace();
    let _filesystem = fields.next()?;
    let total: u64 = fields.next()?.parse().ok()?;
    let _used: u64 = fields.next()?.parse().ok()?;
    let available: u64 = fields.next()?.parse().ok()?;
    Some((total, available))
}

#[cfg(test)]
mod tests {
    use super::{parse_df_output, to_u64_saturated, AutoProbe, SpaceProbe, StatvfsProbe};
    use std::path::PathBuf;

    #[test]
    fn to_u64_saturated_clamps_large_numbers() {
        assert_eq!(to_u64_saturated(10), 10);
        assert_eq!(to_u64_saturated(u128::MAX), u64::MAX);
    }

    #[test]
    fn statvfs_probe_reads_existing_path() {
        let probe = StatvfsProbe;
        let free = probe.free_space(&std::env::temp_dir());
        assert!(free.is_some());
        let capacity = probe.capacity(&std::env::temp_dir());
        assert!(capacity.unwrap_or(0) >= free.unwrap_or(0));
    }

    #[test]
    fn statvfs_probe_handles_missing_path() {
        let probe = StatvfsProbe;
        assert_eq!(probe.free_space(&PathBuf::from("/path/not/found/bt")), None);
    }

    #[test]
    fn auto_probe_answers_for_temp_dir() {
        let probe = AutoProbe::default();
        assert!(probe.free_space(&std::env::temp_dir()).unwrap_or(0) > 0);
    }

    #[test]
    fn parse_df_output_reads_posix_layout() {
        let output = "Filesystem     1K-blocks      Used Available Use% Mounted on\n\
                      /dev/sda1      102400000  51200000  46080000  53% /\n";
        let (total, available) = parse_df_output(output).expect("parse");
        assert_eq!(total, 102_400_000);
        assert_eq!(available, 46_080_000);
    }

    #[test]
    fn parse_df_output_rejects_garbage() {
        assert_eq!(parse_df_output(""), None);
        assert_eq!(parse_df_output("header only\n"), None);
        assert_eq!(parse_df_output("h\nfs abc def ghi\n"), None);
    }
}
