use crate::error::{Error, Result};
use crate::util::volume::SpaceProbe;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Minimum free space required before a backup cycle may write anything.
pub const MIN_DIR_FREE_BYTES: u64 = 100 * 1024 * 1024;

/// Published artifacts below these sizes are treated as failed dumps.
pub const MIN_PLAIN_SIZE: u64 = 10;
pub const MIN_GZIP_SIZE: u64 = 20;

/// Sidecar written beside every published artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SidecarMetadata {
    pub timestamp: DateTime<Utc>,
    pub container_name: String,
    pub engine: String,
    pub database: String,
    pub file_size: u64,
    pub checksum: String,
    pub backup_file: String,
    pub compressed: bool,
    pub compression_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCheck {
    pub size: u64,
    pub checksum: String,
    pub compressed: bool,
}

/// Create the directory recursively, prove it is writable, and require a
/// sane amount of free space. A probe that cannot answer is assumed healthy.
pub async fn create_backup_dir(path: &Path, probe: &dyn SpaceProbe) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|err| io_context("create dir", path, err))?;
    check_writable(path).await?;
    match probe.free_space(path) {
        Some(free) if free < MIN_DIR_FREE_BYTES => Err(Error::Io(std::io::Error::other(format!(
            "not enough free space in {}: {free} bytes available, {MIN_DIR_FREE_BYTES} required",
            path.display()
        )))),
        Some(_) => Ok(()),
        None => {
            tracing::warn!(path = %path.display(), "free-space probe failed, assuming enough space");
            Ok(())
        }
    }
}

async fn check_writable(path: &Path) -> Result<()> {
    let probe_path = path.join(format!(".bt-write-check-{}", std::process::id()));
    fs::write(&probe_path, b"ok")
        .await
        .map_err(|err| io_context("write probe", path, err))?;
    let _ = fs::remove_file(&probe_path).await;
    Ok(())
}

/// Open the temp file the dump streams into.
pub async fn create_temp_file(path: &Path) -> Result<fs::File> {
    fs::File::create(path)
        .await
        .map_err(|err| io_context("create temp", path, err))
}

/// Flush and fsync on every exit path before the atomic rename.
pub async fn sync_file(file: &mut fs::File) -> Result<()> {
    file.sync_all()
        .await
        .map_err(|err| Error::Io(std::io::Error::other(format!("sync failed: {err}"))))
}

/// Existence plus non-zero size; returns the size.
pub async fn verify_created(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|err| io_context("stat", path, err))?;
    if metadata.len() == 0 {
        return Err(Error::Integrity(format!(
            "backup file {} is empty",
            path.display()
        )));
    }
    Ok(metadata.len())
}

/// Atomic rename, with copy+unlink when the rename crosses filesystems.
pub async fn rename(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            fs::copy(src, dst)
                .await
                .map_err(|copy_err| io_context("cross-device copy", dst, copy_err))?;
            fs::remove_file(src)
                .await
                .map_err(|unlink_err| io_context("cross-device unlink", src, unlink_err))?;
            Ok(())
        }
        Err(err) => Err(io_context("rename", src, err)),
    }
}

fn is_cross_device(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

/// Stream-gzip `src` into `dst` and unlink `src` on success.
pub async fn compress(src: &Path, dst: &Path) -> Result<()> {
    let src_owned = src.to_path_buf();
    let dst_owned = dst.to_path_buf();
    tokio::task::spawn_blocking(move || compress_blocking(&src_owned, &dst_owned))
        .await
        .map_err(|err| Error::Io(std::io::Error::other(format!("gzip task failed: {err}"))))??;
    fs::remove_file(src)
        .await
        .map_err(|err| io_context("unlink after gzip", src, err))?;
    Ok(())
}

fn compress_blocking(src: &Path, dst: &Path) -> Result<()> {
    let input = std::fs::File::open(src).map_err(|err| io_context("gzip open", src, err))?;
    let output = std::fs::File::create(dst).map_err(|err| io_context("gzip create", dst, err))?;
    let mut reader = BufReader::new(input);
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut reader, &mut encoder)
        .map_err(|err| Error::Io(std::io::Error::other(format!("gzip write failed: {err}"))))?;
    let mut output = encoder
        .finish()
        .map_err(|err| Error::Io(std::io::Error::other(format!("gzip finish failed: {err}"))))?;
    output
        .flush()
        .map_err(|err| Error::Io(std::io::Error::other(format!("gzip flush failed: {err}"))))?;
    Ok(())
}

/// sha256 of the file contents, lowercase hex.
pub async fn checksum(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|err| io_context("checksum open", path, err))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|err| io_context("checksum read", path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex_digest(hasher))
}

pub fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Size floor plus checksum; `compressed` is inferred from the extension.
pub async fn verify_integrity(path: &Path) -> Result<ArtifactCheck> {
    let compressed = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
    let min_size = if compressed { MIN_GZIP_SIZE } else { MIN_PLAIN_SIZE };
    let size = fs::metadata(path)
        .await
        .map_err(|err| io_context("verify stat", path, err))?
        .len();
    if size < min_size {
        return Err(Error::Integrity(format!(
            "artifact {} is {size} bytes, below the {min_size} byte minimum",
            path.display()
        )));
    }
    let checksum = checksum(path).await?;
    Ok(ArtifactCheck {
        size,
        checksum,
        compressed,
    })
}

/// Best-effort removal of pipeline leftovers. Never fails.
pub async fn cleanup(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale backup file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cleanup failed");
            }
        }
    }
}

/// Write `<artifact>.meta` as a one-line JSON object.
pub async fn write_metadata(artifact: &Path, metadata: &SidecarMetadata) -> Result<()> {
    let body = serde_json::to_string(metadata)
        .map_err(|err| Error::Io(std::io::Error::other(format!("sidecar encode failed: {err}"))))?;
    let path = sidecar_path(artifact);
    fs::write(&path, body.as_bytes())
        .await
        .map_err(|err| io_context("sidecar write", &path, err))?;
    Ok(())
}

pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut os_string = artifact.as_os_str().to_owned();
    os_string.push(".meta");
    PathBuf::from(os_string)
}

/// First lines of a dump for the content sniff, lowercased. Transparently
/// decompresses gzip artifacts; unreadable content yields no lines rather
/// than an error (the sniff is advisory).
pub async fn read_dump_head(path: &Path, lines: usize) -> Vec<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_dump_head_blocking(&path, lines))
        .await
        .unwrap_or_default()
}

fn read_dump_head_blocking(path: &Path, lines: usize) -> Vec<String> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let gzipped = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let limited = BufReader::new(reader.take(64 * 1024));
    limited
        .lines()
        .take(lines)
        .map_while(|line| line.ok())
        .map(|line| line.to_lowercase())
        .collect()
}

fn io_context(op: &str, path: &Path, err: std::io::Error) -> Error {
    Error::Io(std::io::Error::new(
        err.kind(),
        format!("{op} failed for {}: {err}", path.display()),
    ))
}
