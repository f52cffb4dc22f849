use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::debug;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync the temp file and the parent directory.
    Durable,
    /// rename only. Used for short-lived mutant content.
    Fast,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub durability: DurabilityMode,
    pub buffer_size: usize,
    pub preserve_permissions: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Durable,
            buffer_size: 64 * 1024,
            preserve_permissions: true,
        }
    }
}

impl WriteOptions {
    pub fn durable() -> Self {
        Self::default()
    }

    pub fn fast() -> Self {
        Self {
            durability: DurabilityMode::Fast,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteStats {
    pub bytes_written: u64,
    pub fsync_count: u32,
    pub elapsed: Duration,
}

/// Temp file in the target's directory, then rename over the target.
/// Readers see either the old or the new content, never a partial write.
pub struct AtomicWriter {
    options: WriteOptions,
}

impl AtomicWriter {
    pub fn new(options: WriteOptions) -> Self {
        Self { options }
    }

    pub fn write_str(&self, path: &Path, content: &str) -> Result<WriteStats> {
        self.write_bytes(path, content.as_bytes())
    }

    pub fn write_bytes(&self, path: &Path, content: &[u8]) -> Result<WriteStats> {
        let start = Instant::now();
        // "a.js".parent() is "", which File::open rejects
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let existing_meta = match fs::metadata(path) {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to stat {}", path.display()));
            }
        };

        let mut fsync_count = 0u32;
        let mut temp_file = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;

        {
            let mut writer =
                BufWriter::with_capacity(self.options.buffer_size.max(1), temp_file.as_file_mut());
            writer
                .write_all(content)
                .with_context(|| format!("Failed to write {} bytes to temp file", content.len()))?;
            writer.flush().context("Failed to flush temp file")?;
        }

        if self.options.preserve_permissions {
            if let Some(meta) = &existing_meta {
                fs::set_permissions(temp_file.path(), meta.permissions()).with_context(|| {
                    format!("Failed to preserve permissions of {}", path.display())
                })?;
            }
        }

        if self.options.durability == DurabilityMode::Durable {
            temp_file
                .as_file()
                .sync_data()
                .with_context(|| format!("Failed to sync temp data for {}", path.display()))?;
            fsync_count += 1;
        }

        temp_file.persist(path).map_err(|e| {
            anyhow::Error::new(e.error)
                .context(format!("Failed to atomically replace {}", path.display()))
        })?;

        if self.options.durability == DurabilityMode::Durable {
            fsync_parent_dir(parent)?;
            fsync_count += 1;
        }

        let stats = WriteStats {
            bytes_written: content.len() as u64,
            fsync_count,
            elapsed: start.elapsed(),
        };
        debug!(
            file = %path.display(),
            bytes = stats.bytes_written,
            fsyncs = stats.fsync_count,
            elapsed_us = stats.elapsed.as_micros() as u64,
            "atomic write"
        );
        Ok(stats)
    }
}

pub fn hash_bytes(content: &[u8]) -> u64 {
    xxh3_64(content)
}

/// Streaming xxh3 of a file's current content.
pub fn hash_file(path: &Path) -> Result<u64> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest())
}

#[cfg(unix)]
fn fsync_parent_dir(parent: &Path) -> Result<()> {
    let dir = File::open(parent)
        .with_context(|| format!("Failed to open parent dir {}", parent.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync parent dir {}", parent.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_parent: &Path) -> Result<()> {
    Ok(())
}
