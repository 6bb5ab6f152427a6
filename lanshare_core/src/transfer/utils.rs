use crate::config::{AppConfig, default_download_dir};
use crate::transfer::constants::MAX_FILENAME_LENGTH;
use crate::transfer::record::{format_eta, format_speed};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::time::Instant;

const UNKNOWN_FILE: &str = "unknown_file";

/// Give up on collision suffixes after this many attempts
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Reduce a peer-supplied file name to a safe base name
pub fn sanitize_file_name(file_name: &str) -> String {
    // Keep only the last component, whatever the separator
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or_default();

    let mut clean: String = base.chars().filter(|c| !c.is_control()).collect();

    // Windows device names
    let reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved.iter().any(|r| clean.eq_ignore_ascii_case(r))
        || clean == ".."
        || clean == "."
        || clean.trim().is_empty()
    {
        return UNKNOWN_FILE.to_string();
    }

    if clean.len() > MAX_FILENAME_LENGTH {
        clean = truncate_keeping_extension(&clean, MAX_FILENAME_LENGTH);
    }
    clean
}

fn truncate_keeping_extension(name: &str, max: usize) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if name.len() - idx < 20 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let mut cutoff = max - ext.len();
    while !stem.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    format!("{}{}", &stem[..cutoff], ext)
}

/// "a.txt" -> "a (n).txt"; names without an extension just get the suffix
pub fn numbered_name(file_name: &str, n: u32) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    }
}

/// Configured save directory, created on demand; the default download
/// directory when the configured one cannot be created
pub async fn resolve_save_dir(config: &AppConfig) -> PathBuf {
    match fs::create_dir_all(&config.save_dir).await {
        Ok(()) => config.save_dir.clone(),
        Err(e) => {
            let fallback = default_download_dir();
            tracing::warn!(
                "Cannot use save dir {:?} ({}), falling back to {:?}",
                config.save_dir,
                e,
                fallback
            );
            if let Err(e) = fs::create_dir_all(&fallback).await {
                tracing::warn!("Cannot create {:?}: {}", fallback, e);
            }
            fallback
        }
    }
}

/// Exclusively create `file_name` in `dir`, adding " (n)" until a free name
/// is found. Creation itself is the reservation, so concurrent transfers
/// never share a destination.
pub async fn create_unique_file(dir: &Path, file_name: &str) -> io::Result<(File, PathBuf)> {
    let mut candidate = dir.join(file_name);
    for n in 1..=MAX_NAME_ATTEMPTS {
        match open_exclusive(&candidate).await {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                candidate = dir.join(numbered_name(file_name, n));
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {:?}", file_name, dir),
    ))
}

async fn open_exclusive(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o644);
    options.open(path).await
}

/// Throughput sampler behind the speed/ETA strings
#[derive(Debug)]
pub struct SpeedMeter {
    last_tick: Instant,
    bytes_at_tick: u64,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
            bytes_at_tick: 0,
        }
    }

    /// Returns (speed, eta) once `interval` has passed since the last sample
    pub fn sample(
        &mut self,
        bytes_done: u64,
        total: u64,
        interval: std::time::Duration,
    ) -> Option<(String, String)> {
        let elapsed = self.last_tick.elapsed();
        if elapsed < interval {
            return None;
        }
        let moved = bytes_done.saturating_sub(self.bytes_at_tick);
        let bytes_per_sec = moved as f64 / elapsed.as_secs_f64();
        let remaining = total.saturating_sub(bytes_done) as f64;
        let eta = if bytes_per_sec > 0.0 {
            remaining / bytes_per_sec
        } else {
            f64::INFINITY
        };

        self.last_tick = Instant::now();
        self.bytes_at_tick = bytes_done;
        Some((format_speed(bytes_per_sec), format_eta(eta)))
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sanitize_file_name_basic() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(sanitize_file_name("path/to/file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("/absolute/path/to/file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_windows_path() {
        assert_eq!(sanitize_file_name("path\\to\\file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("C:\\Windows\\System32\\calc.exe"), "calc.exe");
    }

    #[test]
    fn test_sanitize_file_name_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\Windows\\System32\\cmd.exe"), "cmd.exe");
        assert_eq!(sanitize_file_name("folder\\../file.txt"), "file.txt");
    }

    #[test]
    fn test_sanitize_file_name_dangerous() {
        assert_eq!(sanitize_file_name(".."), "unknown_file");
        assert_eq!(sanitize_file_name("."), "unknown_file");
        assert_eq!(sanitize_file_name(""), "unknown_file");
        assert_eq!(sanitize_file_name("/"), "unknown_file");
        assert_eq!(sanitize_file_name("bad\nname.txt"), "badname.txt");
    }

    #[test]
    fn test_sanitize_file_name_reserved() {
        assert_eq!(sanitize_file_name("con"), "unknown_file");
        assert_eq!(sanitize_file_name("COM1"), "unknown_file");
        assert_eq!(sanitize_file_name("concert.txt"), "concert.txt");
    }

    #[test]
    fn test_sanitize_file_name_unicode_truncate() {
        let long_unicode = "🦀".repeat(100) + ".txt";
        let sanitized = sanitize_file_name(&long_unicode);
        assert!(sanitized.len() <= MAX_FILENAME_LENGTH);
        assert!(sanitized.ends_with("🦀.txt"));

        let long_plain = "a".repeat(300);
        assert_eq!(sanitize_file_name(&long_plain).len(), MAX_FILENAME_LENGTH);
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("a.txt", 1), "a (1).txt");
        assert_eq!(numbered_name("archive.tar.gz", 2), "archive.tar (2).gz");
        assert_eq!(numbered_name("README", 3), "README (3)");
    }

    #[tokio::test]
    async fn test_collisions_get_numbered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"first").unwrap();

        let (_f1, p1) = create_unique_file(dir.path(), "a.txt").await.unwrap();
        let (_f2, p2) = create_unique_file(dir.path(), "a.txt").await.unwrap();
        assert_eq!(p1.file_name().unwrap(), "a (1).txt");
        assert_eq!(p2.file_name().unwrap(), "a (2).txt");
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_concurrent_creates_never_share_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let dir = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                create_unique_file(&dir, "same.bin").await.unwrap().1
            }));
        }
        let mut paths = Vec::new();
        for h in handles {
            paths.push(h.await.unwrap());
        }
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 8);
    }

    #[tokio::test]
    async fn test_resolve_save_dir_creates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("incoming");
        let config = AppConfig {
            save_dir: target.clone(),
            ..AppConfig::default()
        };
        assert_eq!(resolve_save_dir(&config).await, target);
        assert!(target.is_dir());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_meter_samples_after_interval() {
        let mut meter = SpeedMeter::new();
        assert!(meter.sample(100, 1000, Duration::from_millis(700)).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let (speed, eta) = meter
            .sample(512 * 1024, 1024 * 1024, Duration::from_millis(700))
            .unwrap();
        assert_eq!(speed, "512 KB/s");
        assert_eq!(eta, "00:01");
    }
}
