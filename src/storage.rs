//! # Recording Storage Module
//!
//! Persists raw frames while a session streams and turns them into a finished,
//! compressed recording once it stops.
//!
//! ## Architecture
//! - **DataSink**: what the acquisition service needs from storage
//! - **DataManager**: file-backed sink
//!
//! ## Files
//! ```text
//! <output_dir>/
//! ├── <name>.tmp        body written while streaming (removed when stored)
//! └── <name>.txt.zst    final recording, zstd compressed
//! ```
//!
//! ## Recording Format
//! ```text
//! # {"name": ..., "device": ..., "channels": [...], "sampling_frequency": ..., ...}
//! # EndOfHeader
//! 0	512	498
//! 1	515	501
//! ...
//! ```
//! One line per frame: a frame index followed by one tab-separated sample per
//! active channel.

use crate::config::DeviceConfiguration;
use crate::error::StorageError;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const ZSTD_LEVEL: i32 = 3;
const END_OF_HEADER: &str = "# EndOfHeader";

/// Durable destination for one session's frames.
///
/// `append_frame` runs on the device delivery thread, `finalize_and_store` on
/// a dedicated worker after `close_writers`.
pub trait DataSink: Send + Sync {
    fn append_frame(&self, samples: &[i32]) -> Result<(), StorageError>;

    fn set_duration(&self, duration: String);

    fn close_writers(&self) -> Result<(), StorageError>;

    fn finalize_and_store(&self) -> Result<PathBuf, StorageError>;

    /// Drop everything written so far. Used when the session is abandoned.
    fn discard(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Serialize)]
struct RecordingHeader<'a> {
    name: &'a str,
    device: &'a str,
    mac_address: &'a str,
    channels: &'a [u8],
    sampling_frequency: u32,
    resolution_bits: u8,
    date: String,
    duration: Option<&'a str>,
    frames: u64,
}

/// File-backed `DataSink`
pub struct DataManager {
    recording_name: String,
    configuration: DeviceConfiguration,
    body_path: PathBuf,
    recording_path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    duration: Mutex<Option<String>>,
    frames_written: AtomicU64,
    started: chrono::DateTime<chrono::Local>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DataManager {
    /// Create the output directory if needed and open the body file
    pub fn create(
        output_dir: impl AsRef<Path>,
        recording_name: &str,
        configuration: &DeviceConfiguration,
    ) -> Result<Self, StorageError> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir).map_err(|source| StorageError::Create {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let file_stem = sanitize_file_name(recording_name);
        let body_path = output_dir.join(format!("{}.tmp", file_stem));
        let recording_path = output_dir.join(format!("{}.txt.zst", file_stem));

        let file = File::create(&body_path).map_err(|source| StorageError::Create {
            path: body_path.clone(),
            source,
        })?;

        log::info!("Recording frames to: {}", body_path.display());

        Ok(Self {
            recording_name: recording_name.to_string(),
            configuration: configuration.clone(),
            body_path,
            recording_path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            duration: Mutex::new(None),
            frames_written: AtomicU64::new(0),
            started: chrono::Local::now(),
        })
    }

    pub fn recording_path(&self) -> &Path {
        &self.recording_path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    fn header_line(&self) -> Result<String, StorageError> {
        let duration = lock(&self.duration).clone();
        let header = RecordingHeader {
            name: &self.recording_name,
            device: &self.configuration.name,
            mac_address: &self.configuration.mac_address,
            channels: &self.configuration.active_channels,
            sampling_frequency: self.configuration.sampling_frequency,
            resolution_bits: self.configuration.number_of_bits,
            date: self.started.format("%Y-%m-%d %H:%M:%S").to_string(),
            duration: duration.as_deref(),
            frames: self.frames_written(),
        };
        let json = serde_json::to_string(&header).map_err(|e| StorageError::Finalize {
            path: self.recording_path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        Ok(format!("# {}\n{}\n", json, END_OF_HEADER))
    }

    fn compress_into_recording(&self, header: &str) -> Result<(), StorageError> {
        let finalize_err = |source| StorageError::Finalize {
            path: self.recording_path.clone(),
            source,
        };

        let body = File::open(&self.body_path).map_err(finalize_err)?;
        let output = File::create(&self.recording_path).map_err(finalize_err)?;

        let mut encoder =
            zstd::Encoder::new(BufWriter::new(output), ZSTD_LEVEL).map_err(StorageError::Compress)?;
        encoder.write_all(header.as_bytes()).map_err(StorageError::Compress)?;
        io::copy(&mut BufReader::new(body), &mut encoder).map_err(StorageError::Compress)?;
        let mut output = encoder.finish().map_err(StorageError::Compress)?;
        output.flush().map_err(StorageError::Compress)?;
        Ok(())
    }
}

impl DataSink for DataManager {
    fn append_frame(&self, samples: &[i32]) -> Result<(), StorageError> {
        let mut writer = lock(&self.writer);
        let writer = writer.as_mut().ok_or(StorageError::WritersClosed)?;

        let index = self.frames_written.load(Ordering::Relaxed);
        write!(writer, "{}", index).map_err(StorageError::Write)?;
        for value in samples {
            write!(writer, "\t{}", value).map_err(StorageError::Write)?;
        }
        writeln!(writer).map_err(StorageError::Write)?;

        self.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_duration(&self, duration: String) {
        log::debug!("Recording duration set to {}", duration);
        *lock(&self.duration) = Some(duration);
    }

    fn close_writers(&self) -> Result<(), StorageError> {
        match lock(&self.writer).take() {
            Some(mut writer) => {
                writer.flush().map_err(StorageError::Close)?;
                writer.get_ref().sync_all().map_err(StorageError::Close)?;
                log::debug!("Closed writers after {} frames", self.frames_written());
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn finalize_and_store(&self) -> Result<PathBuf, StorageError> {
        // Make sure nothing is left buffered if close_writers was skipped
        self.close_writers()?;

        let header = self.header_line()?;
        if let Err(e) = self.compress_into_recording(&header) {
            let _ = fs::remove_file(&self.recording_path);
            return Err(e);
        }

        if let Err(e) = fs::remove_file(&self.body_path) {
            log::warn!("Could not remove {}: {}", self.body_path.display(), e);
        }

        log::info!(
            "Stored recording {} ({} frames) at {}",
            self.recording_name,
            self.frames_written(),
            self.recording_path.display()
        );
        Ok(self.recording_path.clone())
    }

    fn discard(&self) -> Result<(), StorageError> {
        lock(&self.writer).take();

        match fs::remove_file(&self.body_path) {
            Ok(()) => {
                log::info!(
                    "Discarded recording {} after {} frames",
                    self.recording_name,
                    self.frames_written()
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Discard {
                path: self.body_path.clone(),
                source,
            }),
        }
    }
}

/// Replace characters that are not safe in file names
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        format!("recording_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"))
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_configuration;
    use std::io::Read;
    use tempfile::tempdir;

    fn read_recording(path: &Path) -> String {
        let mut decoder = zstd::Decoder::new(File::open(path).unwrap()).unwrap();
        let mut contents = String::new();
        decoder.read_to_string(&mut contents).unwrap();
        contents
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("ecg run/1"), "ecg_run_1");
        assert_eq!(sanitize_file_name("session-2_a"), "session-2_a");
        assert!(sanitize_file_name("  ").starts_with("recording_"));
    }

    #[test]
    fn test_append_close_and_store() {
        let dir = tempdir().unwrap();
        let config = test_configuration(1000, 100, 12);
        let manager = DataManager::create(dir.path(), "morning ecg", &config).unwrap();

        manager.append_frame(&[512, 498]).unwrap();
        manager.append_frame(&[515, 501]).unwrap();
        manager.set_duration("00:05:00".to_string());
        manager.close_writers().unwrap();
        assert!(matches!(manager.append_frame(&[1, 2]), Err(StorageError::WritersClosed)));

        let path = manager.finalize_and_store().unwrap();
        assert_eq!(path, dir.path().join("morning_ecg.txt.zst"));
        assert!(!dir.path().join("morning_ecg.tmp").exists());

        let contents = read_recording(&path);
        let mut lines = contents.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("# {"));
        let json: serde_json::Value = serde_json::from_str(&header[2..]).unwrap();
        assert_eq!(json["name"], "morning ecg");
        assert_eq!(json["sampling_frequency"], 1000);
        assert_eq!(json["duration"], "00:05:00");
        assert_eq!(json["frames"], 2);
        assert_eq!(lines.next().unwrap(), END_OF_HEADER);
        assert_eq!(lines.next().unwrap(), "0\t512\t498");
        assert_eq!(lines.next().unwrap(), "1\t515\t501");
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_finalize_without_close_flushes() {
        let dir = tempdir().unwrap();
        let config = test_configuration(100, 10, 16);
        let manager = DataManager::create(dir.path(), "quick", &config).unwrap();
        for i in 0..100 {
            manager.append_frame(&[i, -i]).unwrap();
        }

        let path = manager.finalize_and_store().unwrap();
        let contents = read_recording(&path);
        assert_eq!(contents.lines().count(), 102);
        assert!(contents.ends_with("99\t99\t-99\n"));
    }

    #[test]
    fn test_finalize_fails_when_body_is_gone() {
        let dir = tempdir().unwrap();
        let config = test_configuration(100, 10, 16);
        let manager = DataManager::create(dir.path(), "lost", &config).unwrap();
        manager.append_frame(&[1, 2]).unwrap();
        manager.close_writers().unwrap();
        fs::remove_file(dir.path().join("lost.tmp")).unwrap();

        assert!(matches!(
            manager.finalize_and_store(),
            Err(StorageError::Finalize { .. })
        ));
        assert!(!manager.recording_path().exists());
    }

    #[test]
    fn test_discard_removes_partial_recording() {
        let dir = tempdir().unwrap();
        let config = test_configuration(1000, 100, 12);
        let manager = DataManager::create(dir.path(), "aborted", &config).unwrap();
        manager.append_frame(&[1, 2]).unwrap();

        manager.discard().unwrap();
        assert!(!dir.path().join("aborted.tmp").exists());
        assert!(!manager.recording_path().exists());
        assert!(matches!(manager.append_frame(&[3, 4]), Err(StorageError::WritersClosed)));

        // Nothing left to remove
        manager.discard().unwrap();
    }

    #[test]
    fn test_create_fails_on_unwritable_dir() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();
        let config = test_configuration(100, 10, 16);

        assert!(matches!(
            DataManager::create(&blocker, "x", &config),
            Err(StorageError::Create { .. })
        ));
    }
}
