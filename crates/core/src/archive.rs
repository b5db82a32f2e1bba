use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::progress::{ExtractProgress, ProgressSink};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub index: u64,
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub index: u64,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ExtractReport {
    pub items_extracted: u64,
    pub bytes_extracted: u64,
    pub errors: Vec<ItemError>,
}

impl ExtractReport {
    fn push_error(&mut self, index: u64, path: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(
            event = "archive.item_failed",
            index,
            path,
            error = %message,
            "archive.item_failed"
        );
        self.errors.push(ItemError {
            index,
            path: path.to_string(),
            message,
        });
    }
}

/// Hands out one output stream per extracted item.
pub trait ItemSink {
    fn open_item(&mut self, entry: &ArchiveEntry) -> io::Result<Box<dyn Write + Send>>;
}

pub trait ArchiveDecoder: Send {
    fn format(&self) -> &'static str;

    fn item_count(&self) -> u64;

    /// Extracts the given items into streams obtained from `sink`. Directories
    /// are skipped. Failures of single items land in the report; `Err` means
    /// the archive itself could not be read.
    fn extract(
        &mut self,
        indices: &[u64],
        sink: &mut dyn ItemSink,
        progress: &dyn ProgressSink,
    ) -> Result<ExtractReport>;
}

impl<D: ArchiveDecoder + ?Sized> ArchiveDecoder for Box<D> {
    fn format(&self) -> &'static str {
        (**self).format()
    }

    fn item_count(&self) -> u64 {
        (**self).item_count()
    }

    fn extract(
        &mut self,
        indices: &[u64],
        sink: &mut dyn ItemSink,
        progress: &dyn ProgressSink,
    ) -> Result<ExtractReport> {
        (**self).extract(indices, sink, progress)
    }
}

/// Forward slashes only, and ASCII control characters replaced with `_`.
pub fn normalize_item_path(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '\\' => '/',
            c if (c as u32) < 32 => '_',
            c => c,
        })
        .collect()
}

pub fn open_archive(path: &Path, password: Option<&str>) -> Result<Box<dyn ArchiveDecoder>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let decoder: Box<dyn ArchiveDecoder> = match ext.as_str() {
        "zip" => Box::new(ZipDecoder::open(path, password)?),
        "tar" => {
            if password.is_some() {
                warn!(
                    event = "archive.password_ignored",
                    format = "tar",
                    "archive.password_ignored"
                );
            }
            Box::new(TarDecoder::open(path)?)
        }
        other => {
            return Err(Error::archive(format!(
                "unsupported archive type {other:?}: {}",
                path.display()
            )));
        }
    };

    info!(
        event = "archive.opened",
        path = %path.display(),
        format = decoder.format(),
        items = decoder.item_count(),
        "archive.opened"
    );
    Ok(decoder)
}

fn copy_item(
    reader: &mut dyn Read,
    entry: &ArchiveEntry,
    sink: &mut dyn ItemSink,
) -> io::Result<u64> {
    let mut out = sink.open_item(entry)?;
    let n = io::copy(reader, &mut out)?;
    out.flush()?;
    Ok(n)
}

pub struct ZipDecoder {
    archive: zip::ZipArchive<File>,
    password: Option<String>,
}

impl ZipDecoder {
    pub fn open(path: &Path, password: Option<&str>) -> Result<Self> {
        let file = File::open(path)?;
        let archive = zip::ZipArchive::new(file)
            .map_err(|e| Error::archive(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            archive,
            password: password.map(str::to_string),
        })
    }

    fn selected_bytes(&mut self, indices: &[u64]) -> u64 {
        indices
            .iter()
            .filter_map(|&i| self.archive.by_index_raw(i as usize).ok().map(|f| f.size()))
            .sum()
    }
}

impl ArchiveDecoder for ZipDecoder {
    fn format(&self) -> &'static str {
        "zip"
    }

    fn item_count(&self) -> u64 {
        self.archive.len() as u64
    }

    fn extract(
        &mut self,
        indices: &[u64],
        sink: &mut dyn ItemSink,
        progress: &dyn ProgressSink,
    ) -> Result<ExtractReport> {
        let total_bytes = self.selected_bytes(indices);
        let password = self.password.clone();
        let mut report = ExtractReport::default();

        for &index in indices {
            let opened = match &password {
                Some(pw) => self.archive.by_index_decrypt(index as usize, pw.as_bytes()),
                None => self.archive.by_index(index as usize),
            };
            let mut file = match opened {
                Ok(file) => file,
                Err(e) => {
                    report.push_error(index, "", e.to_string());
                    continue;
                }
            };

            let path = normalize_item_path(file.name());
            if file.is_dir() {
                debug!(event = "archive.skip_dir", index, path = %path, "archive.skip_dir");
                continue;
            }

            let entry = ArchiveEntry {
                index,
                path,
                size: file.size(),
                modified: None,
            };
            info!(
                event = "archive.extract_item",
                index,
                path = %entry.path,
                size = entry.size,
                "==> Extracting {index}: {}",
                entry.path
            );

            match copy_item(&mut file, &entry, sink) {
                Ok(n) => {
                    report.items_extracted += 1;
                    report.bytes_extracted += n;
                }
                Err(e) => report.push_error(index, &entry.path, e.to_string()),
            }
            progress.on_progress(ExtractProgress {
                item_index: Some(index),
                completed_bytes: report.bytes_extracted,
                total_bytes,
            });
        }
        Ok(report)
    }
}

#[derive(Debug, Clone)]
struct TarListing {
    path: String,
    size: u64,
    is_dir: bool,
}

/// Plain (uncompressed) tar. The file is scanned once to list entries and once
/// per `extract` call.
pub struct TarDecoder {
    path: PathBuf,
    entries: Vec<TarListing>,
}

impl TarDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let mut archive = tar::Archive::new(File::open(path)?);
        let mut entries = Vec::new();
        for entry in archive
            .entries()
            .map_err(|e| Error::archive(format!("read {}: {e}", path.display())))?
        {
            let entry =
                entry.map_err(|e| Error::archive(format!("read {}: {e}", path.display())))?;
            entries.push(TarListing {
                path: normalize_item_path(&entry.path()?.to_string_lossy()),
                size: entry.size(),
                is_dir: entry.header().entry_type().is_dir(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }
}

impl ArchiveDecoder for TarDecoder {
    fn format(&self) -> &'static str {
        "tar"
    }

    fn item_count(&self) -> u64 {
        self.entries.len() as u64
    }

    fn extract(
        &mut self,
        indices: &[u64],
        sink: &mut dyn ItemSink,
        progress: &dyn ProgressSink,
    ) -> Result<ExtractReport> {
        let wanted: HashSet<u64> = indices.iter().copied().collect();
        let total_bytes = indices
            .iter()
            .filter_map(|&i| self.entries.get(i as usize))
            .map(|e| e.size)
            .sum();
        let mut report = ExtractReport::default();

        for &index in indices {
            if index >= self.entries.len() as u64 {
                report.push_error(index, "", "index out of range");
            }
        }

        let mut archive = tar::Archive::new(File::open(&self.path)?);
        let entries = archive
            .entries()
            .map_err(|e| Error::archive(format!("read {}: {e}", self.path.display())))?;

        for (index, entry) in (0u64..).zip(entries) {
            if !wanted.contains(&index) {
                continue;
            }
            let Some(listing) = self.entries.get(index as usize) else {
                break;
            };
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.push_error(index, &listing.path, e.to_string());
                    continue;
                }
            };
            if listing.is_dir {
                debug!(event = "archive.skip_dir", index, path = %listing.path, "archive.skip_dir");
                continue;
            }

            let modified = entry
                .header()
                .mtime()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0));
            let entry_meta = ArchiveEntry {
                index,
                path: listing.path.clone(),
                size: listing.size,
                modified,
            };
            info!(
                event = "archive.extract_item",
                index,
                path = %entry_meta.path,
                size = entry_meta.size,
                "==> Extracting {index}: {}",
                entry_meta.path
            );

            match copy_item(&mut entry, &entry_meta, sink) {
                Ok(n) => {
                    report.items_extracted += 1;
                    report.bytes_extracted += n;
                }
                Err(e) => report.push_error(index, &entry_meta.path, e.to_string()),
            }
            progress.on_progress(ExtractProgress {
                item_index: Some(index),
                completed_bytes: report.bytes_extracted,
                total_bytes,
            });
        }
        Ok(report)
    }
}

#[derive(Debug, Clone)]
struct MemoryItem {
    path: String,
    data: Vec<u8>,
    is_dir: bool,
}

/// Archive held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    items: Vec<MemoryItem>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
        self.items.push(MemoryItem {
            path: path.to_string(),
            data,
            is_dir: false,
        });
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.items.push(MemoryItem {
            path: path.to_string(),
            data: Vec::new(),
            is_dir: true,
        });
        self
    }
}

impl ArchiveDecoder for MemoryArchive {
    fn format(&self) -> &'static str {
        "memory"
    }

    fn item_count(&self) -> u64 {
        self.items.len() as u64
    }

    fn extract(
        &mut self,
        indices: &[u64],
        sink: &mut dyn ItemSink,
        progress: &dyn ProgressSink,
    ) -> Result<ExtractReport> {
        let total_bytes = indices
            .iter()
            .filter_map(|&i| self.items.get(i as usize))
            .map(|item| item.data.len() as u64)
            .sum();
        let mut report = ExtractReport::default();

        for &index in indices {
            let Some(item) = self.items.get(index as usize) else {
                report.push_error(index, "", "index out of range");
                continue;
            };
            let path = normalize_item_path(&item.path);
            if item.is_dir {
                debug!(event = "archive.skip_dir", index, path = %path, "archive.skip_dir");
                continue;
            }

            let entry = ArchiveEntry {
                index,
                path,
                size: item.data.len() as u64,
                modified: None,
            };
            match copy_item(&mut item.data.as_slice(), &entry, sink) {
                Ok(n) => {
                    report.items_extracted += 1;
                    report.bytes_extracted += n;
                }
                Err(e) => report.push_error(index, &entry.path, e.to_string()),
            }
            progress.on_progress(ExtractProgress {
                item_index: Some(index),
                completed_bytes: report.bytes_extracted,
                total_bytes,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::progress::NoProgress;

    #[derive(Default)]
    struct CollectSink {
        items: Vec<(ArchiveEntry, Arc<Mutex<Vec<u8>>>)>,
    }

    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ItemSink for CollectSink {
        fn open_item(&mut self, entry: &ArchiveEntry) -> io::Result<Box<dyn Write + Send>> {
            let buf = Arc::new(Mutex::new(Vec::new()));
            self.items.push((entry.clone(), buf.clone()));
            Ok(Box::new(SharedBuf(buf)))
        }
    }

    #[test]
    fn normalizes_separators_and_control_chars() {
        assert_eq!(normalize_item_path("dir\\sub\\a.txt"), "dir/sub/a.txt");
        assert_eq!(normalize_item_path("bad\u{1}name\t.txt"), "bad_name_.txt");
        assert_eq!(normalize_item_path("ünïcode/ok"), "ünïcode/ok");
    }

    #[test]
    fn memory_archive_skips_dirs_and_reports_bad_indices() {
        let mut archive = MemoryArchive::new()
            .with_dir("docs")
            .with_file("docs/a.txt", b"alpha".to_vec())
            .with_file("b.bin", vec![7u8; 10]);
        let mut sink = CollectSink::default();

        let report = archive.extract(&[0, 1, 2, 9], &mut sink, &NoProgress).unwrap();
        assert_eq!(report.items_extracted, 2);
        assert_eq!(report.bytes_extracted, 15);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 9);

        let paths: Vec<_> = sink.items.iter().map(|(e, _)| e.path.clone()).collect();
        assert_eq!(paths, vec!["docs/a.txt", "b.bin"]);
        assert_eq!(*sink.items[0].1.lock().unwrap(), b"alpha");
    }

    #[test]
    fn tar_decoder_extracts_selected_items() {
        let temp = tempfile::tempdir().unwrap();
        let tar_path = temp.path().join("t.tar");
        {
            let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder
                .append_data(&mut header, "one.txt", &b"hello"[..])
                .unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_size(3);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "two.txt", &b"abc"[..]).unwrap();
            builder.finish().unwrap();
        }

        let mut decoder = TarDecoder::open(&tar_path).unwrap();
        assert_eq!(decoder.item_count(), 2);

        let mut sink = CollectSink::default();
        let report = decoder.extract(&[1], &mut sink, &NoProgress).unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(sink.items.len(), 1);
        assert_eq!(sink.items[0].0.path, "two.txt");
        assert_eq!(*sink.items[0].1.lock().unwrap(), b"abc");

        let mut sink = CollectSink::default();
        decoder.extract(&[0], &mut sink, &NoProgress).unwrap();
        assert_eq!(
            sink.items[0].0.modified,
            DateTime::from_timestamp(1_700_000_000, 0)
        );
    }

    #[test]
    fn zip_decoder_extracts_files_and_skips_dirs() {
        use zip::write::SimpleFileOptions;

        let temp = tempfile::tempdir().unwrap();
        let zip_path = temp.path().join("z.zip");
        {
            let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
            writer
                .add_directory("nested/", SimpleFileOptions::default())
                .unwrap();
            writer
                .start_file("nested/data.bin", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(&[9u8; 4096]).unwrap();
            writer.finish().unwrap();
        }

        let mut decoder = open_archive(&zip_path, None).unwrap();
        assert_eq!(decoder.format(), "zip");
        assert_eq!(decoder.item_count(), 2);

        let mut sink = CollectSink::default();
        let report = decoder.extract(&[0, 1], &mut sink, &NoProgress).unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(sink.items.len(), 1);
        assert_eq!(sink.items[0].0.path, "nested/data.bin");
        assert_eq!(sink.items[0].0.size, 4096);
        assert_eq!(sink.items[0].1.lock().unwrap().len(), 4096);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.rar");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            open_archive(&path, None),
            Err(Error::Archive { .. })
        ));
    }
}
