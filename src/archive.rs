use crate::error::ArchiveError;
use crate::prelude::*;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Builder, Header};
use tracing::{debug, info, warn};

pub const ARCHIVE_EXTENSION: &str = "tgz";
/// Fixed-width UTC timestamp, so lexicographic order is chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const DEFAULT_BASENAME: &str = "backup";

/// A finished archive waiting in the scratch directory for upload.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub name: String,
    pub path: PathBuf,
    pub source_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    /// Files that vanished, could not be read, or shrank while the archive was built.
    pub skipped: Vec<PathBuf>,
}

pub fn archive_name(source: &Path, at: DateTime<Utc>) -> String {
    let base = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_BASENAME.to_string());

    format!(
        "{}_{}.{}",
        base,
        at.format(TIMESTAMP_FORMAT),
        ARCHIVE_EXTENSION
    )
}

/// Rejects traversal components, missing paths and non-directories, and
/// returns the canonical source path.
pub fn validate_source(source: &Path) -> Result<PathBuf> {
    if source
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(Error::InvalidSource(format!(
            "{:?}: path traversal patterns not allowed",
            source
        )));
    }

    let metadata = match fs::metadata(source) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::not_found("Backup source directory", source))
        }
        Err(e) => return Err(Error::IO(e)),
    };
    if !metadata.is_dir() {
        return Err(Error::InvalidSource(format!("{:?} is not a directory", source)));
    }

    Ok(fs::canonicalize(source)?)
}

/// Total size of the regular files under `path`. Unreadable entries count as zero.
pub fn directory_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };

    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => directory_size(&entry.path()),
            Ok(file_type) if file_type.is_file() => {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
            _ => 0,
        })
        .sum()
}

pub struct Archiver {
    output_dir: PathBuf,
    compression: Compression,
}

impl Archiver {
    pub fn new(output_dir: impl Into<PathBuf>, compression_level: u32) -> Self {
        Self {
            output_dir: output_dir.into(),
            compression: Compression::new(compression_level.min(9)),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn create(&self, source: &Path) -> Result<BackupArtifact> {
        self.create_at(source, Utc::now())
    }

    /// Archives `source` as if captured at `at`.
    ///
    /// The archive is written under a hidden temporary name in the output
    /// directory and renamed into place only once complete. Any failure
    /// drops the temporary file.
    pub fn create_at(&self, source: &Path, at: DateTime<Utc>) -> Result<BackupArtifact> {
        let source = validate_source(source)?;
        let name = archive_name(&source, at);
        let final_path = self.output_dir.join(&name);

        info!(
            "Creating backup for directory: {:?} ({} bytes)",
            source,
            directory_size(&source)
        );

        let temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".partial")
            .tempfile_in(&self.output_dir)
            .map_err(|e| ArchiveError::TempFile {
                dir: self.output_dir.clone(),
                source: e,
            })?;

        // The scratch directory may sit inside the source; never archive it
        // (or the archive being written) into itself.
        let excluded: Vec<PathBuf> = [temp.path(), self.output_dir.as_path()]
            .into_iter()
            .filter_map(|path| fs::canonicalize(path).ok())
            .filter(|path| path != &source)
            .collect();

        let mut builder = Builder::new(GzEncoder::new(temp, self.compression));
        builder.follow_symlinks(false);

        let mut skipped = Vec::new();
        append_tree(&mut builder, &source, Path::new(""), &excluded, &mut skipped)?;

        let finalize = |e: io::Error| ArchiveError::Finalize {
            path: final_path.clone(),
            source: e,
        };
        let temp = builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(finalize)?;
        temp.as_file().sync_all().map_err(finalize)?;
        let file = temp.persist(&final_path).map_err(|e| finalize(e.error))?;
        let size = file.metadata().map_err(finalize)?.len();

        if !skipped.is_empty() {
            warn!("Backup completed with {} skipped files", skipped.len());
        }
        info!("Backup created: {:?} ({} bytes)", final_path, size);

        Ok(BackupArtifact {
            name,
            path: final_path,
            source_path: source,
            created_at: at,
            size,
            skipped,
        })
    }
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    relative: &Path,
    excluded: &[PathBuf],
    skipped: &mut Vec<PathBuf>,
) -> std::result::Result<(), ArchiveError> {
    let dir = root.join(relative);
    let read_dir = match fs::read_dir(&dir) {
        Ok(read_dir) => read_dir,
        Err(e) if relative.as_os_str().is_empty() => {
            return Err(ArchiveError::Walk { path: dir, source: e })
        }
        Err(e) => {
            warn!("Cannot read directory {:?}: {}", dir, e);
            skipped.push(dir);
            return Ok(());
        }
    };

    let mut entries: Vec<_> = read_dir.filter_map(|entry| entry.ok()).collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = relative.join(entry.file_name());
        if excluded.contains(&path) {
            debug!("Skipping backup output: {:?}", path);
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                warn!("Cannot stat {:?}: {}", path, e);
                skipped.push(path);
                continue;
            }
        };

        if file_type.is_symlink() {
            debug!("Skipping symlink: {:?}", path);
        } else if file_type.is_dir() {
            builder
                .append_dir(&name, &path)
                .map_err(|e| ArchiveError::Write {
                    path: path.clone(),
                    source: e,
                })?;
            append_tree(builder, root, &name, excluded, skipped)?;
        } else if file_type.is_file() {
            append_file(builder, &path, &name, skipped)?;
        } else {
            debug!("Skipping special file: {:?}", path);
        }
    }

    Ok(())
}

fn append_file<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &Path,
    skipped: &mut Vec<PathBuf>,
) -> std::result::Result<(), ArchiveError> {
    // A file may disappear or lose permissions between listing and opening.
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            match e.kind() {
                io::ErrorKind::NotFound => warn!("File disappeared during backup: {:?}", path),
                io::ErrorKind::PermissionDenied => warn!("Permission denied for file: {:?}", path),
                _ => warn!("Cannot read file {:?}: {}", path, e),
            }
            skipped.push(path.to_path_buf());
            return Ok(());
        }
    };

    let write_error = |e: io::Error| ArchiveError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    // The header records the size at open time; exactly that many bytes follow it.
    let metadata = file.metadata().map_err(write_error)?;
    let len = metadata.len();
    let mut header = Header::new_gnu();
    header.set_metadata(&metadata);

    builder
        .append_data(&mut header, name, exact_len((&mut file).take(len), len))
        .map_err(write_error)?;

    let read = file.stream_position().map_err(write_error)?;
    if read < len {
        warn!(
            "File shrank during backup: {:?} ({} of {} bytes, rest zero-filled)",
            path, read, len
        );
        skipped.push(path.to_path_buf());
    } else if fs::metadata(path).is_ok_and(|now| now.len() > len) {
        warn!("File grew during backup, archived first {} bytes: {:?}", len, path);
    }
    Ok(())
}

/// Yields exactly `len` bytes: `reader` truncated, or zero-filled when it ends early.
fn exact_len<R: Read>(reader: R, len: u64) -> impl Read {
    reader.chain(io::repeat(0)).take(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn source_tree() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), "y").unwrap();
        fs::write(dir.path().join("sub/deeper/c.bin"), [0u8, 1, 2, 255]).unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        dir
    }

    fn extract(path: &Path) -> (BTreeMap<String, Vec<u8>>, Vec<String>) {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        let mut files = BTreeMap::new();
        let mut dirs = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if entry.header().entry_type().is_dir() {
                dirs.push(name.trim_end_matches('/').to_string());
            } else {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                files.insert(name, data);
            }
        }
        (files, dirs)
    }

    #[test]
    fn test_archive_name_embeds_utc_timestamp() {
        let when = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            archive_name(Path::new("/srv/data"), when),
            "data_20240102030405.tgz"
        );
    }

    #[test]
    fn test_archive_name_for_root_uses_default_basename() {
        assert_eq!(archive_name(Path::new("/"), at(0)), "backup_19700101000000.tgz");
    }

    #[test]
    fn test_archive_names_sort_chronologically() {
        let captures = [
            0,
            1,
            59,
            60,
            3_599,
            86_399,
            86_400,
            1_000_000_000,
            1_700_000_000,
            4_102_444_800,
        ];
        let names: Vec<_> = captures
            .iter()
            .map(|&secs| archive_name(Path::new("/data"), at(secs)))
            .collect();

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_round_trip_preserves_paths_and_bytes() {
        let source = source_tree();
        let output = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(output.path(), 9);

        let artifact = archiver.create_at(source.path(), at(1_700_000_000)).unwrap();

        assert!(artifact.path.starts_with(output.path()));
        assert!(artifact.skipped.is_empty());
        assert_eq!(artifact.size, fs::metadata(&artifact.path).unwrap().len());

        let (files, dirs) = extract(&artifact.path);
        let expected: BTreeMap<String, Vec<u8>> = [
            ("a.txt", b"x".to_vec()),
            ("sub/b.txt", b"y".to_vec()),
            ("sub/deeper/c.bin", vec![0, 1, 2, 255]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        assert_eq!(files, expected);
        assert!(dirs.contains(&"empty".to_string()));
    }

    #[test]
    fn test_only_the_finished_archive_remains_in_output_dir() {
        let source = source_tree();
        let output = tempfile::tempdir().unwrap();

        let artifact = Archiver::new(output.path(), 1)
            .create_at(source.path(), at(42))
            .unwrap();

        let names: Vec<_> = fs::read_dir(output.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![artifact.name]);
    }

    #[test]
    fn test_output_dir_inside_source_is_not_archived() {
        let source = source_tree();
        for i in 0..40 {
            fs::write(source.path().join(format!("blob_{i:02}.bin")), vec![i as u8; 200_000])
                .unwrap();
        }

        let artifact = Archiver::new(source.path(), 1)
            .create_at(source.path(), at(7))
            .unwrap();

        let (files, _) = extract(&artifact.path);
        assert_eq!(files.len(), 3 + 40);
        assert!(files.keys().all(|name| !name.ends_with(".partial")));
        assert_eq!(files["blob_39.bin"], vec![39u8; 200_000]);
    }

    #[test]
    fn test_nested_scratch_dir_is_left_out() {
        let source = source_tree();
        let scratch = source.path().join("scratch");
        fs::create_dir(&scratch).unwrap();
        fs::write(scratch.join("older_backup.tgz"), "stale").unwrap();

        let artifact = Archiver::new(&scratch, 9).create(source.path()).unwrap();

        let (files, dirs) = extract(&artifact.path);
        assert!(files.keys().all(|name| !name.starts_with("scratch")));
        assert!(!dirs.contains(&"scratch".to_string()));
        assert!(files.contains_key("sub/b.txt"));
    }

    #[test]
    fn test_exact_len_truncates_and_zero_fills() {
        let mut grown = Vec::new();
        exact_len(&b"abcdef"[..], 4).read_to_end(&mut grown).unwrap();
        assert_eq!(grown, b"abcd");

        let mut shrunk = Vec::new();
        exact_len(&b"ab"[..], 4).read_to_end(&mut shrunk).unwrap();
        assert_eq!(shrunk, vec![b'a', b'b', 0, 0]);
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let output = tempfile::tempdir().unwrap();
        let missing = output.path().join("does-not-exist");

        let err = Archiver::new(output.path(), 9).create(&missing).unwrap_err();

        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_file_source_is_rejected() {
        let output = tempfile::tempdir().unwrap();
        let file = output.path().join("plain.txt");
        fs::write(&file, "not a directory").unwrap();

        let err = Archiver::new(output.path(), 9).create(&file).unwrap_err();

        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn test_parent_dir_components_are_rejected() {
        let err = validate_source(Path::new("/data/../etc")).unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn test_unwritable_output_leaves_nothing_behind() {
        let source = source_tree();
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("missing-scratch");

        let err = Archiver::new(&output, 9).create(source.path()).unwrap_err();

        assert!(matches!(err, Error::Archive(ArchiveError::TempFile { .. })));
        assert!(!output.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let source = source_tree();
        std::os::unix::fs::symlink(source.path().join("a.txt"), source.path().join("link.txt"))
            .unwrap();
        let output = tempfile::tempdir().unwrap();

        let artifact = Archiver::new(output.path(), 9).create(source.path()).unwrap();

        let (files, _) = extract(&artifact.path);
        assert!(!files.contains_key("link.txt"));
        assert!(files.contains_key("a.txt"));
    }

    #[test]
    fn test_directory_size_counts_nested_files() {
        let source = source_tree();
        assert_eq!(directory_size(source.path()), 1 + 1 + 4);
    }
}
