//! Archive unpacking.
//!
//! The format is picked from the file name:
//! - `.tar`, `.tar.gz`/`.tgz`, `.tar.bz2`/`.tbz2`, `.tar.xz`/`.txz`: unpacked with
//!   the first path component stripped
//! - `.zip`: unpacked to a scratch dir, then a single wrapper directory is
//!   flattened away (see [`unpack_zip`])
//! - `.exe`: copied into the target as-is
//!
//! Entries that would escape the target directory are rejected.

use crate::error::{KilnError, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::debug;
use walkdir::WalkDir;
use xz2::read::XzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
    Executable,
}

impl ArchiveFormat {
    /// Detect the format from a file name, case-insensitively.
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        let format = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Self::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Self::TarXz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".zip") {
            Self::Zip
        } else if name.ends_with(".exe") {
            Self::Executable
        } else {
            return Err(KilnError::UnknownArchive(path.to_path_buf()));
        };
        Ok(format)
    }
}

/// Unpack `archive` into `target`, creating it if needed.
pub fn unpack(archive: &Path, target: &Path) -> Result<()> {
    let format = ArchiveFormat::detect(archive)?;
    debug!(
        "Extracting {} ({:?}) to {}",
        archive.display(),
        format,
        target.display()
    );
    fs::create_dir_all(target)?;

    match format {
        ArchiveFormat::Tar => unpack_tar(open(archive)?, archive, target, 1),
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(open(archive)?), archive, target, 1),
        ArchiveFormat::TarBz2 => unpack_tar(BzDecoder::new(open(archive)?), archive, target, 1),
        ArchiveFormat::TarXz => unpack_tar(XzDecoder::new(open(archive)?), archive, target, 1),
        ArchiveFormat::Zip => unpack_zip(archive, target),
        ArchiveFormat::Executable => {
            let name = archive
                .file_name()
                .ok_or_else(|| KilnError::UnknownArchive(archive.to_path_buf()))?;
            fs::copy(archive, target.join(name))?;
            Ok(())
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

/// Map an archive path to its place under `target`, dropping the first
/// `strip` components. `None` for entries that vanish after stripping.
fn stripped_target(target: &Path, path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let mut out = target.to_path_buf();
    let mut pushed = false;
    for comp in path.components().skip(strip) {
        match comp {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            _ => {
                return Err(KilnError::Extract(format!(
                    "unsafe path component in archive entry {}",
                    path.display()
                )));
            }
        }
    }
    Ok(pushed.then_some(out))
}

fn unpack_tar<R: Read>(reader: R, archive_path: &Path, target: &Path, strip: usize) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let tar_error = |e: std::io::Error| {
        KilnError::Extract(format!("failed to read {}: {}", archive_path.display(), e))
    };

    let mut dirs = Vec::new();
    for entry in archive.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;
        let path = entry.path().map_err(tar_error)?.into_owned();
        let Some(dest) = stripped_target(target, &path, strip)? else {
            continue;
        };
        if entry.header().entry_type() == EntryType::Directory {
            fs::create_dir_all(&dest)?;
            dirs.push((dest, entry.header().mode().map_err(tar_error)?));
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if entry.header().entry_type() == EntryType::Link {
            // Hard link targets are archive paths and need the same stripping
            let link = entry
                .link_name()
                .map_err(tar_error)?
                .map(|l| l.into_owned())
                .ok_or_else(|| KilnError::Extract(format!("hard link {} has no target", path.display())))?;
            let Some(source) = stripped_target(target, &link, strip)? else {
                continue;
            };
            if dest.exists() {
                fs::remove_file(&dest)?;
            }
            if fs::hard_link(&source, &dest).is_err() {
                fs::copy(&source, &dest)?;
            }
            continue;
        }

        entry.unpack(&dest).map_err(|e| {
            KilnError::Extract(format!(
                "failed to unpack {} from {}: {}",
                path.display(),
                archive_path.display(),
                e
            ))
        })?;
    }

    // Read-only directories get their mode only after their children exist
    for (dir, mode) in dirs.iter().rev() {
        set_dir_mode(dir, *mode)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Unpack a zip, promoting the contents of a wrapper directory.
///
/// The archive is extracted into a scratch dir next to `target`, then:
/// - a single top-level directory has its contents moved into `target`
/// - otherwise top-level files move as-is, and a lone top-level directory
///   among them is flattened one level; several directories move as-is
pub fn unpack_zip(archive_path: &Path, target: &Path) -> Result<()> {
    let parent = target.parent().unwrap_or(target);
    fs::create_dir_all(parent)?;
    let scratch = tempfile::Builder::new()
        .prefix(".kiln-unzip-")
        .tempdir_in(parent)?;

    let file = File::open(archive_path)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
        KilnError::Extract(format!("failed to open {}: {}", archive_path.display(), e))
    })?;
    zip.extract(scratch.path()).map_err(|e| {
        KilnError::Extract(format!("failed to unzip {}: {}", archive_path.display(), e))
    })?;

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in fs::read_dir(scratch.path())? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        } else {
            files.push(path);
        }
    }

    fs::create_dir_all(target)?;
    if dirs.len() == 1 {
        move_children(&dirs[0], target)?;
    } else {
        for dir in &dirs {
            move_into(dir, target)?;
        }
    }
    for file in &files {
        move_into(file, target)?;
    }
    Ok(())
}

fn move_children(dir: &Path, target: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        move_into(&entry?.path(), target)?;
    }
    Ok(())
}

fn move_into(path: &Path, target: &Path) -> Result<()> {
    let Some(name) = path.file_name() else {
        return Ok(());
    };
    move_path(path, &target.join(name))
}

/// Move a file or directory, replacing `to`. Falls back to copy and delete
/// when a rename is not possible, such as across filesystems.
pub fn move_path(from: &Path, to: &Path) -> Result<()> {
    if to.symlink_metadata().is_ok() {
        remove_path(to)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    debug!("rename {} failed, copying instead", from.display());
    if from.is_dir() {
        copy_dir(from, to)?;
        fs::remove_dir_all(from)?;
    } else {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

/// Remove a file, symlink or directory tree.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Recursively copy `from` into `to`, recreating symlinks on unix.
pub fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| KilnError::Extract(format!("failed to walk {}: {}", from.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| KilnError::Extract(e.to_string()))?;
        let dest = to.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if dest.symlink_metadata().is_ok() {
                remove_path(&dest)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &dest)?;
            #[cfg(not(unix))]
            {
                tracing::warn!("Copying symlink target of {} instead of the link", link.display());
                fs::copy(entry.path(), &dest)?;
            }
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_detect_formats() {
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar.gz")).unwrap(), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect(Path::new("a.TGZ")).unwrap(), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect(Path::new("a.txz")).unwrap(), ArchiveFormat::TarXz);
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar.bz2")).unwrap(), ArchiveFormat::TarBz2);
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar")).unwrap(), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::detect(Path::new("a.zip")).unwrap(), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::detect(Path::new("tool.exe")).unwrap(), ArchiveFormat::Executable);
        assert!(matches!(
            ArchiveFormat::detect(Path::new("a.rar")),
            Err(KilnError::UnknownArchive(_))
        ));
    }

    #[test]
    fn test_stripped_target_rejects_parent_dir() {
        let target = Path::new("/t");
        assert_eq!(
            stripped_target(target, Path::new("pkg-1.0/src/a.c"), 1).unwrap(),
            Some(PathBuf::from("/t/src/a.c"))
        );
        assert_eq!(stripped_target(target, Path::new("pkg-1.0/"), 1).unwrap(), None);
        assert!(stripped_target(target, Path::new("pkg/../../etc/passwd"), 1).is_err());
    }

    #[test]
    fn test_unpack_tar_gz_strips_first_component() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive_path = dir.path().join("pkg.tar.gz");
        {
            let file = File::create(&archive_path).unwrap();
            let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(enc);
            let data = b"int main;";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "pkg-1.0/src/main.c", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let target = dir.path().join("out");
        unpack(&archive_path, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("src/main.c")).unwrap(), "int main;");
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_tar_read_only_dir_keeps_children() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let archive_path = dir.path().join("pkg.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive_path).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o555);
            header.set_cksum();
            builder.append_data(&mut header, "pkg-1.0/share/", &[][..]).unwrap();

            let data = b"data";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o444);
            header.set_cksum();
            builder
                .append_data(&mut header, "pkg-1.0/share/words.txt", &data[..])
                .unwrap();
            builder.into_inner().unwrap().flush().unwrap();
        }

        let target = dir.path().join("out");
        unpack(&archive_path, &target).unwrap();
        let share = target.join("share");
        assert_eq!(fs::read_to_string(share.join("words.txt")).unwrap(), "data");
        assert_eq!(fs::metadata(&share).unwrap().permissions().mode() & 0o777, 0o555);

        fs::set_permissions(&share, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_unpack_zip_without_wrapper() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive_path = dir.path().join("flat.zip");
        {
            let file = File::create(&archive_path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let opts = zip::write::SimpleFileOptions::default();
            zip.start_file("README", opts).unwrap();
            zip.write_all(b"readme").unwrap();
            zip.start_file("include/a.h", opts).unwrap();
            zip.write_all(b"a").unwrap();
            zip.start_file("lib/liba.a", opts).unwrap();
            zip.write_all(b"lib").unwrap();
            zip.finish().unwrap();
        }

        let target = dir.path().join("out");
        unpack(&archive_path, &target).unwrap();
        assert!(target.join("README").is_file());
        assert!(target.join("include/a.h").is_file());
        assert!(target.join("lib/liba.a").is_file());
    }

    #[test]
    fn test_move_path_replaces_destination() {
        let dir = tempfile::TempDir::new().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::create_dir_all(from.join("sub")).unwrap();
        fs::write(from.join("sub/file"), "new").unwrap();
        fs::create_dir_all(&to).unwrap();
        fs::write(to.join("stale"), "old").unwrap();

        move_path(&from, &to).unwrap();
        assert!(!from.exists());
        assert!(!to.join("stale").exists());
        assert_eq!(fs::read_to_string(to.join("sub/file")).unwrap(), "new");
    }
}
