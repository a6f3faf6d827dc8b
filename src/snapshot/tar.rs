use crate::{
    errors::{ImageError, SnapshotError, VFSError},
    image::ContentDigest,
    snapshot::vfs::{clean_path, FileKind, FileStat, Filesystem},
    storage::FileStorage,
};
use std::{
    collections::{HashMap, HashSet},
    convert::TryInto,
    ffi::{OsStr, OsString},
    io::{self, Cursor, Read},
    path::{Path, PathBuf},
};
use tar::{Archive, Entry, EntryType};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Apply one uncompressed layer archive from the content store
///
/// Regular files are not copied, they point back into the archive blob.
/// Whiteout entries delete paths from lower layers, and an opaque marker
/// hides a lower directory's contents while keeping whatever this same
/// layer puts there.
pub fn apply_layer(
    fs: &mut Filesystem,
    storage: &FileStorage,
    diff: &ContentDigest,
) -> Result<(), SnapshotError> {
    let archive_map = storage
        .mmap(diff)?
        .ok_or(SnapshotError::VFS(VFSError::ImageStorageError))?;
    let mut written: HashSet<PathBuf> = HashSet::new();
    let mut opaque: Vec<PathBuf> = vec![];
    let mut archive = Archive::new(Cursor::new(&archive_map[..]));
    for entry in archive.entries().map_err(ImageError::from)? {
        let entry = entry.map_err(ImageError::from)?;
        let path = clean_path(&entry.path().map_err(ImageError::from)?);
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => {
                extract_entry(fs, entry, &path, diff)?;
                continue;
            }
        };
        let parent = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        if name == OPAQUE_WHITEOUT {
            opaque.push(parent);
        } else if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let target = parent.join(hidden);
            match fs.writer().remove(&target) {
                Ok(()) | Err(VFSError::NotFound) => (),
                Err(other) => return Err(other.into()),
            }
            log::trace!("whiteout {:?}", target);
        } else {
            extract_entry(fs, entry, &path, diff)?;
            written.insert(path);
        }
    }

    // Opaque markers may come before or after the layer's own entries
    let mut keep: HashMap<&Path, HashSet<OsString>> = HashMap::new();
    for path in &written {
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            keep.entry(parent).or_default().insert(name.to_os_string());
        }
    }
    let nothing = HashSet::new();
    for dir in &opaque {
        let kept = keep.get(dir.as_path()).unwrap_or(&nothing);
        match fs.writer().clear_directory(dir, kept) {
            Ok(()) | Err(VFSError::NotFound) => (),
            Err(other) => return Err(other.into()),
        }
        log::trace!("opaque directory {:?}, keeping {:?}", dir, kept);
    }
    Ok(())
}

/// Read every header of a layer archive without applying it
///
/// Any archive that passes can later be applied on top of any lower layer.
pub fn check_layer(storage: &FileStorage, diff: &ContentDigest) -> Result<(), ImageError> {
    let archive_map = storage.mmap(diff)?.ok_or(ImageError::ContentDigestIOError)?;
    let mut archive = Archive::new(Cursor::new(&archive_map[..]));
    let mut count = 0usize;
    for entry in archive.entries()? {
        let entry = entry?;
        entry.path()?;
        match entry.header().entry_type() {
            EntryType::Char | EntryType::Block => {
                device_numbers(&entry)?;
            }
            EntryType::Symlink | EntryType::Link => {
                if entry.link_name()?.is_none() {
                    return Err(ImageError::TARFileError);
                }
            }
            _ => (),
        }
        entry_stat(&entry, FileKind::Regular)?;
        count += 1;
    }
    log::trace!("layer {} has {} entries", diff, count);
    Ok(())
}

fn entry_stat<R: Read>(entry: &Entry<'_, R>, kind: FileKind) -> Result<FileStat, ImageError> {
    let header = entry.header();
    let raw = header.as_old();
    Ok(FileStat {
        st_mode: (numeric_field(header.mode(), &raw.mode)? & 0o7777) | kind.mode_bits(),
        st_uid: numeric_field(header.uid(), &raw.uid)?
            .try_into()
            .map_err(|_| ImageError::TARFileError)?,
        st_gid: numeric_field(header.gid(), &raw.gid)?
            .try_into()
            .map_err(|_| ImageError::TARFileError)?,
        st_mtime: numeric_field(header.mtime(), &raw.mtime)?,
        st_size: header.size()?,
        ..Default::default()
    })
}

/// Read a numeric header field, where a blank field means zero
///
/// Archive writers commonly leave owner and time fields empty.
fn numeric_field<T: Default>(value: io::Result<T>, raw: &[u8]) -> Result<T, ImageError> {
    match value {
        Ok(value) => Ok(value),
        Err(_) if raw.iter().all(|byte| *byte == 0 || *byte == b' ') => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

fn device_numbers<R: Read>(entry: &Entry<'_, R>) -> Result<(u32, u32), ImageError> {
    let header = entry.header();
    match (header.device_major()?, header.device_minor()?) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => Err(ImageError::TARFileError),
    }
}

fn extract_entry<R: Read>(
    fs: &mut Filesystem,
    entry: Entry<'_, R>,
    path: &Path,
    archive: &ContentDigest,
) -> Result<(), SnapshotError> {
    let mut fsw = fs.writer();
    let kind = entry.header().entry_type();
    let link_name = entry
        .link_name()
        .map_err(ImageError::from)?
        .map(|link| link.into_owned());
    match kind {
        EntryType::Regular | EntryType::Continuous => {
            let stat = entry_stat(&entry, FileKind::Regular)?;
            let data = if entry.size() == 0 {
                None
            } else {
                let begin = entry.raw_file_position();
                Some((archive.clone(), begin..(begin + entry.size())))
            };
            fsw.write_layer_file(path, stat, data)?
        }
        EntryType::Directory => {
            fsw.write_directory_metadata(path, entry_stat(&entry, FileKind::Directory)?)?
        }
        EntryType::Fifo => fsw.write_fifo(path, entry_stat(&entry, FileKind::Fifo)?)?,
        EntryType::Symlink => match link_name {
            Some(link_name) => {
                fsw.write_symlink(path, entry_stat(&entry, FileKind::Symlink)?, &link_name)?
            }
            None => return Err(ImageError::TARFileError.into()),
        },
        EntryType::Link => match link_name {
            Some(link_name) => fsw.write_hardlink(path, &clean_path(&link_name))?,
            None => return Err(ImageError::TARFileError.into()),
        },
        EntryType::Char => {
            let (major, minor) = device_numbers(&entry)?;
            fsw.write_char_device(path, entry_stat(&entry, FileKind::CharDevice)?, major, minor)?
        }
        EntryType::Block => {
            let (major, minor) = device_numbers(&entry)?;
            fsw.write_block_device(path, entry_stat(&entry, FileKind::BlockDevice)?, major, minor)?
        }
        _ => log::warn!(
            "skipping unsupported tar file entry type {:?} at {:?}",
            kind,
            OsStr::new(path)
        ),
    }
    Ok(())
}


/// A one-file layer whose uid field is not a number
#[cfg(test)]
pub(crate) fn garbled_layer() -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    header.set_path("garbled").unwrap();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(0);
    header.as_old_mut().uid = *b"garbled\0";
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &[][..]).unwrap();
    builder.into_inner().unwrap()
}
