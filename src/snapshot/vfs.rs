use crate::{errors::VFSError, image::ContentDigest};
use std::{
    collections::{BTreeMap, HashSet},
    ffi::{OsStr, OsString},
    ops::Range,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

pub type INodeNum = usize;

/// Copy-on-write directory tree
///
/// Inodes are reference counted and shared between clones. Cloning a whole
/// [Filesystem] is cheap; a write through [VFSWriter] copies only the inodes
/// it touches, so each clone acts as a private writable layer over the
/// original.
#[derive(Clone)]
pub struct Filesystem {
    inodes: Vec<Option<Arc<INode>>>,
}

pub struct VFSWriter<'f> {
    workdir: INodeNum,
    fs: &'f mut Filesystem,
}

/// File metadata, in the shape of a kernel stat
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileStat {
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_mtime: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
}

/// One directory entry, as listed by [Filesystem::read_dir]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
    pub stat: FileStat,
}

/// Where a regular file's bytes live
#[derive(Clone, Debug)]
pub enum FileContent {
    Empty,
    Layer {
        blob: ContentDigest,
        range: Range<u64>,
    },
    Data(Arc<Vec<u8>>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FollowLinks {
    NoFollow,
    Follow,
}

#[derive(Clone)]
struct INode {
    stat: FileStat,
    data: Node,
}

#[derive(Debug, Clone)]
struct DirEntryRef {
    parent: INodeNum,
    child: INodeNum,
}

#[derive(Clone)]
#[allow(dead_code)]
enum Node {
    Directory(BTreeMap<OsString, INodeNum>),
    File(FileContent),
    SymbolicLink(PathBuf),
    Char(u32, u32),
    Block(u32, u32),
    Fifo,
}

#[derive(Debug)]
struct Limits {
    path_segment: usize,
    symbolic_link: usize,
}

const ROOT: INodeNum = 0;

impl DirEntryRef {
    fn root() -> Self {
        DirEntryRef {
            parent: ROOT,
            child: ROOT,
        }
    }
}

impl Limits {
    fn reset() -> Self {
        Limits {
            path_segment: 1000,
            symbolic_link: 50,
        }
    }

    fn take_path_segment(&mut self) -> Result<(), VFSError> {
        if self.path_segment > 0 {
            self.path_segment -= 1;
            Ok(())
        } else {
            Err(VFSError::PathSegmentLimitExceeded)
        }
    }

    fn take_symbolic_link(&mut self) -> Result<(), VFSError> {
        if self.symbolic_link > 0 {
            self.symbolic_link -= 1;
            Ok(())
        } else {
            Err(VFSError::SymbolicLinkLimitExceeded)
        }
    }
}

impl FileKind {
    fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFIFO => FileKind::Fifo,
            _ => FileKind::Regular,
        }
    }

    /// The `S_IFMT` bits for this kind of file
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileKind::Directory => libc::S_IFDIR,
            FileKind::Regular => libc::S_IFREG,
            FileKind::Symlink => libc::S_IFLNK,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::Fifo => libc::S_IFIFO,
        }
    }
}

impl FileStat {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.st_mode)
    }
}

impl Default for Filesystem {
    fn default() -> Self {
        Filesystem::new()
    }
}

impl Filesystem {
    pub fn new() -> Self {
        let mut fs = Filesystem { inodes: vec![None] };
        fs.writer().put_directory(ROOT, FileStat::default());
        fs
    }

    pub fn writer(&mut self) -> VFSWriter<'_> {
        VFSWriter {
            workdir: ROOT,
            fs: self,
        }
    }

    fn get_inode(&self, num: INodeNum) -> Result<&INode, VFSError> {
        match self.inodes.get(num) {
            Some(Some(node)) => Ok(node),
            _ => Err(VFSError::UnallocNode),
        }
    }

    fn resolve_symlinks(
        &self,
        limits: &mut Limits,
        mut entry: DirEntryRef,
    ) -> Result<DirEntryRef, VFSError> {
        while let Node::SymbolicLink(link) = &self.get_inode(entry.child)?.data {
            log::trace!("following symlink, {:?} -> {:?}", entry, link);
            limits.take_symbolic_link()?;
            entry = self.resolve_path(limits, entry.parent, link)?;
        }
        Ok(entry)
    }

    fn resolve_path_segment(
        &self,
        limits: &mut Limits,
        parent: INodeNum,
        part: &OsStr,
    ) -> Result<DirEntryRef, VFSError> {
        limits.take_path_segment()?;
        if part == "/" {
            Ok(DirEntryRef::root())
        } else {
            match &self.get_inode(parent)?.data {
                Node::Directory(map) => match map.get(part) {
                    None => Err(VFSError::NotFound),
                    Some(child) => Ok(DirEntryRef {
                        parent,
                        child: *child,
                    }),
                },
                _ => Err(VFSError::DirectoryExpected),
            }
        }
    }

    fn resolve_path(
        &self,
        limits: &mut Limits,
        parent: INodeNum,
        path: &Path,
    ) -> Result<DirEntryRef, VFSError> {
        // Symlinks resolve between steps but not after the last one, the
        // result itself might be a link.
        let mut iter = path.iter();
        match iter.next() {
            None => Ok(DirEntryRef {
                parent,
                child: parent,
            }),
            Some(part) => {
                let mut entry = self.resolve_path_segment(limits, parent, part)?;
                for part in iter {
                    entry = self.resolve_symlinks(limits, entry)?;
                    entry = self.resolve_path_segment(limits, entry.child, part)?;
                }
                Ok(entry)
            }
        }
    }

    pub fn lookup(&self, path: &Path, follow_links: FollowLinks) -> Result<INodeNum, VFSError> {
        let mut limits = Limits::reset();
        let entry = self.resolve_path(&mut limits, ROOT, path)?;
        let entry = match follow_links {
            FollowLinks::NoFollow => entry,
            FollowLinks::Follow => self.resolve_symlinks(&mut limits, entry)?,
        };
        log::trace!("lookup({:?}, {:?}) -> {:?}", path, follow_links, entry);
        Ok(entry.child)
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.lookup(path, FollowLinks::NoFollow).is_ok()
    }

    pub fn stat(&self, path: &Path, follow_links: FollowLinks) -> Result<FileStat, VFSError> {
        let num = self.lookup(path, follow_links)?;
        self.stat_inode(num)
    }

    fn stat_inode(&self, num: INodeNum) -> Result<FileStat, VFSError> {
        let mut stat = self.get_inode(num)?.stat.clone();
        stat.st_ino = num as u64;
        Ok(stat)
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf, VFSError> {
        match &self.get_inode(self.lookup(path, FollowLinks::NoFollow)?)?.data {
            Node::SymbolicLink(link) => Ok(link.clone()),
            _ => Err(VFSError::FileExpected),
        }
    }

    /// List a directory, without the `.` and `..` entries
    pub fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, VFSError> {
        let num = self.lookup(path, FollowLinks::Follow)?;
        match &self.get_inode(num)?.data {
            Node::Directory(map) => map
                .iter()
                .filter(|(name, _)| *name != "." && *name != "..")
                .map(|(name, child)| {
                    let stat = self.stat_inode(*child)?;
                    Ok(DirEntry {
                        name: name.clone(),
                        kind: stat.kind(),
                        stat,
                    })
                })
                .collect(),
            _ => Err(VFSError::DirectoryExpected),
        }
    }

    /// Find where a regular file's content is stored
    pub fn file_content(&self, path: &Path) -> Result<FileContent, VFSError> {
        let num = self.lookup(path, FollowLinks::Follow)?;
        match &self.get_inode(num)?.data {
            Node::File(content) => Ok(content.clone()),
            _ => Err(VFSError::FileExpected),
        }
    }
}

impl<'f> VFSWriter<'f> {
    fn alloc_inode_number(&mut self) -> INodeNum {
        let num = self.fs.inodes.len();
        self.fs.inodes.push(None);
        num
    }

    fn get_inode_mut(&mut self, num: INodeNum) -> Result<&mut INode, VFSError> {
        match self.fs.inodes.get_mut(num) {
            Some(Some(node)) => Ok(Arc::make_mut(node)),
            _ => Err(VFSError::UnallocNode),
        }
    }

    fn put_inode(&mut self, num: INodeNum, inode: INode) {
        self.fs.inodes[num] = Some(Arc::new(inode));
    }

    fn put_directory(&mut self, num: INodeNum, stat: FileStat) {
        let mut map = BTreeMap::new();
        map.insert(OsString::from("."), num);
        let permissions = match stat.st_mode & 0o7777 {
            0 => 0o755,
            bits => bits,
        };
        self.put_inode(
            num,
            INode {
                stat: FileStat {
                    st_mode: permissions | libc::S_IFDIR,
                    st_nlink: 1,
                    ..stat
                },
                data: Node::Directory(map),
            },
        );
    }

    fn inode_incref(&mut self, num: INodeNum) -> Result<(), VFSError> {
        let stat = &mut self.get_inode_mut(num)?.stat;
        stat.st_nlink = stat
            .st_nlink
            .checked_add(1)
            .ok_or(VFSError::INodeRefCountError)?;
        Ok(())
    }

    fn inode_decref(&mut self, num: INodeNum) -> Result<(), VFSError> {
        let stat = &mut self.get_inode_mut(num)?.stat;
        stat.st_nlink = stat
            .st_nlink
            .checked_sub(1)
            .ok_or(VFSError::INodeRefCountError)?;
        Ok(())
    }

    fn add_child_to_directory(
        &mut self,
        parent: INodeNum,
        child_name: &OsStr,
        child_value: INodeNum,
    ) -> Result<(), VFSError> {
        self.inode_incref(child_value)?;
        let previous = match &mut self.get_inode_mut(parent)?.data {
            Node::Directory(map) => map.insert(child_name.to_os_string(), child_value),
            _ => return Err(VFSError::DirectoryExpected),
        };
        match previous {
            Some(prev_child) => self.inode_decref(prev_child),
            None => Ok(()),
        }
    }

    fn remove_child_from_directory(
        &mut self,
        parent: INodeNum,
        child_name: &OsStr,
    ) -> Result<bool, VFSError> {
        let previous = match &mut self.get_inode_mut(parent)?.data {
            Node::Directory(map) => map.remove(child_name),
            _ => return Err(VFSError::DirectoryExpected),
        };
        match previous {
            Some(prev_child) => {
                self.inode_decref(prev_child)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn alloc_child_directory(
        &mut self,
        parent: INodeNum,
        name: &OsStr,
        stat: FileStat,
    ) -> Result<INodeNum, VFSError> {
        let num = self.alloc_inode_number();
        self.put_directory(num, stat);
        self.add_child_to_directory(parent, name, num)?;
        self.add_child_to_directory(num, OsStr::new(".."), parent)?;
        Ok(num)
    }

    fn resolve_or_create_parent<'b>(
        &mut self,
        limits: &mut Limits,
        path: &'b Path,
    ) -> Result<(INodeNum, &'b OsStr), VFSError> {
        let dir = match path.parent() {
            Some(parent) => {
                let entry = self.resolve_or_create_path(limits, self.workdir, parent)?;
                self.fs.resolve_symlinks(limits, entry)?.child
            }
            None => self.workdir,
        };
        match path.file_name() {
            None => Err(VFSError::RootDirectory),
            Some(name) => Ok((dir, name)),
        }
    }

    /// Set a directory's metadata, creating it if necessary
    ///
    /// An existing non-directory at this path is replaced.
    pub fn write_directory_metadata(&mut self, path: &Path, stat: FileStat) -> Result<(), VFSError> {
        let mut limits = Limits::reset();
        if path.file_name().is_none() {
            let inode = self.get_inode_mut(self.workdir)?;
            inode.stat.st_mode = (stat.st_mode & !libc::S_IFMT) | libc::S_IFDIR;
            inode.stat.st_uid = stat.st_uid;
            inode.stat.st_gid = stat.st_gid;
            inode.stat.st_mtime = stat.st_mtime;
            return Ok(());
        }
        let (dir, name) = self.resolve_or_create_parent(&mut limits, path)?;
        let existing = self.fs.resolve_path_segment(&mut limits, dir, name);
        match existing {
            Ok(entry) if matches!(self.fs.get_inode(entry.child)?.data, Node::Directory(_)) => {
                let inode = self.get_inode_mut(entry.child)?;
                let nlink = inode.stat.st_nlink;
                inode.stat = FileStat {
                    st_mode: (stat.st_mode & !libc::S_IFMT) | libc::S_IFDIR,
                    st_nlink: nlink,
                    ..stat
                };
                Ok(())
            }
            Ok(_) => {
                self.remove_child_from_directory(dir, name)?;
                self.alloc_child_directory(dir, name, stat)?;
                Ok(())
            }
            Err(VFSError::NotFound) => {
                self.alloc_child_directory(dir, name, stat)?;
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn write_node_file(&mut self, path: &Path, stat: FileStat, data: Node) -> Result<(), VFSError> {
        let mut limits = Limits::reset();
        let (dir, name) = self.resolve_or_create_parent(&mut limits, path)?;
        let num = self.alloc_inode_number();
        self.put_inode(num, INode { stat, data });
        self.add_child_to_directory(dir, name, num)
    }

    pub fn write_layer_file(
        &mut self,
        path: &Path,
        stat: FileStat,
        data: Option<(ContentDigest, Range<u64>)>,
    ) -> Result<(), VFSError> {
        let content = match data {
            Some((blob, range)) => FileContent::Layer { blob, range },
            None => FileContent::Empty,
        };
        self.write_node_file(path, stat, Node::File(content))
    }

    /// Write a regular file held in memory
    ///
    /// Ownership and permissions of an existing file at this path carry
    /// over; otherwise the file gets mode `0644`.
    pub fn write_data_file(&mut self, path: &Path, data: Vec<u8>) -> Result<(), VFSError> {
        let previous = self
            .fs
            .lookup(path, FollowLinks::NoFollow)
            .and_then(|num| self.fs.get_inode(num).map(|inode| inode.stat.clone()));
        let stat = match previous {
            Ok(stat) if stat.kind() == FileKind::Regular => FileStat {
                st_size: data.len() as u64,
                st_nlink: 0,
                ..stat
            },
            Ok(stat) if stat.kind() == FileKind::Directory => return Err(VFSError::FileExpected),
            _ => FileStat {
                st_mode: libc::S_IFREG | 0o644,
                st_size: data.len() as u64,
                ..Default::default()
            },
        };
        self.write_node_file(path, stat, Node::File(FileContent::Data(Arc::new(data))))
    }

    pub fn write_symlink(&mut self, path: &Path, stat: FileStat, link_to: &Path) -> Result<(), VFSError> {
        self.write_node_file(path, stat, Node::SymbolicLink(link_to.to_path_buf()))
    }

    pub fn write_hardlink(&mut self, path: &Path, link_to: &Path) -> Result<(), VFSError> {
        let mut limits = Limits::reset();
        let link_to_node = self.fs.resolve_path(&mut limits, self.workdir, link_to)?.child;
        let (dir, name) = self.resolve_or_create_parent(&mut limits, path)?;
        self.add_child_to_directory(dir, name, link_to_node)
    }

    pub fn write_fifo(&mut self, path: &Path, stat: FileStat) -> Result<(), VFSError> {
        self.write_node_file(path, stat, Node::Fifo)
    }

    pub fn write_char_device(
        &mut self,
        path: &Path,
        stat: FileStat,
        major: u32,
        minor: u32,
    ) -> Result<(), VFSError> {
        self.write_node_file(path, stat, Node::Char(major, minor))
    }

    pub fn write_block_device(
        &mut self,
        path: &Path,
        stat: FileStat,
        major: u32,
        minor: u32,
    ) -> Result<(), VFSError> {
        self.write_node_file(path, stat, Node::Block(major, minor))
    }

    /// Unlink one path, which may be a whole directory tree
    pub fn remove(&mut self, path: &Path) -> Result<(), VFSError> {
        let mut limits = Limits::reset();
        let parent = match path.parent() {
            Some(parent) => {
                let entry = self.fs.resolve_path(&mut limits, self.workdir, parent)?;
                self.fs.resolve_symlinks(&mut limits, entry)?.child
            }
            None => self.workdir,
        };
        let name = path.file_name().ok_or(VFSError::RootDirectory)?;
        if self.remove_child_from_directory(parent, name)? {
            Ok(())
        } else {
            Err(VFSError::NotFound)
        }
    }

    /// Remove every child of a directory except the names in `keep`
    pub fn clear_directory(&mut self, path: &Path, keep: &HashSet<OsString>) -> Result<(), VFSError> {
        let dir = self.fs.lookup(path, FollowLinks::Follow)?;
        let doomed: Vec<OsString> = match &self.fs.get_inode(dir)?.data {
            Node::Directory(map) => map
                .keys()
                .filter(|name| *name != "." && *name != ".." && !keep.contains(*name))
                .cloned()
                .collect(),
            _ => return Err(VFSError::DirectoryExpected),
        };
        for name in doomed {
            self.remove_child_from_directory(dir, &name)?;
        }
        Ok(())
    }

    fn resolve_or_create_path_segment(
        &mut self,
        limits: &mut Limits,
        parent: INodeNum,
        part: &OsStr,
    ) -> Result<DirEntryRef, VFSError> {
        match self.fs.resolve_path_segment(limits, parent, part) {
            Ok(entry) => Ok(entry),
            Err(VFSError::NotFound) => {
                let child = self.alloc_child_directory(parent, part, FileStat::default())?;
                Ok(DirEntryRef { parent, child })
            }
            Err(other) => Err(other),
        }
    }

    fn resolve_or_create_path(
        &mut self,
        limits: &mut Limits,
        parent: INodeNum,
        path: &Path,
    ) -> Result<DirEntryRef, VFSError> {
        let mut iter = path.iter();
        match iter.next() {
            None => Ok(DirEntryRef {
                parent,
                child: parent,
            }),
            Some(part) => {
                let mut entry = self.resolve_or_create_path_segment(limits, parent, part)?;
                for part in iter {
                    entry = self.fs.resolve_symlinks(limits, entry)?;
                    entry = self.resolve_or_create_path_segment(limits, entry.child, part)?;
                }
                Ok(entry)
            }
        }
    }
}

/// Drop everything but plain names from a path taken from an archive
pub fn clean_path(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn file_stat() -> FileStat {
        FileStat {
            st_mode: libc::S_IFREG | 0o644,
            ..Default::default()
        }
    }

    fn data(fs: &Filesystem, path: &str) -> Vec<u8> {
        match fs.file_content(Path::new(path)).unwrap() {
            FileContent::Data(bytes) => bytes.to_vec(),
            FileContent::Empty => vec![],
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn parents_are_created_on_demand() {
        let mut fs = Filesystem::new();
        fs.writer()
            .write_layer_file(Path::new("a/b/c"), file_stat(), None)
            .unwrap();
        assert_eq!(
            fs.stat(Path::new("/a/b"), FollowLinks::Follow).unwrap().kind(),
            FileKind::Directory
        );
        let names: Vec<OsString> = fs
            .read_dir(Path::new("a/b"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![OsString::from("c")]);
    }

    #[test]
    fn symlinks_resolve_between_segments() {
        let mut fs = Filesystem::new();
        let mut w = fs.writer();
        w.write_data_file(Path::new("usr/lib/x"), b"lib".to_vec()).unwrap();
        w.write_symlink(Path::new("lib"), FileStat::default(), Path::new("usr/lib"))
            .unwrap();
        w.write_symlink(Path::new("abs"), FileStat::default(), Path::new("/usr/lib/x"))
            .unwrap();
        assert_eq!(data(&fs, "lib/x"), b"lib");
        assert_eq!(data(&fs, "abs"), b"lib");
        assert_eq!(fs.readlink(Path::new("lib")).unwrap(), Path::new("usr/lib"));
    }

    #[test]
    fn symlink_loops_are_bounded() {
        let mut fs = Filesystem::new();
        let mut w = fs.writer();
        w.write_symlink(Path::new("a"), FileStat::default(), Path::new("b"))
            .unwrap();
        w.write_symlink(Path::new("b"), FileStat::default(), Path::new("a"))
            .unwrap();
        assert!(matches!(
            fs.lookup(Path::new("a"), FollowLinks::Follow),
            Err(VFSError::SymbolicLinkLimitExceeded)
        ));
    }

    #[test]
    fn clones_copy_on_write() {
        let mut lower = Filesystem::new();
        lower
            .writer()
            .write_data_file(Path::new("etc/motd"), b"lower".to_vec())
            .unwrap();
        let mut upper = lower.clone();
        upper
            .writer()
            .write_data_file(Path::new("etc/motd"), b"upper".to_vec())
            .unwrap();
        upper.writer().remove(Path::new("etc")).unwrap();
        assert_eq!(data(&lower, "etc/motd"), b"lower");
        assert!(!upper.exists(Path::new("etc")));
    }

    #[test]
    fn clear_directory_keeps_named_children() {
        let mut fs = Filesystem::new();
        let mut w = fs.writer();
        w.write_data_file(Path::new("d/old"), vec![]).unwrap();
        w.write_data_file(Path::new("d/new"), vec![]).unwrap();
        let keep: HashSet<OsString> = vec![OsString::from("new")].into_iter().collect();
        w.clear_directory(Path::new("d"), &keep).unwrap();
        assert!(fs.exists(Path::new("d/new")));
        assert!(!fs.exists(Path::new("d/old")));
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut fs = Filesystem::new();
        assert!(matches!(
            fs.writer().remove(Path::new("/")),
            Err(VFSError::RootDirectory)
        ));
    }

    #[test]
    fn clean_archive_paths() {
        assert_eq!(clean_path(Path::new("./etc/../x")), Path::new("etc/x"));
        assert_eq!(clean_path(Path::new("/abs/path")), Path::new("abs/path"));
        assert_eq!(clean_path(Path::new(".")), Path::new(""));
    }
}
