//! Read-only access to a kernel device tree.
//!
//! Discovery never touches the filesystem directly; it goes through a
//! [`SysfsRepository`] whose paths are relative to the tree root. [`FsSysfs`]
//! reads a real (or temporary) directory, [`InMemorySysfs`] serves a tree
//! built in memory.

use std::{
    collections::BTreeMap,
    io,
    path::{Component, Path, PathBuf},
};

pub trait SysfsRepository: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Names of the entries of a directory, sorted.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Target of a symbolic link, as stored in the link.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    fn exists(&self, path: &Path) -> bool;

    /// Reads a file and trims surrounding whitespace.
    fn read_trimmed(&self, path: &Path) -> io::Result<String> {
        Ok(self.read_to_string(path)?.trim().to_string())
    }

    fn read_u64(&self, path: &Path) -> io::Result<u64> {
        let value = self.read_trimmed(path)?;
        value.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} holds {value:?}, not an integer", path.display()),
            )
        })
    }
}

pub struct FsSysfs {
    root: PathBuf,
}

impl FsSysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SysfsRepository for FsSysfs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(path))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.root.join(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(self.root.join(path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).exists()
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(String),
    Link(PathBuf),
    /// A file that exists but cannot be read.
    Unreadable,
}

/// A device tree held in memory. Directories are implied by the paths of
/// their entries. Links are not followed when reading files.
#[derive(Debug, Clone, Default)]
pub struct InMemorySysfs {
    nodes: BTreeMap<PathBuf, Node>,
}

impl InMemorySysfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: impl AsRef<Path>, contents: impl Into<String>) -> Self {
        self.nodes
            .insert(normalize(path.as_ref()), Node::File(contents.into()));
        self
    }

    pub fn link(mut self, path: impl AsRef<Path>, target: impl Into<PathBuf>) -> Self {
        self.nodes
            .insert(normalize(path.as_ref()), Node::Link(target.into()));
        self
    }

    pub fn unreadable(mut self, path: impl AsRef<Path>) -> Self {
        self.nodes.insert(normalize(path.as_ref()), Node::Unreadable);
        self
    }

    /// Creates an empty directory by adding a hidden placeholder entry.
    pub fn dir(self, path: impl AsRef<Path>) -> Self {
        self.file(path.as_ref().join(".keep"), "")
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

impl SysfsRepository for InMemorySysfs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        match self.nodes.get(&normalize(path)) {
            Some(Node::File(contents)) => Ok(contents.clone()),
            Some(Node::Unreadable) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is unreadable", path.display()),
            )),
            Some(Node::Link(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a link", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let dir = normalize(path);
        let mut names: Vec<String> = self
            .nodes
            .keys()
            .filter_map(|p| p.strip_prefix(&dir).ok())
            .filter_map(|rest| rest.components().next())
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .filter(|name| name != ".keep")
            .collect();
        if names.is_empty() && !self.nodes.keys().any(|p| p.starts_with(&dir) && *p != dir) {
            return Err(not_found(path));
        }
        names.dedup();
        Ok(names)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        match self.nodes.get(&normalize(path)) {
            Some(Node::Link(target)) => Ok(target.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a link", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.nodes.keys().any(|p| p.starts_with(&path))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_in_memory_tree() {
        let sysfs = InMemorySysfs::new()
            .file("bus/pci/drivers/i915/0000:03:00.0/device", "0x56c0\n")
            .link("bus/pci/drivers/i915/0000:03:00.1/physfn", "../0000:03:00.0")
            .dir("bus/pci/drivers/i915/0000:03:00.0/drm/card0")
            .unreadable("bus/pci/drivers/i915/0000:03:00.0/sriov_totalvfs");

        let driver = Path::new("bus/pci/drivers/i915");
        assert_eq!(
            sysfs.list_dir(driver).unwrap(),
            vec!["0000:03:00.0", "0000:03:00.1"]
        );
        assert_eq!(
            sysfs
                .read_trimmed(&driver.join("0000:03:00.0/device"))
                .unwrap(),
            "0x56c0"
        );
        assert_eq!(
            sysfs.list_dir(&driver.join("0000:03:00.0/drm")).unwrap(),
            vec!["card0"]
        );
        assert_eq!(
            sysfs
                .read_link(&driver.join("0000:03:00.1/physfn"))
                .unwrap(),
            PathBuf::from("../0000:03:00.0")
        );
        assert!(sysfs
            .read_to_string(&driver.join("0000:03:00.0/sriov_totalvfs"))
            .is_err());
        assert!(sysfs.list_dir(Path::new("bus/pci/drivers/xe")).is_err());
        assert!(!sysfs.exists(&driver.join("0000:03:00.1/sriov_totalvfs")));
    }

    #[test]
    fn test_read_u64_rejects_garbage() {
        let sysfs = InMemorySysfs::new().file("a", "12\n").file("b", "twelve");
        assert_eq!(sysfs.read_u64(Path::new("a")).unwrap(), 12);
        let err = sysfs.read_u64(Path::new("b")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_fs_sysfs_reads_relative_to_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("class/drm/card1")).unwrap();
        std::fs::write(dir.path().join("class/drm/card1/lmem_total_bytes"), "1024\n").unwrap();
        std::fs::create_dir_all(dir.path().join("class/drm/card0")).unwrap();

        let sysfs = FsSysfs::new(dir.path());
        assert_eq!(
            sysfs.list_dir(Path::new("class/drm")).unwrap(),
            vec!["card0", "card1"]
        );
        assert_eq!(
            sysfs
                .read_u64(Path::new("class/drm/card1/lmem_total_bytes"))
                .unwrap(),
            1024
        );
        assert!(sysfs.exists(Path::new("class/drm/card0")));
    }
}
