//! Path resolution.
//!
//! `namei` walks an absolute NUL-free path component by component from the
//! namespace root, dispatching each step through the current directory's
//! `lookup` vop and crossing mount points as it goes. Symbolic links do
//! not exist in this kernel.

use alloc::sync::Arc;

use muon_core::errno::Errno;

use crate::mount::Namespace;
use crate::vnode::{Vnode, VnodeType};
use crate::{NAME_MAX, PATH_MAX};

/// Splits a path into its non-empty components.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Resolves `path` to a vnode.
///
/// # Errors
///
/// [`Errno::Inval`] for relative or NUL-bearing paths,
/// [`Errno::Nametoolong`] when a component or the whole path exceeds its
/// ceiling, [`Errno::Noent`] (from the filesystem) when a component is
/// missing, [`Errno::Io`] when a non-directory is asked to resolve one.
pub fn namei(ns: &Namespace, path: &str) -> Result<Arc<Vnode>, Errno> {
    if path.len() > PATH_MAX {
        return Err(Errno::Nametoolong);
    }
    if !path.starts_with('/') || path.contains('\0') {
        return Err(Errno::Inval);
    }

    let mut cur = ns.root()?;
    for comp in components(path) {
        if comp.len() > NAME_MAX {
            return Err(Errno::Nametoolong);
        }
        if cur.vtype() != VnodeType::Dir {
            return Err(Errno::Io);
        }
        cur = cur.vop_lookup(comp)?;
        if let Some(mounted_root) = ns.mount_crossing(&cur) {
            cur = mounted_root;
        }
    }
    Ok(cur)
}

/// Resolves the directory part of `path` and returns it with the final
/// component, for create-style operations (`open` with `O_CREAT`).
///
/// # Errors
///
/// As [`namei`]; additionally [`Errno::Inval`] for the bare root.
pub fn namei_parent<'p>(ns: &Namespace, path: &'p str) -> Result<(Arc<Vnode>, &'p str), Errno> {
    if path.len() > PATH_MAX {
        return Err(Errno::Nametoolong);
    }
    let trimmed = path.trim_end_matches('/');
    let (dir_part, name) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => return Err(Errno::Inval),
    };
    if name.is_empty() {
        return Err(Errno::Inval);
    }
    if name.len() > NAME_MAX {
        return Err(Errno::Nametoolong);
    }
    let dir = if dir_part.is_empty() {
        ns.root()?
    } else {
        namei(ns, dir_part)?
    };
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::Tmpfs;

    fn ns_with_tmpfs_root() -> Namespace {
        let ns = Namespace::new();
        let root = Tmpfs::new_root();
        ns.set_root(root);
        ns
    }

    #[test]
    fn resolves_nested_paths() {
        let ns = ns_with_tmpfs_root();
        let root = ns.root().unwrap();
        let dir = root.vop_create("usr", VnodeType::Dir).unwrap();
        dir.vop_create("motd", VnodeType::Reg).unwrap();

        assert_eq!(namei(&ns, "/").unwrap().vtype(), VnodeType::Dir);
        assert_eq!(namei(&ns, "/usr/motd").unwrap().vtype(), VnodeType::Reg);
        assert_eq!(namei(&ns, "//usr///motd").unwrap().vtype(), VnodeType::Reg);
        assert_eq!(namei(&ns, "/usr/none").unwrap_err(), Errno::Noent);
        assert_eq!(namei(&ns, "usr").unwrap_err(), Errno::Inval);
    }

    #[test]
    fn crosses_mount_points() {
        let ns = ns_with_tmpfs_root();
        let root = ns.root().unwrap();
        let covered = root.vop_create("dev", VnodeType::Dir).unwrap();

        let devfs_root = Tmpfs::new_root();
        devfs_root.vop_create("null", VnodeType::Reg).unwrap();
        ns.mount("dev", Arc::clone(&devfs_root), Some(covered)).unwrap();

        let hit = namei(&ns, "/dev").unwrap();
        assert!(Arc::ptr_eq(&hit, &devfs_root));
        assert_eq!(namei(&ns, "/dev/null").unwrap().vtype(), VnodeType::Reg);
    }

    #[test]
    fn enforces_limits() {
        let ns = ns_with_tmpfs_root();
        let long_comp = alloc::format!("/{}", "c".repeat(NAME_MAX + 1));
        assert_eq!(namei(&ns, &long_comp).unwrap_err(), Errno::Nametoolong);
        let long_path = alloc::format!("/{}", "a/".repeat(PATH_MAX));
        assert_eq!(namei(&ns, &long_path).unwrap_err(), Errno::Nametoolong);
    }

    #[test]
    fn parent_resolution() {
        let ns = ns_with_tmpfs_root();
        let root = ns.root().unwrap();
        root.vop_create("tmp", VnodeType::Dir).unwrap();

        let (dir, name) = namei_parent(&ns, "/tmp/core.7").unwrap();
        assert_eq!(dir.vtype(), VnodeType::Dir);
        assert_eq!(name, "core.7");

        let (dir, name) = namei_parent(&ns, "/hosts").unwrap();
        assert!(Arc::ptr_eq(&dir, &root));
        assert_eq!(name, "hosts");

        assert_eq!(namei_parent(&ns, "/").unwrap_err(), Errno::Inval);
    }
}
