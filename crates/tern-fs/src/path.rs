//! Pathname resolution.
//!
//! Paths are raw byte strings split on `/`. A leading slash restarts at the
//! root inode, empty components are skipped, and `.`/`..` are ordinary
//! directory entries maintained by MkDir. A trailing slash normalizes to a
//! trailing `/.`, which forces the component before it to resolve as a
//! directory (and forces a final symlink to be followed). Symbolic links
//! resolve recursively from the directory containing the link, bounded by
//! [`MAXSYMLINKS`].

use tern_core::{Inum, MAXSYMLINKS};
use tracing::trace;

use crate::cache::Cache;
use crate::dir::find_entry;
use crate::disk::Disk;
use crate::layout::{Inode, InodeType, DIRNAMELEN, ROOTINODE};
use crate::FsError;

/// Normalize a raw pathname: reject empty paths and rewrite a trailing
/// slash as `/.`.
pub fn normalize(path: &[u8]) -> Result<Vec<u8>, FsError> {
    if path.is_empty() {
        return Err(FsError::ArgumentInvalid("empty pathname"));
    }
    let mut out = path.to_vec();
    if out.ends_with(b"/") {
        out.push(b'.');
    }
    Ok(out)
}

/// The final component of a path (the whole path when it has no slash).
pub fn last_component(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

fn next_component(path: &[u8], mut idx: usize) -> (Option<&[u8]>, usize) {
    while idx < path.len() && path[idx] == b'/' {
        idx += 1;
    }
    let start = idx;
    while idx < path.len() && path[idx] != b'/' {
        idx += 1;
    }
    if idx == start {
        (None, idx)
    } else {
        (Some(&path[start..idx]), idx)
    }
}

/// Verify that a relative path's starting directory still carries the reuse
/// stamp the client observed at ChDir time. Absolute paths skip the check.
pub fn verify_cwd_reuse<D: Disk>(
    cache: &mut Cache<D>,
    path: &[u8],
    cwd: Inum,
    cwd_reuse: i32,
) -> Result<(), FsError> {
    if path.first() == Some(&b'/') {
        return Ok(());
    }
    let inode = cache.inode(cwd)?;
    if inode.reuse != cwd_reuse {
        return Err(FsError::StaleHandle);
    }
    Ok(())
}

/// Resolve `path` to an inode number, starting from directory `start`.
///
/// `resolve_last` controls whether a symbolic link in the final component
/// is followed (Open, Create, ChDir) or returned as-is (Unlink, ReadLink,
/// Stat, Link).
pub fn resolve_path<D: Disk>(
    cache: &mut Cache<D>,
    path: &[u8],
    start: Inum,
    depth: usize,
    resolve_last: bool,
) -> Result<Inum, FsError> {
    trace!(path = %String::from_utf8_lossy(path), %start, depth, resolve_last, "resolving path");
    if path.is_empty() {
        return Err(FsError::ArgumentInvalid("empty pathname"));
    }
    if depth > MAXSYMLINKS {
        return Err(FsError::SymlinkLoop);
    }
    if path == b"/" {
        return Ok(ROOTINODE);
    }

    let mut current_dir = if path[0] == b'/' { ROOTINODE } else { start };
    let mut current = current_dir;
    let (mut component, mut idx) = next_component(path, 0);

    while let Some(name) = component {
        let dir_inode = *cache.inode(current_dir)?;
        if dir_inode.kind != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }

        let inum = find_entry(cache, current_dir, name)?.ok_or(FsError::NotFound)?;
        let inode = *cache.inode(inum)?;

        if inode.kind == InodeType::Symlink {
            let (next, after) = next_component(path, idx);
            if next.is_none() {
                // A symlink in the final component is only traversed when
                // the lookup is on behalf of Open, Create, or ChDir.
                if resolve_last {
                    return resolve_symlink(cache, current_dir, &inode, depth + 1);
                }
                return Ok(inum);
            }
            let target = resolve_symlink(cache, current_dir, &inode, depth + 1)?;
            current = target;
            current_dir = target;
            component = next;
            idx = after;
        } else {
            current = inum;
            current_dir = inum;
            let (next, after) = next_component(path, idx);
            component = next;
            idx = after;
        }
    }

    Ok(current)
}

/// Follow one symbolic link: read its target path out of `direct[0]` and
/// resolve it from the directory that contained the link.
fn resolve_symlink<D: Disk>(
    cache: &mut Cache<D>,
    containing_dir: Inum,
    link: &Inode,
    depth: usize,
) -> Result<Inum, FsError> {
    if depth > MAXSYMLINKS {
        return Err(FsError::SymlinkLoop);
    }
    let target = read_symlink_target(cache, link)?;
    resolve_path(cache, &target, containing_dir, depth, true)
}

/// The target path stored in a symlink inode.
pub fn read_symlink_target<D: Disk>(
    cache: &mut Cache<D>,
    link: &Inode,
) -> Result<Vec<u8>, FsError> {
    if link.kind != InodeType::Symlink {
        return Err(FsError::NotSymlink);
    }
    if link.direct[0] == 0 {
        return Err(FsError::ArgumentInvalid("symlink has no data block"));
    }
    let block = cache.block(link.direct[0])?;
    Ok(block[..link.size as usize].to_vec())
}

/// Resolve the directory that contains the final component of `path`.
pub fn parent_of<D: Disk>(
    cache: &mut Cache<D>,
    path: &[u8],
    start: Inum,
) -> Result<Inum, FsError> {
    match path.iter().rposition(|&b| b == b'/') {
        None => Ok(start),
        Some(0) => Ok(ROOTINODE),
        Some(pos) => resolve_path(cache, &path[..pos], start, 0, true),
    }
}

fn trim_trailing_slashes(path: &[u8]) -> &[u8] {
    let end = path
        .iter()
        .rposition(|&b| b != b'/')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    &path[..end]
}

fn parent_path_of(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        None => b"",
        Some(0) => b"/",
        Some(pos) => &path[..pos],
    }
}

fn join_paths(parent: &[u8], target: &[u8]) -> Vec<u8> {
    if target.first() == Some(&b'/') || parent.is_empty() {
        return target.to_vec();
    }
    let mut full = parent.to_vec();
    if !full.ends_with(b"/") {
        full.push(b'/');
    }
    full.extend_from_slice(target);
    full
}

/// Locate the directory in which Create (or MkDir, SymLink, Link) should
/// place the final component of `path`, returning that directory's inode
/// and the component name.
///
/// When the component already exists as a symbolic link, the link is
/// followed once and the search restarts on the joined target path, so a
/// Create through `a/b/link` lands on the link's target.
pub fn find_create_parent<D: Disk>(
    cache: &mut Cache<D>,
    path: &[u8],
    start: Inum,
    depth: usize,
) -> Result<(Inum, Vec<u8>), FsError> {
    if depth > MAXSYMLINKS {
        return Err(FsError::SymlinkLoop);
    }
    let trimmed = trim_trailing_slashes(path);
    if trimmed.is_empty() {
        return Err(FsError::ArgumentInvalid("no final component"));
    }
    let name = last_component(trimmed).to_vec();
    if name.len() > DIRNAMELEN {
        return Err(FsError::ArgumentInvalid("name exceeds DIRNAMELEN"));
    }

    let parent_path = parent_path_of(trimmed);
    let parent = if parent_path.is_empty() {
        start
    } else {
        resolve_path(cache, parent_path, start, 0, true)?
    };

    if let Some(existing) = find_entry(cache, parent, &name)? {
        let inode = *cache.inode(existing)?;
        if inode.kind == InodeType::Symlink {
            let target = read_symlink_target(cache, &inode)?;
            let full = join_paths(parent_path, &target);
            trace!(
                link = %String::from_utf8_lossy(&name),
                target = %String::from_utf8_lossy(&full),
                "create path follows symlink"
            );
            return find_create_parent(cache, &full, start, depth + 1);
        }
    }
    Ok((parent, name))
}
