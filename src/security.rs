#![forbid(unsafe_code)]

//! Process and filesystem guards for the tubefetch server.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. It spawns an external
/// downloader on user-supplied URLs and writes into a shared temp root, so it
/// is expected to run under an unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged account");
    }
    Ok(())
}

/// Maps a request path onto a file under `root`. Absolute paths, `..` and
/// anything else that could leave `root` yield `None`.
pub fn resolve_static_path(root: &Path, requested: &str) -> Option<PathBuf> {
    let requested = requested.trim_start_matches('/');
    if requested.is_empty() || requested.contains('\\') || requested.contains('\0') {
        return None;
    }

    let mut resolved = root.to_path_buf();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (resolved != root).then_some(resolved)
}
