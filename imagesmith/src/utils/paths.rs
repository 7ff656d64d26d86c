//! Path helpers used when recording artifacts.

use std::path::{Component, Path};

/// Strips local filesystem prefixes from an artifact file path.
///
/// A path under `base` is recorded relative to it. Any other absolute path
/// is reduced to its file name. Relative paths are kept as-is, minus any
/// leading `./`.
#[must_use]
pub fn strip_local_prefix(path: &Path, base: Option<&Path>) -> String {
    if let Some(base) = base {
        if let Ok(rel) = path.strip_prefix(base) {
            if rel.as_os_str().is_empty() {
                return file_name_of(path);
            }
            return to_forward_slashes(rel);
        }
    }

    if path.is_absolute() || path.has_root() {
        return file_name_of(path);
    }

    let cleaned: Vec<_> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if cleaned.iter().any(|c| matches!(c, Component::ParentDir)) {
        return file_name_of(path);
    }
    to_forward_slashes(&cleaned.iter().collect::<std::path::PathBuf>())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.to_string_lossy().into_owned(), |n| n.to_string_lossy().into_owned())
}

fn to_forward_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Returns true if a relative request path stays inside its root.
///
/// Empty segments and `.` are tolerated; any `..` or root component is not.
#[must_use]
pub fn is_contained_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_strip_under_base() {
        let base = PathBuf::from("/var/lib/builds/output-rhel9");
        let path = base.join("disks/rhel9-cis.vmdk");
        assert_eq!(strip_local_prefix(&path, Some(&base)), "disks/rhel9-cis.vmdk");
    }

    #[test]
    fn test_strip_absolute_outside_base() {
        let base = PathBuf::from("/var/lib/builds/output-rhel9");
        let path = PathBuf::from("/datastore1/templates/rhel9-cis.ovf");
        assert_eq!(strip_local_prefix(&path, Some(&base)), "rhel9-cis.ovf");
        assert_eq!(strip_local_prefix(&path, None), "rhel9-cis.ovf");
    }

    #[test]
    fn test_strip_relative_paths() {
        assert_eq!(strip_local_prefix(Path::new("./out/disk.qcow2"), None), "out/disk.qcow2");
        assert_eq!(strip_local_prefix(Path::new("../escape/disk.qcow2"), None), "disk.qcow2");
    }

    #[test]
    fn test_is_contained_relative() {
        assert!(is_contained_relative(Path::new("ks.cfg")));
        assert!(is_contained_relative(Path::new("rhel9/ks.cfg")));
        assert!(!is_contained_relative(Path::new("../etc/passwd")));
        assert!(!is_contained_relative(Path::new("/etc/passwd")));
    }
}
