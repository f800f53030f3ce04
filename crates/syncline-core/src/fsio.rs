use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Persists sidecar text without ever exposing a torn file.
///
/// The crash-state sidecar is read on every process start, so the content is
/// staged in a scratch file beside the destination, fsynced, and published
/// with a single rename. A rename onto a directory or other unwritable
/// target surfaces as the publish error.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("sidecar path '{}' has no file name", path.display());
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create sidecar directory {}", dir.display()))?;

    // One writer per process by design, so the pid is enough to keep the
    // scratch name out of other processes' way.
    let scratch = dir.join(format!(".{file_name}.part-{}", std::process::id()));
    let staged = std::fs::File::create(&scratch).and_then(|mut file| {
        file.write_all(content.as_bytes())?;
        file.sync_all()
    });
    if let Err(err) = staged {
        let _ = std::fs::remove_file(&scratch);
        return Err(err)
            .with_context(|| format!("failed to stage sidecar content in {}", scratch.display()));
    }
    if let Err(err) = std::fs::rename(&scratch, path) {
        let _ = std::fs::remove_file(&scratch);
        return Err(err)
            .with_context(|| format!("failed to publish sidecar at {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_content_and_leaves_no_scratch_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_text_atomic(&path, "{\"status\":\"running\"}").expect("write");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "{\"status\":\"running\"}"
        );
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".part-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn overwrites_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_text_atomic(&path, "first").expect("write");
        write_text_atomic(&path, "second").expect("rewrite");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "second");
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("sync-state.json");
        write_text_atomic(&path, "{}").expect("write");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{}");
    }

    #[test]
    fn nameless_paths_are_rejected() {
        let err = write_text_atomic(Path::new(""), "{}").expect_err("no file name");
        assert!(err.to_string().contains("no file name"));
    }

    #[test]
    fn publishing_onto_a_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("state.json");
        std::fs::create_dir(&target).expect("mkdir");
        let err = write_text_atomic(&target, "{}").expect_err("directory target");
        assert!(err.to_string().contains("publish"));
    }
}
