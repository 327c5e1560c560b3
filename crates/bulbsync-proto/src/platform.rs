use std::path::{Path, PathBuf};

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/bulbsync/ (XDG standard)
    // instead of macOS Application Support for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("bulbsync")
    }
    #[cfg(windows)]
    {
        // On Windows, check for portable data directory in executable directory first
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_data = exe_dir.join("data");
                if portable_data.exists() {
                    return portable_data;
                }
            }
        }

        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bulbsync")
    }
}

pub fn config_dir() -> PathBuf {
    // On Windows, check for portable config.toml in executable directory first
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_config = exe_dir.join("config.toml");
                if portable_config.exists() {
                    return exe_dir.to_path_buf();
                }
            }
        }
    }

    // On macOS and Linux, always use ~/.config/bulbsync/
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("bulbsync")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bulbsync")
    }
}

#[cfg(unix)]
const FFMPEG_NAMES: &[&str] = &["ffmpeg"];
#[cfg(windows)]
const FFMPEG_NAMES: &[&str] = &["ffmpeg.exe", "ffmpeg"];

/// Directories searched for a bundled or installed ffmpeg, most specific first.
fn ffmpeg_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir.join("external"));
        dirs.push(exe_dir);
    }
    if let Some(path) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path));
    }
    dirs
}

/// Locate the ffmpeg binary used for screen capture.
///
/// `[capture] ffmpeg_path` wins when it points at an existing file, then the
/// `FFMPEG_PATH` environment variable, then the executable's own directory
/// (and its `external/` folder), then `PATH`.
pub fn find_ffmpeg_binary(configured: Option<&Path>) -> Option<PathBuf> {
    let explicit = configured
        .map(Path::to_path_buf)
        .into_iter()
        .chain(std::env::var_os("FFMPEG_PATH").map(PathBuf::from));
    for candidate in explicit {
        if candidate.is_file() {
            return Some(candidate);
        }
        tracing::warn!("ffmpeg not found at {}, searching further", candidate.display());
    }

    ffmpeg_search_dirs()
        .into_iter()
        .flat_map(|dir| FFMPEG_NAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_ffmpeg_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("my-ffmpeg");
        std::fs::write(&bin, b"").unwrap();

        assert_eq!(find_ffmpeg_binary(Some(&bin)), Some(bin));
    }

    #[test]
    fn test_missing_configured_path_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let found = find_ffmpeg_binary(Some(&missing));
        assert_ne!(found.as_deref(), Some(missing.as_path()));
        assert!(found.map_or(true, |p| p.is_file()));
    }
}
