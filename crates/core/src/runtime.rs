//! Locating ONNX Runtime and the ffmpeg tools shipped next to the binary.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(unix, windows)))]
const ORT_LIB_NAME: &str = "onnxruntime";

/// Ordered directories probed for shared libraries and helper binaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPaths {
    pub lib_dirs: Vec<PathBuf>,
    pub bin_dirs: Vec<PathBuf>,
}

impl SearchPaths {
    /// Paths around the running executable and the working directory.
    pub fn discover() -> Self {
        let exe_dir = env::current_exe()
            .and_then(|path| path.canonicalize())
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        let cwd = env::current_dir().ok();
        Self::from_roots(exe_dir.as_deref(), cwd.as_deref())
    }

    /// Libraries: `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`, then system
    /// directories on Unix. Binaries: `<exe>`, `<exe>/bin`, `<exe>/../bin`,
    /// `<cwd>`, `<cwd>/bin`.
    pub fn from_roots(exe_dir: Option<&Path>, cwd: Option<&Path>) -> Self {
        let mut paths = Self::default();

        if let Some(exe_dir) = exe_dir {
            #[cfg(windows)]
            push_unique(&mut paths.lib_dirs, exe_dir.to_path_buf());
            push_unique(&mut paths.lib_dirs, exe_dir.join("lib"));
            push_unique(&mut paths.bin_dirs, exe_dir.to_path_buf());
            push_unique(&mut paths.bin_dirs, exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                push_unique(&mut paths.lib_dirs, parent.join("lib"));
                push_unique(&mut paths.bin_dirs, parent.join("bin"));
            }
        }

        if let Some(cwd) = cwd {
            push_unique(&mut paths.lib_dirs, cwd.join("lib"));
            push_unique(&mut paths.bin_dirs, cwd.to_path_buf());
            push_unique(&mut paths.bin_dirs, cwd.join("bin"));
        }

        #[cfg(unix)]
        {
            push_unique(&mut paths.lib_dirs, PathBuf::from("/usr/local/lib"));
            push_unique(&mut paths.lib_dirs, PathBuf::from("/usr/lib"));
        }

        paths
    }

    pub fn find_binary(&self, binary: &str) -> Option<PathBuf> {
        let names = binary_names(binary);
        self.bin_dirs
            .iter()
            .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file())
    }

    pub fn find_ort_library(&self) -> Option<PathBuf> {
        self.lib_dirs
            .iter()
            .map(|dir| dir.join(ORT_LIB_NAME))
            .find(|candidate| candidate.is_file())
    }
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

#[cfg(windows)]
fn binary_names(binary: &str) -> Vec<String> {
    let lower = binary.to_ascii_lowercase();
    if Path::new(binary).components().count() > 1 || lower.ends_with(".exe") {
        return vec![binary.to_string()];
    }
    vec![format!("{binary}.exe"), binary.to_string()]
}

#[cfg(not(windows))]
fn binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

/// `Command` for a bundled tool if one sits next to the executable,
/// otherwise for the name resolved through `PATH`.
pub fn command_for(binary: &str) -> Command {
    match SearchPaths::discover().find_binary(binary) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

/// Points `ort`'s dynamic loader at a bundled ONNX Runtime. Must run before
/// the first session is built. An existing `ORT_DYLIB_PATH` is left alone.
pub fn setup_runtime_libs() -> Option<PathBuf> {
    if env::var_os(ORT_DYLIB_ENV).is_some() {
        return None;
    }
    let path = SearchPaths::discover().find_ort_library()?;
    env::set_var(ORT_DYLIB_ENV, &path);
    Some(path)
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var_os(ORT_DYLIB_ENV) {
        Some(path) if Path::new(&path).is_file() => {
            info!(path = %Path::new(&path).display(), "ONNX Runtime library");
        }
        Some(path) => warn!(
            path = %Path::new(&path).display(),
            "{ORT_DYLIB_ENV} points at a missing file"
        ),
        None => warn!("{ORT_DYLIB_ENV} not set, ONNX Runtime uses the default search path"),
    }

    for tool in ["ffmpeg", "ffprobe"] {
        match SearchPaths::discover().find_binary(tool) {
            Some(path) => info!(tool, path = %path.display(), "Bundled tool"),
            None => info!(tool, "Using tool from PATH"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn roots_expand_in_probe_order() {
        let paths =
            SearchPaths::from_roots(Some(Path::new("/opt/app/bin")), Some(Path::new("/work")));

        assert_eq!(
            paths.lib_dirs,
            vec![
                PathBuf::from("/opt/app/bin/lib"),
                PathBuf::from("/opt/app/lib"),
                PathBuf::from("/work/lib"),
                PathBuf::from("/usr/local/lib"),
                PathBuf::from("/usr/lib"),
            ]
        );
        // `<exe>/../bin` is the exe dir itself here and is not repeated.
        assert_eq!(
            paths.bin_dirs,
            vec![
                PathBuf::from("/opt/app/bin"),
                PathBuf::from("/opt/app/bin/bin"),
                PathBuf::from("/work"),
                PathBuf::from("/work/bin"),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn system_lib_dirs_come_last() {
        let paths = SearchPaths::from_roots(None, None);
        assert_eq!(
            paths.lib_dirs,
            vec![PathBuf::from("/usr/local/lib"), PathBuf::from("/usr/lib")]
        );
        assert!(paths.bin_dirs.is_empty());
    }

    #[test]
    fn first_matching_binary_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir");
        std::fs::create_dir_all(&second).expect("second dir");

        #[cfg(windows)]
        let file_name = "ffprobe.exe";
        #[cfg(not(windows))]
        let file_name = "ffprobe";
        std::fs::write(first.join(file_name), b"first").expect("first binary");
        std::fs::write(second.join(file_name), b"second").expect("second binary");

        let paths = SearchPaths {
            lib_dirs: Vec::new(),
            bin_dirs: vec![first.clone(), second],
        };
        assert_eq!(paths.find_binary("ffprobe"), Some(first.join(file_name)));
        assert_eq!(paths.find_binary("ffmpeg"), None);
    }

    #[test]
    fn ort_library_is_found_by_platform_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SearchPaths {
            lib_dirs: vec![temp.path().join("missing"), temp.path().to_path_buf()],
            bin_dirs: Vec::new(),
        };
        assert_eq!(paths.find_ort_library(), None);

        std::fs::write(temp.path().join(ORT_LIB_NAME), b"").expect("fake library");
        assert_eq!(paths.find_ort_library(), Some(temp.path().join(ORT_LIB_NAME)));
    }
}
