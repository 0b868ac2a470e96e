//! Directory layout shared by the downloader and the extractor.
//!
//! All roots default to subdirectories of the working directory and can be
//! moved individually through environment variables:
//!
//! | root | variable | default |
//! |---|---|---|
//! | working dir | `KILN_WORKING_DIR` | current directory |
//! | downloads | `KILN_DOWNLOAD_PATH` | `{working}/downloads` |
//! | sources | `KILN_SOURCE_PATH` | `{working}/source` |
//! | build root | `KILN_BUILD_ROOT_PATH` | `{working}/buildroot` |
//! | package root | `KILN_PKG_ROOT_PATH` | `{working}/pkgroot/{platform}` |

use crate::error::Result;
use std::path::{Path, PathBuf};

/// File name of the download ledger inside the download directory.
pub const CACHE_FILE: &str = ".cache.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub working_dir: PathBuf,
    pub download_dir: PathBuf,
    pub source_dir: PathBuf,
    pub build_root: PathBuf,
    pub pkg_root: PathBuf,
}

impl Layout {
    /// Layout with every root placed under `working_dir`.
    pub fn new(working_dir: impl Into<PathBuf>, platform: &str) -> Self {
        let working_dir = working_dir.into();
        Self {
            download_dir: working_dir.join("downloads"),
            source_dir: working_dir.join("source"),
            build_root: working_dir.join("buildroot"),
            pkg_root: working_dir.join("pkgroot").join(platform),
            working_dir,
        }
    }

    /// Detect the layout from the environment, falling back to defaults.
    pub fn from_env(platform: &str) -> Result<Self> {
        let working_dir = match std::env::var_os("KILN_WORKING_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()?,
        };
        let mut layout = Self::new(working_dir, platform);

        if let Some(dir) = std::env::var_os("KILN_DOWNLOAD_PATH") {
            layout.download_dir = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("KILN_SOURCE_PATH") {
            layout.source_dir = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("KILN_BUILD_ROOT_PATH") {
            layout.build_root = PathBuf::from(dir);
        }
        if let Some(dir) = std::env::var_os("KILN_PKG_ROOT_PATH") {
            layout.pkg_root = PathBuf::from(dir);
        }
        Ok(layout)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.download_dir.join(CACHE_FILE)
    }

    /// Expand `{variable}` placeholders in an extraction path template.
    ///
    /// Known variables: `artifact_name`, `working_dir`, `download_path`,
    /// `source_path`, `build_root_path`, `pkg_root_path`. Unknown placeholders
    /// are left untouched.
    pub fn substitute(&self, template: &str, artifact_name: &str) -> String {
        let vars: [(&str, String); 6] = [
            ("{artifact_name}", artifact_name.to_string()),
            ("{working_dir}", self.working_dir.display().to_string()),
            ("{download_path}", self.download_dir.display().to_string()),
            ("{source_path}", self.source_dir.display().to_string()),
            ("{build_root_path}", self.build_root.display().to_string()),
            ("{pkg_root_path}", self.pkg_root.display().to_string()),
        ];

        let mut out = template.to_string();
        for (key, value) in &vars {
            if out.contains(key) {
                out = out.replace(key, value);
            }
        }
        out
    }

    /// Substitute variables, then anchor a relative result under `base`.
    pub fn resolve_under(&self, base: &Path, template: &str, artifact_name: &str) -> PathBuf {
        let expanded = PathBuf::from(self.substitute(template, artifact_name));
        if expanded.is_absolute() {
            expanded
        } else {
            base.join(expanded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let layout = Layout::new("/work", "linux-x86_64");
        assert_eq!(layout.download_dir, PathBuf::from("/work/downloads"));
        assert_eq!(layout.source_dir, PathBuf::from("/work/source"));
        assert_eq!(layout.build_root, PathBuf::from("/work/buildroot"));
        assert_eq!(layout.pkg_root, PathBuf::from("/work/pkgroot/linux-x86_64"));
        assert_eq!(layout.cache_file(), PathBuf::from("/work/downloads/.cache.json"));
    }

    #[test]
    fn test_substitute_known_variables() {
        let layout = Layout::new("/work", "linux-x86_64");
        assert_eq!(
            layout.substitute("{pkg_root_path}/{artifact_name}/include", "zlib"),
            "/work/pkgroot/linux-x86_64/zlib/include"
        );
        assert_eq!(layout.substitute("{build_root_path}/lib", "x"), "/work/buildroot/lib");
        assert_eq!(layout.substitute("{unknown}/a", "x"), "{unknown}/a");
    }

    #[test]
    fn test_resolve_under() {
        let layout = Layout::new("/work", "linux-x86_64");
        let base = layout.source_dir.clone();
        assert_eq!(
            layout.resolve_under(&base, "php-src/ext/{artifact_name}", "redis"),
            PathBuf::from("/work/source/php-src/ext/redis")
        );
        assert_eq!(
            layout.resolve_under(&base, "{build_root_path}/include", "redis"),
            PathBuf::from("/work/buildroot/include")
        );
    }
}
