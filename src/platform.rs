//! Platform detection for selecting the correct prebuilt binary.
//!
//! Binary artifacts are declared per platform. A platform string has the form
//! `{os}-{arch}`:
//! - **os**: `linux`, `macos` or `windows`
//! - **arch**: `x86_64` or `aarch64`
//!
//! Examples: `linux-x86_64`, `macos-aarch64`, `windows-x86_64`.
//!
//! The detected platform can be overridden with `KILN_EMULATE_PLATFORM`, which is
//! useful for fetching binaries meant for another machine.
//!
//! # Examples
//!
//! ```no_run
//! use kiln::platform;
//!
//! fn main() -> kiln::Result<()> {
//!     let platform = platform::current_platform()?;
//!     println!("Binaries for: {}", platform);
//!     // Output: "linux-x86_64" on an Intel Linux host
//!     Ok(())
//! }
//! ```

use crate::error::{KilnError, Result};

pub const EMULATE_ENV: &str = "KILN_EMULATE_PLATFORM";

pub const SUPPORTED_OS: &[&str] = &["linux", "macos", "windows"];
pub const SUPPORTED_ARCH: &[&str] = &["x86_64", "aarch64"];

/// Platforms a `custom` or `hosted` binary shorthand expands to.
pub const ALL_PLATFORMS: &[&str] = &[
    "linux-x86_64",
    "linux-aarch64",
    "windows-x86_64",
    "macos-x86_64",
    "macos-aarch64",
];

/// Detect the platform string binaries are selected for.
///
/// Honors `KILN_EMULATE_PLATFORM` when set; the override must itself be a
/// valid platform string.
///
/// # Errors
///
/// Returns a validation error if the override is malformed or the host OS is
/// not one of the supported systems.
pub fn current_platform() -> Result<String> {
    if let Ok(emulated) = std::env::var(EMULATE_ENV) {
        let emulated = emulated.trim().to_string();
        validate_platform(&emulated)?;
        return Ok(emulated);
    }
    host_platform()
}

/// Platform of the machine we are running on, ignoring any override.
pub fn host_platform() -> Result<String> {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "macos",
        "windows" => "windows",
        other => {
            return Err(KilnError::validation(
                "platform",
                format!("unsupported operating system: {}", other),
            ));
        }
    };
    // Apple reports arm64 through some toolchains
    let arch = match std::env::consts::ARCH {
        "arm64" => "aarch64",
        other => other,
    };
    Ok(format!("{}-{}", os, arch))
}

/// Check that `platform` is `{os}-{arch}` with a supported os and arch.
pub fn validate_platform(platform: &str) -> Result<()> {
    let (os, arch) = split_platform(platform).ok_or_else(|| {
        KilnError::validation(
            "platform",
            format!("'{}' is not of the form {{os}}-{{arch}}", platform),
        )
    })?;

    if !SUPPORTED_OS.contains(&os) || !SUPPORTED_ARCH.contains(&arch) {
        return Err(KilnError::validation(
            "platform",
            format!(
                "unsupported platform '{}' (os must be one of {}, arch one of {})",
                platform,
                SUPPORTED_OS.join("|"),
                SUPPORTED_ARCH.join("|")
            ),
        ));
    }
    Ok(())
}

/// Split `linux-x86_64` into `("linux", "x86_64")`.
pub fn split_platform(platform: &str) -> Option<(&str, &str)> {
    platform.split_once('-')
}
