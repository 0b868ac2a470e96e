//! Tracing setup with a filter that can be tightened at runtime.
//!
//! Parallel downloads interleave their log lines, so the downloader raises the
//! level to `error` for the duration of a concurrent run through
//! [`mute_verbose`]. When no subscriber was installed through [`init`] the
//! guard does nothing.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

struct FilterControl {
    handle: reload::Handle<EnvFilter, Registry>,
    directive: String,
}

static CONTROL: OnceLock<FilterControl> = OnceLock::new();
static MUTED: AtomicUsize = AtomicUsize::new(0);

/// Install the global subscriber. `verbose` raises the default level;
/// `RUST_LOG` wins when set.
pub fn init(verbose: u8) {
    let directive = match std::env::var("RUST_LOG") {
        Ok(directive) if !directive.is_empty() => directive,
        _ => match verbose {
            0 => "warn".to_string(),
            1 => "info".to_string(),
            _ => "debug".to_string(),
        },
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .is_ok();

    if installed {
        let _ = CONTROL.set(FilterControl { handle, directive });
    }
}

impl FilterControl {
    fn mute(&self) {
        let _ = self.handle.reload(EnvFilter::new("error"));
    }

    fn restore(&self) {
        let restored =
            EnvFilter::try_new(&self.directive).unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = self.handle.reload(restored);
    }
}

/// Restores the previous filter when dropped.
#[must_use = "verbosity is restored as soon as the guard is dropped"]
pub struct MuteGuard {
    control: Option<&'static FilterControl>,
    counter: &'static AtomicUsize,
}

/// Force the filter to `error` until the returned guard is dropped.
/// Nested guards restore only when the outermost one goes away.
pub fn mute_verbose() -> MuteGuard {
    mute_with(CONTROL.get(), &MUTED)
}

/// Whether a [`MuteGuard`] is currently alive.
pub fn is_muted() -> bool {
    MUTED.load(Ordering::SeqCst) > 0
}

fn mute_with(control: Option<&'static FilterControl>, counter: &'static AtomicUsize) -> MuteGuard {
    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
        if let Some(control) = control {
            control.mute();
        }
    }
    MuteGuard { control, counter }
}

impl Drop for MuteGuard {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(control) = self.control {
                control.restore();
            }
        }
    }
}
