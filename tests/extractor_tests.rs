// Extraction tests: placement modes, markers, hooks and idempotency


use kiln::artifact::HookContext;
use kiln::extract::{MARKER_FILE, hosted_marker};
use kiln::{DownloaderOptions, ExtractStatus, FetchPreference, KilnError, Result};
use serde_json::json;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use test_helpers::{PLATFORM, TestEnvironment, artifact};

#[test]
fn test_zip_wrapper_directory_is_flattened() {
    let env = TestEnvironment::new();
    env.zip("foo.zip", &[("foo/bar.txt", "bar"), ("foo/sub/baz.txt", "baz")]);
    env.lock_source_archive("foo", "foo.zip");

    let foo = artifact("foo", json!({ "source": "https://example.com/foo.zip" }));
    let status = env.extractor().extract(&foo, false).unwrap();
    assert_eq!(status, ExtractStatus::Extracted);

    let target = env.layout.source_dir.join("foo");
    assert_eq!(fs::read_to_string(target.join("bar.txt")).unwrap(), "bar");
    assert!(target.join("sub/baz.txt").is_file());
    assert!(!target.join("foo").exists());
    assert!(target.join(MARKER_FILE).is_file());
}

#[test]
fn test_selective_glob_copies_matches_and_removes_scratch() {
    let env = TestEnvironment::new();
    env.tar_gz(
        "libfoo-1.0.tar.gz",
        "libfoo-1.0",
        &[
            ("include/foo.h", "foo"),
            ("include/foo_version.h", "1.0"),
            ("lib/libfoo.a", "archive"),
        ],
    );
    env.lock_source_archive("libfoo", "libfoo-1.0.tar.gz");

    let libfoo = artifact(
        "libfoo",
        json!({ "source": {
            "type": "url",
            "url": "https://example.com/libfoo-1.0.tar.gz",
            "extract": {
                "include/*.h": "{build_root_path}/include/foo",
                "lib/libfoo.a": "{build_root_path}/lib/libfoo.a"
            }
        } }),
    );
    env.extractor().extract(&libfoo, false).unwrap();

    let headers = env.layout.build_root.join("include/foo");
    assert_eq!(fs::read_to_string(headers.join("foo.h")).unwrap(), "foo");
    assert_eq!(fs::read_to_string(headers.join("foo_version.h")).unwrap(), "1.0");
    assert!(env.layout.build_root.join("lib/libfoo.a").is_file());

    let leftovers: Vec<_> = fs::read_dir(&env.layout.working_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".kiln-extract-"))
        .collect();
    assert!(leftovers.is_empty(), "scratch directory was not removed");
}

#[test]
fn test_second_extract_is_a_no_op_until_hash_changes() {
    let env = TestEnvironment::new();
    env.tar_gz("zlib.tar.gz", "zlib-1.3.1", &[("zlib.h", "v1")]);
    env.lock_source_archive("zlib", "zlib.tar.gz");

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = hook_calls.clone();
    let mut zlib = artifact("zlib", json!({ "source": "https://zlib.net/zlib.tar.gz" }));
    zlib.on_source_extracted(Arc::new(move |_ctx: &HookContext<'_>| -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    assert_eq!(env.extractor().extract(&zlib, false).unwrap(), ExtractStatus::Extracted);
    let target = env.layout.source_dir.join("zlib");
    fs::write(target.join("local-edit.txt"), "kept").unwrap();

    // A fresh extractor still sees the marker
    assert_eq!(
        env.extractor().extract(&zlib, false).unwrap(),
        ExtractStatus::AlreadyExtracted
    );
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert!(target.join("local-edit.txt").exists());

    // New bytes, new hash: the stale tree is wiped and re-extracted
    env.tar_gz("zlib.tar.gz", "zlib-1.3.2", &[("zlib.h", "v2")]);
    env.lock_source_archive("zlib", "zlib.tar.gz");
    assert_eq!(env.extractor().extract(&zlib, false).unwrap(), ExtractStatus::Extracted);
    assert_eq!(fs::read_to_string(target.join("zlib.h")).unwrap(), "v2");
    assert!(!target.join("local-edit.txt").exists());
    assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_same_extractor_handles_artifact_once() {
    let env = TestEnvironment::new();
    env.tar_gz("zlib.tar.gz", "zlib", &[("zlib.h", "x")]);
    env.lock_source_archive("zlib", "zlib.tar.gz");
    let zlib = artifact("zlib", json!({ "source": "https://zlib.net/zlib.tar.gz" }));

    let mut extractor = env.extractor();
    assert_eq!(extractor.extract(&zlib, false).unwrap(), ExtractStatus::Extracted);
    fs::remove_dir_all(env.layout.source_dir.join("zlib")).unwrap();
    assert_eq!(
        extractor.extract(&zlib, false).unwrap(),
        ExtractStatus::AlreadyExtracted
    );
}

#[test]
fn test_missing_download_is_descriptive() {
    let env = TestEnvironment::new();
    env.tar_gz("zlib.tar.gz", "zlib", &[("zlib.h", "x")]);
    env.lock_source_archive("zlib", "zlib.tar.gz");
    fs::remove_file(env.download_path("zlib.tar.gz")).unwrap();

    let zlib = artifact("zlib", json!({ "source": "https://zlib.net/zlib.tar.gz" }));
    let err = env.extractor().extract(&zlib, false).unwrap_err();
    assert!(matches!(err, KilnError::MissingDownload { .. }), "got {err}");
    assert!(err.to_string().contains("zlib"));
}

#[test]
fn test_failing_hook_leaves_no_marker() {
    let env = TestEnvironment::new();
    env.tar_gz("zlib.tar.gz", "zlib", &[("zlib.h", "x")]);
    env.lock_source_archive("zlib", "zlib.tar.gz");

    let mut zlib = artifact("zlib", json!({ "source": "https://zlib.net/zlib.tar.gz" }));
    zlib.on_source_extracted(Arc::new(|_ctx: &HookContext<'_>| -> Result<()> {
        Err(KilnError::Extract("patch failed".into()))
    }));

    assert!(env.extractor().extract(&zlib, false).is_err());
    let target = env.layout.source_dir.join("zlib");
    assert!(target.join("zlib.h").exists());
    assert!(!target.join(MARKER_FILE).exists());
}

#[test]
fn test_binary_preferred_when_cached() {
    let env = TestEnvironment::new();
    env.tar_gz("zlib-src.tar.gz", "zlib", &[("zlib.h", "source")]);
    env.tar_gz("zlib-bin.tar.gz", "zlib", &[("lib/libz.a", "binary")]);
    env.lock_source_archive("zlib", "zlib-src.tar.gz");
    env.lock_binary_archive("zlib", "zlib-bin.tar.gz");

    let platforms = Arc::new(Mutex::new(Vec::new()));
    let seen = platforms.clone();
    let mut zlib = artifact(
        "zlib",
        json!({
            "source": "https://zlib.net/zlib.tar.gz",
            "binary": { "linux-x86_64": "https://example.com/zlib-bin.tar.gz" }
        }),
    );
    zlib.on_binary_extracted(&[], Arc::new(move |ctx: &HookContext<'_>| -> Result<()> {
        seen.lock().unwrap().push(ctx.platform.map(str::to_string));
        Ok(())
    }));

    env.extractor().extract(&zlib, false).unwrap();
    assert!(env.layout.pkg_root.join("zlib/lib/libz.a").is_file());
    assert!(!env.layout.source_dir.join("zlib").exists());
    assert_eq!(*platforms.lock().unwrap(), vec![Some(PLATFORM.to_string())]);

    env.extractor().extract(&zlib, true).unwrap();
    assert!(env.layout.source_dir.join("zlib/zlib.h").is_file());
}

fn zlib_with_both_cached(env: &TestEnvironment) -> kiln::Artifact {
    env.tar_gz("zlib-src.tar.gz", "zlib", &[("zlib.h", "source")]);
    env.tar_gz("zlib-bin.tar.gz", "zlib", &[("lib/libz.a", "binary")]);
    env.lock_source_archive("zlib", "zlib-src.tar.gz");
    env.lock_binary_archive("zlib", "zlib-bin.tar.gz");
    artifact(
        "zlib",
        json!({
            "source": "https://zlib.net/zlib.tar.gz",
            "binary": { "linux-x86_64": "https://example.com/zlib-bin.tar.gz" }
        }),
    )
}

#[test]
fn test_force_source_overrides_cached_binary() {
    let env = TestEnvironment::new();
    let zlib = zlib_with_both_cached(&env);

    let status = env.extractor().extract(&zlib, true).unwrap();
    assert_eq!(status, ExtractStatus::Extracted);
    assert!(env.layout.source_dir.join("zlib/zlib.h").is_file());
    assert!(!env.layout.pkg_root.join("zlib").exists());
}

#[test]
fn test_per_artifact_source_only_skips_cached_binary() {
    let env = TestEnvironment::new();
    let zlib = zlib_with_both_cached(&env);

    // Same per-artifact choice the download ran with
    let options = DownloaderOptions::default().with_preference("zlib", FetchPreference::SourceOnly);
    let mut extractor = env.extractor().with_preferences(&options.preferences);
    assert_eq!(extractor.preference_for("zlib"), FetchPreference::SourceOnly);
    assert_eq!(extractor.preference_for("openssl"), FetchPreference::PreferBinary);

    extractor.extract(&zlib, false).unwrap();
    assert!(env.layout.source_dir.join("zlib/zlib.h").is_file());
    assert!(!env.layout.pkg_root.join("zlib").exists());
}

#[test]
fn test_per_artifact_prefer_source_wins_over_global_binary() {
    let env = TestEnvironment::new();
    let zlib = zlib_with_both_cached(&env);

    env.extractor()
        .with_preference(FetchPreference::BinaryOnly)
        .with_artifact_preference("zlib", FetchPreference::PreferSource)
        .extract(&zlib, false)
        .unwrap();
    assert!(env.layout.source_dir.join("zlib/zlib.h").is_file());
    assert!(!env.layout.pkg_root.join("zlib").exists());
}

#[test]
fn test_hosted_binary_uses_shared_root_marker() {
    let env = TestEnvironment::new();
    env.tar_gz("openssl-x86_64-linux.tar.gz", "openssl", &[("lib/libssl.a", "ssl")]);
    env.lock_binary_archive("openssl", "openssl-x86_64-linux.tar.gz");
    env.tar_gz("zlib-x86_64-linux.tar.gz", "zlib", &[("lib/libz.a", "z")]);
    env.lock_binary_archive("zlib", "zlib-x86_64-linux.tar.gz");

    let openssl = artifact("openssl", json!({ "binary": "hosted" }));
    let zlib = artifact("zlib", json!({ "binary": "hosted" }));

    let mut extractor = env.extractor();
    extractor.extract(&openssl, false).unwrap();
    extractor.extract(&zlib, false).unwrap();

    let root = &env.layout.build_root;
    assert!(root.join("lib/libssl.a").is_file());
    assert!(root.join("lib/libz.a").is_file());
    assert!(root.join(hosted_marker("openssl")).is_file());
    assert!(root.join(hosted_marker("zlib")).is_file());
    assert!(!root.join(MARKER_FILE).exists());

    let check = env.extractor();
    assert!(check.is_binary_extracted(&zlib, PLATFORM, true).unwrap());
    assert_eq!(
        env.extractor().extract(&zlib, false).unwrap(),
        ExtractStatus::AlreadyExtracted
    );
}

#[test]
fn test_extract_all_puts_php_src_first() {
    let env = TestEnvironment::new();
    env.tar_gz("php.tar.gz", "php-8.4.0", &[("main/php.h", "php")]);
    env.lock_source_archive("php-src", "php.tar.gz");
    env.tar_gz("redis.tar.gz", "redis-6.1.0", &[("redis.c", "redis")]);
    env.lock_source_archive("redis", "redis.tar.gz");

    // Extension sources land inside the php-src tree
    let redis = artifact(
        "redis",
        json!({ "source": {
            "type": "url",
            "url": "https://example.com/redis.tar.gz",
            "extract": "php-src/ext/{artifact_name}"
        } }),
    );
    let php = artifact("php-src", json!({ "source": "https://example.com/php.tar.gz" }));

    let statuses = env.extractor().extract_all([&redis, &php], false).unwrap();
    let order: Vec<&str> = statuses.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(order, vec!["php-src", "redis"]);

    let php_dir = env.layout.source_dir.join("php-src");
    assert!(php_dir.join("main/php.h").is_file());
    assert!(php_dir.join("ext/redis/redis.c").is_file());
}

#[test]
fn test_custom_extract_callback_takes_over() {
    let env = TestEnvironment::new();
    env.tar_gz("tool.tar.gz", "tool", &[("bin/tool", "#!/bin/sh")]);
    env.lock_source_archive("tool", "tool.tar.gz");

    let seen = Arc::new(Mutex::new(None));
    let record = seen.clone();
    let mut tool = artifact("tool", json!({ "source": "https://example.com/tool.tar.gz" }));
    tool.set_source_extract(Arc::new(move |req: &kiln::artifact::ExtractRequest<'_>| -> Result<()> {
        *record.lock().unwrap() = Some(req.download_path.to_path_buf());
        Ok(())
    }));

    env.extractor().extract(&tool, false).unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(env.download_path("tool.tar.gz")));
    assert!(!env.layout.source_dir.join("tool").exists());
}

#[cfg(unix)]
#[test]
fn test_local_source_is_symlinked() {
    let env = TestEnvironment::new();
    let dev = env.local_dir("dev", &[("src/main.c", "int main;")]);
    let result = kiln::DownloadResult::local(&dev, json!({"type": "local"})).unwrap();
    env.cache
        .lock("dev", kiln::LockType::Source, &result, PLATFORM)
        .unwrap();

    let artifact = artifact("dev", json!({ "source": { "type": "local", "dirname": dev.display().to_string() } }));
    env.extractor().extract(&artifact, false).unwrap();

    let target = env.layout.source_dir.join("dev");
    assert!(fs::symlink_metadata(&target).unwrap().file_type().is_symlink());
    assert!(target.join("src/main.c").is_file());

    // No hash, so every run links again
    assert_eq!(
        env.extractor().extract(&artifact, false).unwrap(),
        ExtractStatus::Extracted
    );
}
