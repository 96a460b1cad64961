use std::env;
use std::path::Path;
use std::process::Command;

use time::OffsetDateTime;
use time::format_description;

fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    let head = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../.git/HEAD");
    if head.exists() {
        println!("cargo:rerun-if-changed={}", head.display());
    }

    let mut sha = git(&["rev-parse", "--short=10", "HEAD"]).unwrap_or_else(|| "unknown".into());
    if git(&["status", "--porcelain", "--untracked-files=no"]).is_some() {
        sha.push_str("-dirty");
    }
    println!("cargo:rustc-env=GIT_SHA={sha}");
    println!("cargo:rustc-env=BUILD_DATE={}", build_day());
}

/// Trimmed stdout of a successful git call; `None` when git fails or prints nothing.
fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// UTC build day, pinned by `SOURCE_DATE_EPOCH` for reproducible builds.
fn build_day() -> String {
    let when = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    format_description::parse("[year]-[month]-[day]")
        .ok()
        .and_then(|fmt| when.format(&fmt).ok())
        .unwrap_or_else(|| "unknown-date".into())
}
