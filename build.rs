//! Stamps the binary with its source revision and build time

use std::process::Command;

/// Run git and return trimmed stdout, or None when git fails or prints nothing
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    // Packaging pipelines without a checkout can pin the version explicitly
    println!("cargo:rerun-if-env-changed=CANOPY_RELEASE");
    let release = std::env::var("CANOPY_RELEASE")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| git(&["describe", "--tags", "--abbrev=0"]))
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    let mut revision =
        git(&["rev-parse", "--short=10", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    if git(&["status", "--porcelain", "--untracked-files=no"]).is_some() {
        revision.push_str("-dirty");
    }

    println!("cargo:rustc-env=CANOPY_RELEASE={release}");
    println!("cargo:rustc-env=CANOPY_REVISION={revision}");
    println!(
        "cargo:rustc-env=CANOPY_BUILT_AT={}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-changed=build.rs");
}
