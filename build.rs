use std::process::Command;

/// Trimmed stdout of a git command, `None` outside a checkout.
fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn main() {
    // release pipelines build from tarballs without .git
    let build_id = std::env::var("TRANSFER_SAGA_BUILD_ID")
        .ok()
        .or_else(|| git(&["describe", "--always", "--dirty", "--abbrev=8"]))
        .unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=GIT_HASH={build_id}");
    println!("cargo:rerun-if-env-changed=TRANSFER_SAGA_BUILD_ID");
    for path in [".git/HEAD", ".git/index"] {
        println!("cargo:rerun-if-changed={path}");
    }
}
