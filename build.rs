use cargo_lock::Lockfile;
use chrono::Utc;
use std::env;
use std::fs;
use std::path::Path;

const UNKNOWN: &str = "unknown";
const SCYLLA_PKG_NAME: &str = "scylla";

// Version of the scylla driver as resolved in Cargo.lock. Sources other
// than crates.io are marked as development builds.
fn scylla_version() -> Option<String> {
    let lockfile = Lockfile::load("Cargo.lock").ok()?;
    let pkg = lockfile
        .packages
        .iter()
        .find(|p| p.name.as_str() == SCYLLA_PKG_NAME)?;
    let from_registry = pkg
        .source
        .as_ref()
        .map(|s| s.to_string().starts_with("registry+"))
        .unwrap_or(false);
    if from_registry {
        Some(pkg.version.to_string())
    } else {
        Some(format!("{}-dev", pkg.version))
    }
}

fn main() {
    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    let build_date = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let scylla_version = scylla_version().unwrap_or_else(|| UNKNOWN.into());

    fs::write(
        Path::new(&out_dir).join("version_info.rs"),
        format!(
            "pub const PKG_VERSION: &str = \"{}\";\n\
             pub const BUILD_DATE: &str = \"{}\";\n\
             pub const SCYLLA_VERSION: &str = \"{}\";\n",
            env!("CARGO_PKG_VERSION"),
            build_date,
            scylla_version,
        ),
    )
    .expect("failed to write version_info.rs");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=Cargo.lock");
}
