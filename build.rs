use std::env;

/// Target triple and profile, reported by `vaultpipe config`.
const STAMPS: &[(&str, &str)] = &[
    ("TARGET", "VAULTPIPE_BUILD_TARGET"),
    ("PROFILE", "VAULTPIPE_BUILD_PROFILE"),
];

fn main() {
    for (cargo_var, stamp) in STAMPS {
        let value = env::var(cargo_var).unwrap_or_else(|_| "unknown".to_string());
        println!("cargo:rustc-env={stamp}={value}");
    }
    println!("cargo:rerun-if-changed=build.rs");
}
