//! Stamps the build for `rtaccel-sim version`.
//!
//! `SOURCE_DATE_EPOCH` pins the stamp for reproducible builds; otherwise the
//! current UTC time is used.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

fn stamp() -> String {
    let at = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    at.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_string())
}

fn main() {
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let backends = if std::env::var_os("CARGO_FEATURE_GPU").is_some() { "host,wgpu" } else { "host" };

    println!("cargo:rustc-env=RTACCEL_BUILD_STAMP={}", stamp());
    println!("cargo:rustc-env=RTACCEL_BUILD_PROFILE={profile}");
    println!("cargo:rustc-env=RTACCEL_BACKENDS={backends}");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=build.rs");
}
