//! Build script for iptsync
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! used by `iptsync --version`.

fn main() {
    // Re-run build if the packager overrides the default binaries
    println!("cargo:rerun-if-env-changed=IPTSYNC_IPTABLES");
    println!("cargo:rerun-if-env-changed=IPTSYNC_IPTABLES_SAVE");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
