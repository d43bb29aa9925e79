//! Build script for portsync
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `portsync --version`.

fn main() {
    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
