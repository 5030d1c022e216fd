//! Build script for meshfw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `meshfw --version`.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
