//! Stamps the target triple and build profile for `carlink version --extended`.

const STAMPS: [(&str, &str); 2] = [
    ("TARGET", "CARLINK_BUILD_TARGET"),
    ("PROFILE", "CARLINK_BUILD_PROFILE"),
];

fn main() {
    for (source, stamp) in STAMPS {
        println!("cargo:rerun-if-env-changed={source}");
        if let Ok(value) = std::env::var(source) {
            println!("cargo:rustc-env={stamp}={value}");
        }
    }
}
