fn main() {
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }

    let stamp = chrono::Utc::now().format("%b %e %Y %H:%M:%S");
    println!("cargo:rustc-env=MULTITOOL_BUILD_DATE={stamp}");
    println!("cargo:rerun-if-changed=build.rs");
}
