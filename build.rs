fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Propagate ESP-IDF link arguments only when building for the target.
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
