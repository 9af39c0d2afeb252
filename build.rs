fn main() {
    if !(cfg!(target_os = "linux") && cfg!(target_env = "gnu")) {
        panic!(
            "{} only works on linux with glibc (it interposes __libc_malloc and friends)",
            env!("CARGO_PKG_NAME")
        );
    }

    if std::env::var_os("CARGO_FEATURE_FAST_UNWIND").is_some() {
        let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
        if !matches!(arch.as_str(), "x86" | "x86_64" | "arm") {
            panic!("the fast-unwind feature digs stack frames by hand and knows only x86, x86_64 and arm");
        }
    }

    // Interposed allocator symbols and barf() must stay visible to the
    // dynamic linker even when linked statically into a binary.
    println!("cargo:rustc-link-arg=-Wl,--export-dynamic");
}
