fn main() {
    // The arch primitives and the pagemap-based translator are x86-64/Linux
    // specific (spec.md §1 non-goals exclude portability); fail at compile
    // time with a clear message rather than producing a crate that builds
    // but traps or mistranslates at runtime.
    let arch_ok = std::env::var("CARGO_CFG_TARGET_ARCH").as_deref() == Ok("x86_64");
    let os_ok = std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("linux");
    if !(arch_ok && os_ok) {
        panic!(
            "cache-prime-probe only supports target_arch=\"x86_64\", target_os=\"linux\"; \
             refusing to build for any other target"
        );
    }
}
