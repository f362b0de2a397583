use std::env;

fn main() {
    // `cfg(target_arch)` in a build script describes the host, so ask cargo
    // about the target instead.
    let registers_file = match env::var("CARGO_CFG_TARGET_ARCH").as_deref() {
        Ok("x86_64") => "src/registers/x86_64.S",
        Ok("aarch64") => "src/registers/aarch64.S",
        Ok(arch) => panic!("unsupported target architecture: {}", arch),
        Err(err) => panic!("CARGO_CFG_TARGET_ARCH is not set: {}", err),
    };
    println!("cargo:rerun-if-changed={}", registers_file);
    cc::Build::new().file(registers_file).compile("registers");
}
