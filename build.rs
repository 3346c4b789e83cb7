/// Build flow:
///
/// 1. Without the `verbs` feature, nothing is linked: only the software
///    transport provider is compiled.
/// 2. Otherwise, find `libibverbs` through `pkg-config` and generate bindings
///    for `src/bindings/verbs.h`.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "verbs")]
    verbs::link_and_generate();
}

#[cfg(feature = "verbs")]
mod verbs {
    use std::env;
    use std::path::Path;

    pub(super) fn link_and_generate() {
        // Refuse to compile on non-64-bit platforms.
        if cfg!(not(target_pointer_width = "64")) {
            panic!("the `verbs` provider currently only supports 64-bit platforms");
        }

        println!("cargo:rerun-if-changed=src/bindings/verbs.h");
        println!("cargo:rerun-if-env-changed=IBVERBS_INCLUDE_DIR");

        // rdma-core registers `libibverbs` to `pkg-config`, and `probe` also
        // emits the link directives.
        let lib = pkg_config::Config::new()
            .atleast_version("1.8.28")
            .statik(false)
            .probe("libibverbs")
            .unwrap_or_else(|e| panic!("cannot find libibverbs: {e}"));

        let mut include_dirs = lib
            .include_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>();
        if let Ok(dir) = env::var("IBVERBS_INCLUDE_DIR") {
            include_dirs.push(dir);
        }
        gen_verb_bindings(include_dirs);
    }

    fn gen_verb_bindings(include_dirs: Vec<String>) {
        let include_args = include_dirs.iter().map(|p| format!("-I{}", p));
        let bindings = bindgen::builder()
            .clang_args(include_args)
            .header("src/bindings/verbs.h")
            .allowlist_function("ibv_.*")
            .allowlist_type("ibv_.*")
            .allowlist_type("verbs_.*")
            .allowlist_type("_compat_ibv_port_attr")
            .opaque_type("pthread_.*")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_qp_attr_mask")
            .bitfield_enum("ibv_send_flags")
            .bitfield_enum("ibv_wc_flags")
            .constified_enum_module("ibv_mtu")
            .constified_enum_module("ibv_port_state")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_qp_state")
            .constified_enum_module("ibv_wr_opcode")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(false)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
        let dest = Path::new(&out_dir).join("verbs_bindings.rs");
        bindings
            .write_to_file(dest)
            .expect("failed to write bindings");
    }
}
