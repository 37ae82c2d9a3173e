use autocfg::AutoCfg;

fn main() {
    // The LazyLock wrapper needs std::sync::LazyLock (1.80), which is newer than our MSRV. Sniff
    // for it instead of gating on a feature.
    let ac = AutoCfg::new().unwrap();
    ac.emit_has_path("std::sync::LazyLock");

    autocfg::rerun_path("build.rs");
}
