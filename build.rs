fn main() {
    // ── macOS: Bluetooth permission ───────────────────────────────────────────
    //
    // CoreBluetooth will not scan for a bare command-line binary unless the
    // executable carries an Info.plist with NSBluetoothAlwaysUsageDescription.
    // Linking it into the __TEXT,__info_plist section is enough; no app bundle
    // is required.
    //
    // CARGO_CFG_TARGET_OS is the target OS, so cross builds pick this up too.
    println!("cargo:rerun-if-changed=build.rs");
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }

    let dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by Cargo");
    let plist = std::path::Path::new(&dir).join("Info.plist");

    // ld … -sectcreate __TEXT __info_plist <plist>
    for arg in ["-sectcreate", "__TEXT", "__info_plist"] {
        println!("cargo:rustc-link-arg={arg}");
    }
    println!("cargo:rustc-link-arg={}", plist.display());
    println!("cargo:rerun-if-changed=Info.plist");
}
