fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so the build does not depend on a system install.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    println!("cargo:rerun-if-changed=proto/csi.proto");
    tonic_build::configure()
        .build_client(false)
        .compile(&["proto/csi.proto"], &["proto"])?;
    Ok(())
}
