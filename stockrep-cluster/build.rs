fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so builds do not depend on a system install.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    println!("cargo:rerun-if-changed=proto/replica.proto");
    tonic_build::compile_protos("proto/replica.proto")?;
    Ok(())
}
