use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_prost_build::configure()
        .file_descriptor_set_path(out_dir.join("tollgate_descriptor.bin"))
        .build_server(true)
        .build_client(false)
        .compile_protos(&["proto/tollgate/v1/tollgate.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/tollgate/v1/tollgate.proto");
    Ok(())
}
