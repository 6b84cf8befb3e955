fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_file = "../../proto/control.proto";
    let proto_dir = "../../proto";

    // Rerun if proto file changes
    println!("cargo:rerun-if-changed={}", proto_file);

    // Fall back to the vendored protoc so the build works on hosts without one.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_file], &[proto_dir])?;

    Ok(())
}
