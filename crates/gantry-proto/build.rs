//! Build script for gantry-proto
//!
//! Compiles protobuf definitions using tonic-build.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let proto_root = "proto";

    let protos = [
        "gantry/v1/common.proto",
        "gantry/v1/device_session.proto",
        "gantry/v1/as.proto",
    ];

    let proto_paths: Vec<_> = protos
        .iter()
        .map(|p| format!("{}/{}", proto_root, p))
        .collect();

    // Map fields use BTreeMap so that encoding a device-session is
    // deterministic for a given input.
    let mut config = prost_build::Config::new();
    config.btree_map(["."]);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos_with_config(config, &proto_paths, &[proto_root.to_string()])?;

    Ok(())
}
