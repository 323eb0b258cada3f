//! Generates the CSI gRPC server stubs from `proto/csi.proto`.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // SAFETY: build scripts are single-threaded.
    unsafe {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let proto = PathBuf::from("proto/csi.proto");
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(
            &[proto],
            &[PathBuf::from("proto"), protoc_bin_vendored::include_path()?],
        )?;

    println!("cargo:rerun-if-changed=proto/csi.proto");
    Ok(())
}
