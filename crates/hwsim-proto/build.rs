use std::io::{Error, ErrorKind, Result};

fn main() -> Result<()> {
    // Re-run if proto changes
    println!("cargo:rerun-if-changed=proto/hwsim_v1.proto");
    println!("cargo:rerun-if-env-changed=PROTOC");

    let mut config = prost_build::Config::new();

    // A protoc on the host wins; otherwise use the bundled binary
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()
            .map_err(|e| Error::new(ErrorKind::NotFound, e.to_string()))?;
        config.protoc_executable(protoc);
    }

    // Enable proto3 optional fields
    config.protoc_arg("--experimental_allow_proto3_optional");

    // Add serde derives when the serde feature is enabled
    if std::env::var_os("CARGO_FEATURE_SERDE").is_some() {
        config.type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]");
    }

    config.compile_protos(&["proto/hwsim_v1.proto"], &["proto"])?;

    Ok(())
}
