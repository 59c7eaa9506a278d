use std::path::{Path, PathBuf};

use pb_rs::{ConfigBuilder, types::FileDescriptor};
use walkdir::WalkDir;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?).join("proto");
    let in_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR")?).join("proto");

    println!("cargo:rerun-if-changed={}", in_dir.display());

    let proto_ext = Some(Path::new("proto").as_os_str());
    let mut protos = Vec::new();
    for entry in WalkDir::new(&in_dir) {
        let path = entry?.into_path();
        if path.extension() == proto_ext {
            println!("cargo:rerun-if-changed={}", path.display());
            protos.push(path);
        }
    }

    if out_dir.exists() {
        std::fs::remove_dir_all(&out_dir)?;
    }
    std::fs::DirBuilder::new().create(&out_dir)?;

    let config_builder = ConfigBuilder::new(&protos, None, Some(&out_dir), &[in_dir])
        .map_err(|e| format!("invalid protobuf configuration: {e:?}"))?
        .dont_use_cow(true);
    FileDescriptor::run(&config_builder.build())
        .map_err(|e| format!("protobuf generation failed: {e:?}"))?;

    Ok(())
}
