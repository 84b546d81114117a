//! Build script that compiles the gRPC proto definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile(
        &["proto/brain.proto", "proto/soul.proto"],
        &["proto"],
    )?;

    Ok(())
}
