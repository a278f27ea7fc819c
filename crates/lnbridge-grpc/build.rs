fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true) // Useful for testing
        .compile_protos(&["proto/bridge.proto"], &["proto/"])?;

    // Only the wallet unlocker messages are needed; calls go through the raw codec.
    tonic_build::configure()
        .build_server(false)
        .build_client(false)
        .compile_protos(&["proto/walletunlocker.proto"], &["proto/"])?;
    Ok(())
}
