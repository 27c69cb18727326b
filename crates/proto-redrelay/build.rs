// Regenerates src/replica.rs from proto/replica.proto when built with
// --features generate. The generated file is committed, so a default build
// has no build-time protobuf dependency.
fn main() {
    #[cfg(feature = "generate")]
    {
        let mut config = prost_build::Config::new();
        config.out_dir("src");
        config.bytes(["."]);
        config
            .compile_protos(&["proto/replica.proto"], &["proto"])
            .expect("failed to compile replica.proto");
    }
}
