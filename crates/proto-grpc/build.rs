// Regenerates src/replica.rs from the proto-redrelay schema when built with
// --features generate. Message types are mapped onto the proto-redrelay
// crate; only service stubs are emitted here. The output is committed.
fn main() {
    #[cfg(feature = "generate")]
    {
        tonic_build::configure()
            .build_client(true)
            .build_server(true)
            .emit_rerun_if_changed(false)
            .extern_path(".replica", "::proto_redrelay::replica")
            .client_mod_attribute("replica", "#[cfg(feature = \"replica_client\")]")
            .server_mod_attribute("replica", "#[cfg(feature = \"replica_server\")]")
            .out_dir("src")
            .compile_protos(
                &["../proto-redrelay/proto/replica.proto"],
                &["../proto-redrelay/proto"],
            )
            .expect("failed to compile replica.proto");
    }
}
