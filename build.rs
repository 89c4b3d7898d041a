fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }

    println!("cargo:rerun-if-changed=proto/statehost/protocol/component.proto");
    println!("cargo:rerun-if-changed=proto/statehost/protocol/discovery.proto");
    println!("cargo:rerun-if-changed=proto/statehost/protocol/value_entity.proto");
    println!("cargo:rerun-if-changed=proto/statehost/protocol/event_sourced.proto");
    println!("cargo:rerun-if-changed=proto/statehost/protocol/replicated_entity.proto");
    println!("cargo:rerun-if-changed=proto/statehost/protocol/action.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/statehost/protocol/component.proto",
                "proto/statehost/protocol/discovery.proto",
                "proto/statehost/protocol/value_entity.proto",
                "proto/statehost/protocol/event_sourced.proto",
                "proto/statehost/protocol/replicated_entity.proto",
                "proto/statehost/protocol/action.proto",
            ],
            &["proto"],
        )?;
    Ok(())
}
