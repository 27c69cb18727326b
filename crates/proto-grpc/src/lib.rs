#[cfg(any(feature = "replica_client", feature = "replica_server"))]
pub mod replica;
