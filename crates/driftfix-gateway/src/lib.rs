pub mod api;
pub mod router;
pub mod server;
pub mod state;

pub use server::GatewayServer;
pub use state::{
    AppState, SharedState, build_runner, companion_version, nonce_issuer, open_database,
    open_database_readonly,
};
