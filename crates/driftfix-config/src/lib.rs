pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AdminConfig, AppConfig, DatabaseConfig, GatewayConfig, GeocoderConfig, LogFormat,
    MigrateConfig, SecurityConfig,
};
