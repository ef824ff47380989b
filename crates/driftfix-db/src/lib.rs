pub mod database;
pub mod schema;
pub mod site_store;

pub use database::{SiteDatabase, StoreOptions};
pub use site_store::SiteStore;
