pub mod cache;
pub mod database;
pub mod models;
pub mod object_store;

pub use database::Database;
pub use object_store::ObjectStore;
