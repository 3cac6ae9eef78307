pub mod config;
pub mod database;
pub mod lock_repository;
pub mod page_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use lock_repository::PgLockStore;
pub use page_repository::PgPageStore;
