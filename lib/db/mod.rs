pub mod error;
pub mod models;
pub mod schema;

pub use error::{map_diesel_error, map_pool_error, StoreError};

use diesel_async::{
    pg::AsyncPgConnection,
    pooled_connection::{
        deadpool::{BuildError, Pool},
        AsyncDieselConnectionManager,
    },
};

pub type DbPool = Pool<AsyncPgConnection>;

pub async fn build_db_pool(db_url: &str) -> Result<DbPool, BuildError> {
    let pool_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    let pool = Pool::builder(pool_config).build()?;

    Ok(pool)
}
