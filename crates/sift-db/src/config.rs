use sift_core::StageError;

const DEFAULT_POOL_SIZE: u32 = 5;

/// Connection settings for the page and lock stores.
///
/// `DATABASE_URL` holds the PostgreSQL connection string (the name sqlx and
/// dotenvy tooling expect); the pool size comes from `SIFT_DB_MAX_CONNECTIONS`
/// like the rest of the `SIFT_*` knobs.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, StageError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            StageError::ConfigError(
                "DATABASE_URL is not set; sift needs a PostgreSQL connection string".into(),
            )
        })?;
        let max_connections = pool_size(std::env::var("SIFT_DB_MAX_CONNECTIONS").ok())?;

        Ok(Self {
            url,
            max_connections,
        })
    }
}

fn pool_size(raw: Option<String>) -> Result<u32, StageError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_POOL_SIZE);
    };
    match raw.trim().parse::<u32>() {
        Ok(0) | Err(_) => Err(StageError::ConfigError(format!(
            "SIFT_DB_MAX_CONNECTIONS: expected a pool size of at least 1, got {raw:?}"
        ))),
        Ok(n) => Ok(n),
    }
}
