pub mod archives;
pub mod evals;
pub mod expire;
pub mod schedules;
pub mod superuser;

use perpetua_storage::{Database, PgStores, SecretCipher};

/// Connect to the database from DATABASE_URL. Commands requiring storage
/// exit with code 2 when it is missing.
pub async fn connect() -> anyhow::Result<Result<PgStores, i32>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is required for this command");
        return Ok(Err(crate::EXIT_INVALID_ARGUMENT));
    };
    let db = Database::from_url(&url).await?;
    let cipher = SecretCipher::from_env().ok();
    Ok(Ok(PgStores::new(db, cipher)))
}
