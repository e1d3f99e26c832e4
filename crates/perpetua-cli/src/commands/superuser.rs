// create-initial-superuser: first-run helper, idempotent.

use clap::Args;

use crate::{EXIT_INVALID_ARGUMENT, EXIT_OK};

#[derive(Args)]
pub struct SuperuserArgs {
    /// Superuser email; falls back to PERPETUA_SUPERUSER_EMAIL
    #[arg(long)]
    pub email: Option<String>,
}

pub async fn run(args: SuperuserArgs) -> anyhow::Result<i32> {
    let Some(email) = args
        .email
        .or_else(|| std::env::var("PERPETUA_SUPERUSER_EMAIL").ok())
        .filter(|e| e.contains('@'))
    else {
        eprintln!("an email is required (--email or PERPETUA_SUPERUSER_EMAIL)");
        return Ok(EXIT_INVALID_ARGUMENT);
    };

    let stores = match super::connect().await? {
        Ok(stores) => stores,
        Err(code) => return Ok(code),
    };

    let created = stores.database().ensure_superuser(&email).await?;
    if created {
        println!("superuser {email} created");
    } else {
        println!("superuser {email} already exists; nothing to do");
    }
    Ok(EXIT_OK)
}
