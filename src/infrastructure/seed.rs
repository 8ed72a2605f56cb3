use crate::entities::{config_entries, prelude::*, users};
use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tracing::{info, warn};
use uuid::Uuid;

pub async fn seed_initial_data(db: &DatabaseConnection) -> anyhow::Result<()> {
    seed_policy_defaults(db).await?;
    seed_admin_user(db).await?;
    Ok(())
}

/// Writes the policy rows the admin UI edits, if they are not there yet.
/// Values match `PolicySettings::default()`.
async fn seed_policy_defaults(db: &DatabaseConnection) -> anyhow::Result<()> {
    let defaults = [
        ("max_file_size", (512 * 1024 * 1024i64).to_string()),
        ("default_max_share_days", "30".to_string()),
        ("default_max_downloads", String::new()),
        ("allowed_extensions", "*".to_string()),
    ];

    for (key, value) in defaults {
        let exists = ConfigEntries::find()
            .filter(config_entries::Column::Key.eq(key))
            .one(db)
            .await?;

        if exists.is_none() {
            let model = config_entries::ActiveModel {
                key: Set(key.to_string()),
                value: Set(value),
            };
            model.insert(db).await?;
        }
    }

    Ok(())
}

/// First-run bootstrap: create an admin account when the user table is
/// empty. The password comes from ADMIN_PASSWORD or is generated and
/// printed once.
async fn seed_admin_user(db: &DatabaseConnection) -> anyhow::Result<()> {
    if Users::find().one(db).await?.is_some() {
        return Ok(());
    }

    let password = match std::env::var("ADMIN_PASSWORD") {
        Ok(p) if !p.is_empty() => p,
        _ => {
            let generated = Uuid::new_v4().simple().to_string();
            warn!("🔑 Generated admin password: {}", generated);
            generated
        }
    };

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hashing admin password: {}", e))?
        .to_string();

    let admin = users::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        username: Set("admin".to_string()),
        email: Set(std::env::var("ADMIN_EMAIL").ok()),
        password_hash: Set(password_hash),
        is_admin: Set(true),
        storage_used: Set(0),
        storage_quota: Set(0),
        created_at: Set(Utc::now()),
    };
    admin.insert(db).await?;

    info!("🌱 Seeded initial admin account");
    Ok(())
}
