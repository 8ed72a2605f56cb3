use crate::api::error::AppError;
use crate::entities::{prelude::*, users};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};

/// Per-owner bytes-used ledger. Adjustments are single UPDATE statements
/// with column expressions so concurrent uploads never read-modify-write
/// a stale counter.
pub struct QuotaService;

impl QuotaService {
    /// True when the user exists and has at least `bytes` of headroom.
    /// A quota of 0 means unlimited.
    pub async fn has_storage_available<C: ConnectionTrait>(
        db: &C,
        user_id: &str,
        bytes: i64,
    ) -> Result<bool, AppError> {
        let user = Users::find_by_id(user_id)
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        if user.storage_quota == 0 {
            return Ok(true);
        }
        Ok(user.storage_used + bytes <= user.storage_quota)
    }

    /// Applies a signed byte delta to the user's usage counter.
    pub async fn update_storage_used<C: ConnectionTrait>(
        db: &C,
        user_id: &str,
        delta: i64,
    ) -> Result<(), AppError> {
        Users::update_many()
            .col_expr(
                users::Column::StorageUsed,
                Expr::col(users::Column::StorageUsed).add(delta),
            )
            .filter(users::Column::Id.eq(user_id))
            .exec(db)
            .await?;
        Ok(())
    }

    /// Moves `bytes` of accounted usage from one owner to another, used
    /// by ownership reassignment. Caller supplies the transaction.
    pub async fn transfer<C: ConnectionTrait>(
        db: &C,
        from_user_id: Option<&str>,
        to_user_id: &str,
        bytes: i64,
    ) -> Result<(), AppError> {
        if let Some(from) = from_user_id {
            Self::update_storage_used(db, from, -bytes).await?;
        }
        Self::update_storage_used(db, to_user_id, bytes).await?;
        Ok(())
    }
}
