use std::sync::Arc;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::config::EnvAccount;
use crate::db::models::IgAccountRow;
use crate::db::schema::ig_accounts;
use crate::db::{map_diesel_error, map_pool_error, DbPool, StoreError};

/// Identity every snapshot row and cache key is scoped by.
///
/// `page_id` is empty when the account has no linked page; the empty string still takes part in
/// the conflict key so rows never collide across accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Account {
    pub account_id: String,
    pub platform_user_id: String,
    pub page_id: String,
    pub owner_user_id: String,
}

impl Account {
    pub fn from_env(env: &EnvAccount) -> Self {
        Self {
            account_id: format!("env:{}", env.ig_user_id),
            platform_user_id: env.ig_user_id.clone(),
            page_id: env.page_id.clone(),
            owner_user_id: env.owner_user_id.clone(),
        }
    }

    pub fn page_id(&self) -> Option<&str> {
        Some(self.page_id.as_str()).filter(|page| !page.is_empty())
    }
}

impl From<IgAccountRow> for Account {
    fn from(row: IgAccountRow) -> Self {
        Self {
            account_id: row.id,
            platform_user_id: row.ig_user_id,
            page_id: row.page_id.unwrap_or_default(),
            owner_user_id: row.owner_user_id,
        }
    }
}

/// Resolves the active account for a caller. Owned by the session layer; read-only here.
pub trait AccountDirectory: Send + Sync {
    /// `ig_account_id` matches either the directory id or the platform user id. Without it,
    /// the owner's most recently updated account is returned.
    fn resolve<'a>(
        &'a self,
        owner_user_id: &'a str,
        ig_account_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<Account>, StoreError>>;
}

impl<T> AccountDirectory for Arc<T>
where
    T: AccountDirectory + ?Sized,
{
    fn resolve<'a>(
        &'a self,
        owner_user_id: &'a str,
        ig_account_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<Account>, StoreError>> {
        (**self).resolve(owner_user_id, ig_account_id)
    }
}

pub struct PgAccountDirectory {
    pool: DbPool,
}

impl PgAccountDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl AccountDirectory for PgAccountDirectory {
    fn resolve<'a>(
        &'a self,
        owner_user_id: &'a str,
        ig_account_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<Account>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;

            let mut query = ig_accounts::table
                .filter(ig_accounts::owner_user_id.eq(owner_user_id))
                .select(IgAccountRow::as_select())
                .order((ig_accounts::updated_at.desc(), ig_accounts::id.desc()))
                .into_boxed();
            if let Some(wanted) = ig_account_id {
                query = query.filter(
                    ig_accounts::id
                        .eq(wanted)
                        .or(ig_accounts::ig_user_id.eq(wanted)),
                );
            }

            let row = query
                .first::<IgAccountRow>(&mut conn)
                .await
                .optional()
                .map_err(map_diesel_error)?;
            Ok(row.map(Account::from))
        })
    }
}

/// Directory with a single fixed account, used by the env and cron credential modes.
pub struct StaticAccountDirectory {
    account: Account,
}

impl StaticAccountDirectory {
    pub fn new(account: Account) -> Self {
        Self { account }
    }
}

impl AccountDirectory for StaticAccountDirectory {
    fn resolve<'a>(
        &'a self,
        _owner_user_id: &'a str,
        ig_account_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<Account>, StoreError>> {
        Box::pin(async move {
            let matches = ig_account_id.map_or(true, |wanted| {
                wanted == self.account.account_id || wanted == self.account.platform_user_id
            });
            Ok(matches.then(|| self.account.clone()))
        })
    }
}
