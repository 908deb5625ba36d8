//! Social account persistence
//!
//! [`AccountRepository`] stores a team's platform connections in
//! `social_accounts` and their token material in `social_tokens`. Tokens are
//! sealed by the [`Vault`] before they are written and only ever opened
//! inside [`AccountRepository::with_credentials`], for the duration of the
//! caller's future.

use std::future::Future;
use std::sync::Arc;

use sqlx::Row;
use uuid::Uuid;

use crate::db::{parse_column, Database};
use crate::error::{AccountError, DbError, Result};
use crate::types::{AccountStatus, Credentials, Platform, SocialAccount, Token};
use crate::vault::Vault;

const ACCOUNT_SELECT: &str = r#"
    SELECT a.id, a.team_id, a.platform, a.platform_user_id, a.handle, a.status,
           a.rate_limited_until, a.connected_at, a.last_synced_at, a.deleted_at,
           t.expires_at AS token_expires_at, COALESCE(t.version, 0) AS token_version
    FROM social_accounts a
    LEFT JOIN social_tokens t ON t.account_id = a.id
"#;

#[derive(Clone)]
pub struct AccountRepository {
    db: Database,
    vault: Arc<Vault>,
}

impl AccountRepository {
    pub fn new(db: Database, vault: Arc<Vault>) -> Self {
        Self { db, vault }
    }

    /// Persist the result of a successful code exchange.
    ///
    /// If the team already has a live connection to the same platform
    /// identity, its tokens are replaced and it is reactivated instead of
    /// creating a second account.
    pub async fn connect(
        &self,
        team_id: &str,
        platform: Platform,
        token: &Token,
    ) -> Result<SocialAccount> {
        let now = chrono::Utc::now().timestamp();
        let access = self.vault.encrypt_secret(&token.access_token)?;
        let refresh = token
            .refresh_token
            .as_ref()
            .map(|r| self.vault.encrypt_secret(r))
            .transpose()?;

        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        // Writing first takes the write lock for the whole transaction.
        let existing: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE social_accounts
            SET handle = COALESCE(?, handle), status = 'active', rate_limited_until = NULL,
                last_synced_at = ?
            WHERE team_id = ? AND platform = ? AND platform_user_id = ? AND deleted_at IS NULL
            RETURNING id
            "#,
        )
        .bind(&token.handle)
        .bind(now)
        .bind(team_id)
        .bind(platform.as_str())
        .bind(&token.platform_user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let account_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO social_accounts
                        (id, team_id, platform, platform_user_id, handle, status, connected_at, last_synced_at)
                    VALUES (?, ?, ?, ?, ?, 'active', ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(team_id)
                .bind(platform.as_str())
                .bind(&token.platform_user_id)
                .bind(&token.handle)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;
                id
            }
        };

        sqlx::query(
            r#"
            INSERT INTO social_tokens (account_id, access_token, refresh_token, expires_at, version, updated_at)
            VALUES (?, ?, ?, ?, 1, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                version = social_tokens.version + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account_id)
        .bind(&access)
        .bind(&refresh)
        .bind(token.expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        tracing::info!(
            account_id = %account_id,
            team_id = %team_id,
            platform = %platform,
            "Connected social account"
        );

        self.find_by_id(&account_id)
            .await?
            .ok_or_else(|| AccountError::NotFound(account_id).into())
    }

    /// Look up an account by id, including disconnected ones
    pub async fn find_by_id(&self, account_id: &str) -> Result<Option<SocialAccount>> {
        let row = sqlx::query(&format!("{} WHERE a.id = ?", ACCOUNT_SELECT))
            .bind(account_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| account_from_row(&r)).transpose()
    }

    /// All live accounts of a team
    pub async fn find_by_team_id(&self, team_id: &str) -> Result<Vec<SocialAccount>> {
        let rows = sqlx::query(&format!(
            "{} WHERE a.team_id = ? AND a.deleted_at IS NULL ORDER BY a.platform, a.connected_at",
            ACCOUNT_SELECT
        ))
        .bind(team_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(account_from_row).collect()
    }

    /// The account a team publishes to `platform` with: its most recently
    /// connected live account for that platform
    pub async fn find_for_publish(
        &self,
        team_id: &str,
        platform: Platform,
    ) -> Result<Option<SocialAccount>> {
        let row = sqlx::query(&format!(
            r#"{} WHERE a.team_id = ? AND a.platform = ? AND a.deleted_at IS NULL
               ORDER BY a.connected_at DESC, a.id DESC LIMIT 1"#,
            ACCOUNT_SELECT
        ))
        .bind(team_id)
        .bind(platform.as_str())
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| account_from_row(&r)).transpose()
    }

    /// Live, refreshable accounts whose access token expires before
    /// `now + window_secs`
    pub async fn find_expiring_within(&self, now: i64, window_secs: i64) -> Result<Vec<SocialAccount>> {
        let rows = sqlx::query(&format!(
            r#"{} WHERE a.deleted_at IS NULL
                 AND a.status IN ('active', 'rate_limited')
                 AND t.refresh_token IS NOT NULL
                 AND t.expires_at IS NOT NULL
                 AND t.expires_at <= ?
               ORDER BY t.expires_at ASC"#,
            ACCOUNT_SELECT
        ))
        .bind(now + window_secs)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(account_from_row).collect()
    }

    /// Run `f` with the account's decrypted credentials.
    ///
    /// The credentials are moved into `f` and dropped (zeroized) when its
    /// future completes.
    pub async fn with_credentials<F, Fut, T>(&self, account: &SocialAccount, f: F) -> Result<T>
    where
        F: FnOnce(Credentials) -> Fut,
        Fut: Future<Output = T>,
    {
        let row = sqlx::query(
            r#"
            SELECT t.access_token, t.refresh_token, t.expires_at
            FROM social_tokens t
            JOIN social_accounts a ON a.id = t.account_id
            WHERE t.account_id = ? AND a.deleted_at IS NULL
            "#,
        )
        .bind(&account.id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?
        .ok_or_else(|| AccountError::Disconnected(account.id.clone()))?;

        let access: Vec<u8> = row.get("access_token");
        let refresh: Option<Vec<u8>> = row.get("refresh_token");

        let credentials = Credentials {
            access_token: self.vault.decrypt_secret(&access)?,
            refresh_token: refresh.map(|r| self.vault.decrypt_secret(&r)).transpose()?,
            expires_at: row.get("expires_at"),
            platform_user_id: account.platform_user_id.clone(),
        };

        Ok(f(credentials).await)
    }

    /// Store a refreshed token and the account status.
    ///
    /// Applies only if the stored token is still at `account.token_version`.
    /// Returns `Ok(false)` when another writer got there first; the caller
    /// should reload the account. A token without a refresh token keeps the
    /// stored one.
    pub async fn update(
        &self,
        account: &SocialAccount,
        token: &Token,
        status: AccountStatus,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let access = self.vault.encrypt_secret(&token.access_token)?;
        let refresh = token
            .refresh_token
            .as_ref()
            .map(|r| self.vault.encrypt_secret(r))
            .transpose()?;

        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE social_tokens
            SET access_token = ?, refresh_token = COALESCE(?, refresh_token), expires_at = ?,
                version = version + 1, updated_at = ?
            WHERE account_id = ? AND version = ?
            "#,
        )
        .bind(&access)
        .bind(&refresh)
        .bind(token.expires_at)
        .bind(now)
        .bind(&account.id)
        .bind(account.token_version)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            tracing::debug!(account_id = %account.id, "Token update lost to a concurrent writer");
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE social_accounts
            SET status = ?, rate_limited_until = NULL, last_synced_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(&account.id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Move an account from `expected` to `status`.
    ///
    /// `rate_limited_until` is stored as given (pass `None` when leaving
    /// `rate_limited`). Returns false when the account was not in
    /// `expected`.
    pub async fn set_status(
        &self,
        account_id: &str,
        expected: AccountStatus,
        status: AccountStatus,
        rate_limited_until: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE social_accounts SET status = ?, rate_limited_until = ?
            WHERE id = ? AND status = ? AND deleted_at IS NULL
            "#,
        )
        .bind(status.as_str())
        .bind(rate_limited_until)
        .bind(account_id)
        .bind(expected.as_str())
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let changed = result.rows_affected() == 1;
        if changed {
            tracing::info!(
                account_id = %account_id,
                from = expected.as_str(),
                to = status.as_str(),
                "Account status changed"
            );
        }
        Ok(changed)
    }

    /// Record a successful platform interaction
    pub async fn touch_synced(&self, account_id: &str, now: i64) -> Result<()> {
        sqlx::query("UPDATE social_accounts SET last_synced_at = ? WHERE id = ?")
            .bind(now)
            .bind(account_id)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Soft-delete the account and drop its tokens
    pub async fn disconnect(&self, account_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            "UPDATE social_accounts SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM social_tokens WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        tracing::info!(account_id = %account_id, "Disconnected social account");
        Ok(true)
    }
}

fn account_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<SocialAccount> {
    Ok(SocialAccount {
        id: r.get("id"),
        team_id: r.get("team_id"),
        platform: parse_column("social_accounts.platform", r.get("platform"))?,
        platform_user_id: r.get("platform_user_id"),
        handle: r.get("handle"),
        status: parse_column("social_accounts.status", r.get("status"))?,
        rate_limited_until: r.get("rate_limited_until"),
        connected_at: r.get("connected_at"),
        last_synced_at: r.get("last_synced_at"),
        deleted_at: r.get("deleted_at"),
        token_expires_at: r.get("token_expires_at"),
        token_version: r.get("token_version"),
    })
}
