//! Account rows. Passwords are bcrypt-hashed; new passwords must clear the
//! zxcvbn strength gate (score >= 1).

use super::Store;
use chrono::{DateTime, Utc};
use quepasa_core::error::QpError;

/// One persisted account.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl Store {
    pub async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, QpError> {
        let row: Option<(String, String, DateTime<Utc>)> =
            sqlx::query_as("SELECT username, password, timestamp FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| QpError::Store(format!("query failed: {e}")))?;

        Ok(row.map(|(username, password_hash, timestamp)| UserRecord {
            username,
            password_hash,
            timestamp,
        }))
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool, QpError> {
        Ok(self.find_user(username).await?.is_some())
    }

    /// Create an account. Rejects weak passwords and duplicate usernames.
    pub async fn create_user(&self, username: &str, password: &str) -> Result<(), QpError> {
        let username = username.trim().to_ascii_lowercase();
        if username.is_empty() {
            return Err(QpError::Input("username is required".to_string()));
        }
        if self.user_exists(&username).await? {
            return Err(QpError::Input(format!("user {username} already exists")));
        }

        check_password_strength(password, &username)?;

        let hashed = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| QpError::Internal(format!("bcrypt hash failed: {e}")))?;

        sqlx::query("INSERT INTO users (username, password, timestamp) VALUES (?, ?, ?)")
            .bind(&username)
            .bind(&hashed)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| QpError::Store(format!("insert user failed: {e}")))?;

        Ok(())
    }

    pub async fn update_password(&self, username: &str, password: &str) -> Result<(), QpError> {
        check_password_strength(password, username)?;

        let hashed = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| QpError::Internal(format!("bcrypt hash failed: {e}")))?;

        let result = sqlx::query("UPDATE users SET password = ? WHERE username = ?")
            .bind(&hashed)
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(|e| QpError::Store(format!("update user failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(QpError::NotFound(format!("user {username}")));
        }
        Ok(())
    }

    /// Verify credentials; the error never reveals whether the account
    /// exists.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserRecord, QpError> {
        let user = self
            .find_user(&username.trim().to_ascii_lowercase())
            .await?
            .ok_or_else(|| QpError::Auth("invalid credentials".to_string()))?;

        let ok = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| QpError::Internal(format!("bcrypt verify failed: {e}")))?;
        if !ok {
            return Err(QpError::Auth("invalid credentials".to_string()));
        }
        Ok(user)
    }
}

fn check_password_strength(password: &str, username: &str) -> Result<(), QpError> {
    if password.is_empty() {
        return Err(QpError::Input("password is required".to_string()));
    }
    let entropy = zxcvbn::zxcvbn(password, &[username]);
    if entropy.score() < zxcvbn::Score::One {
        return Err(QpError::Input("password is too weak".to_string()));
    }
    Ok(())
}
