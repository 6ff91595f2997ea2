//! Storage row types.

/// Account row in the `users` table.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    /// Unix seconds.
    pub created_at: i64,
}
