// Database connection and pool management
// SQLite through sqlx; schema is created in place by `migrate`

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub struct DatabaseConnection {
    pool: SqlitePool,
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, crate::infrastructure::config::defaults::DB_MAX_CONNECTIONS).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let memory = is_memory_url(database_url);

        if !memory {
            // Create database file directory if it doesn't exist
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            let db_path = db_path.split('?').next().unwrap_or(db_path);
            if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {:?}", parent))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url: {}", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        // 메모리 DB는 커넥션마다 별도 DB가 되므로 하나만 유지
        let pool_options = if memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to {}", database_url))?;

        debug!("🗄️ Database pool ready (memory: {})", memory);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("🗄️ Database pool closed");
    }

    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS capability_pools (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                capacity INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                remote_code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                parent_code TEXT,
                sort_order INTEGER,
                role_id INTEGER,
                default_pool_id INTEGER,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_grants (
                group_id INTEGER NOT NULL,
                pool_id INTEGER NOT NULL,
                initial_grant INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (group_id, pool_id),
                FOREIGN KEY (group_id) REFERENCES groups (id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                group_id INTEGER NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                email TEXT,
                position TEXT,
                is_external BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_grants (
                user_id INTEGER NOT NULL,
                pool_id INTEGER NOT NULL,
                granted_total INTEGER NOT NULL DEFAULT 0,
                remaining INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, pool_id),
                FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS role_assignments (
                user_id INTEGER NOT NULL,
                role_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, role_id),
                FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS institutions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level INTEGER NOT NULL,
                remote_id TEXT NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                region TEXT,
                attachments TEXT NOT NULL DEFAULT '[]',
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (level, remote_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS attachment_tombstones (
                level INTEGER NOT NULL,
                remote_id TEXT NOT NULL,
                file TEXT NOT NULL,
                removed_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (level, remote_id, file)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_users_group_id ON users (group_id)",
            "CREATE INDEX IF NOT EXISTS idx_users_username ON users (username)",
            "CREATE INDEX IF NOT EXISTS idx_user_grants_pool_id ON user_grants (pool_id)",
            "CREATE INDEX IF NOT EXISTS idx_institutions_level ON institutions (level)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        info!("✅ Database schema ready");
        Ok(())
    }
}
