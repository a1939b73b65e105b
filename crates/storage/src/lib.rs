use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{OutboundTarget, RouteRule, RuleId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_rule(&self, rule: &RouteRule) -> Result<RuleId> {
        let rec = sqlx::query(
            "INSERT INTO route_rules (name, user_order, enabled, domains, ip, port, network, source, protocol, outbound, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&rule.name)
        .bind(rule.user_order)
        .bind(rule.enabled)
        .bind(&rule.domains)
        .bind(&rule.ip)
        .bind(&rule.port)
        .bind(&rule.network)
        .bind(&rule.source)
        .bind(&rule.protocol)
        .bind(rule.outbound.as_i64())
        .bind(rule.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(RuleId(rec.get::<i64, _>(0)))
    }

    /// Next free manual sort key; new rules go to the end of the listing.
    pub async fn next_user_order(&self) -> Result<i64> {
        let next: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(user_order), 0) + 1 FROM route_rules")
                .fetch_one(&self.pool)
                .await?;
        Ok(next)
    }

    pub async fn list_rules_ordered(&self) -> Result<Vec<RouteRule>> {
        let rows = sqlx::query(
            "SELECT id, name, user_order, enabled, domains, ip, port, network, source, protocol, outbound, created_at
             FROM route_rules
             ORDER BY user_order ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(rule_from_row).collect())
    }

    pub async fn get_rule(&self, id: RuleId) -> Result<Option<RouteRule>> {
        let row = sqlx::query(
            "SELECT id, name, user_order, enabled, domains, ip, port, network, source, protocol, outbound, created_at
             FROM route_rules
             WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(rule_from_row))
    }

    pub async fn update_rule(&self, rule: &RouteRule) -> Result<()> {
        sqlx::query(UPSERT_RULE_SQL)
            .bind(rule.id.0)
            .bind(&rule.name)
            .bind(rule.user_order)
            .bind(rule.enabled)
            .bind(&rule.domains)
            .bind(&rule.ip)
            .bind(&rule.port)
            .bind(&rule.network)
            .bind(&rule.source)
            .bind(&rule.protocol)
            .bind(rule.outbound.as_i64())
            .bind(rule.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes the whole batch in one transaction: either every row lands or
    /// none does. Reorder flushes rely on this to keep the key permutation
    /// consistent.
    pub async fn update_rules(&self, rules: &[RouteRule]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for rule in rules {
            sqlx::query(UPSERT_RULE_SQL)
                .bind(rule.id.0)
                .bind(&rule.name)
                .bind(rule.user_order)
                .bind(rule.enabled)
                .bind(&rule.domains)
                .bind(&rule.ip)
                .bind(&rule.port)
                .bind(&rule.network)
                .bind(&rule.source)
                .bind(&rule.protocol)
                .bind(rule.outbound.as_i64())
                .bind(rule.created_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_rules(&self, ids: &[RuleId]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let mut deleted = 0u64;
        for id in ids {
            deleted += sqlx::query("DELETE FROM route_rules WHERE id = ?")
                .bind(id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }

    pub async fn delete_all_rules(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM route_rules")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

const UPSERT_RULE_SQL: &str =
    "INSERT INTO route_rules (id, name, user_order, enabled, domains, ip, port, network, source, protocol, outbound, created_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(id) DO UPDATE SET
         name=excluded.name, user_order=excluded.user_order, enabled=excluded.enabled,
         domains=excluded.domains, ip=excluded.ip, port=excluded.port,
         network=excluded.network, source=excluded.source, protocol=excluded.protocol,
         outbound=excluded.outbound";

fn rule_from_row(r: SqliteRow) -> RouteRule {
    RouteRule {
        id: RuleId(r.get::<i64, _>(0)),
        name: r.get::<String, _>(1),
        user_order: r.get::<i64, _>(2),
        enabled: r.get::<bool, _>(3),
        domains: r.get::<String, _>(4),
        ip: r.get::<String, _>(5),
        port: r.get::<String, _>(6),
        network: r.get::<String, _>(7),
        source: r.get::<String, _>(8),
        protocol: r.get::<String, _>(9),
        outbound: OutboundTarget::from_i64(r.get::<i64, _>(10)),
        created_at: r.get::<DateTime<Utc>, _>(11),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
