//! Rule table storage: proxy, header, and mirror rules.
//!
//! Rules are listed ID-ascending; registration order is the order the rule
//! engine resolves them in.

use sqlx::Row;
use tracing::instrument;

use super::{Result, Store, StoreError};
use crate::model::{HeaderRule, MirrorRule, ProxyRule, RulesSnapshot};

fn reject_placeholder_id(id: Option<i64>) -> Result<()> {
    match id {
        Some(id) if id < 0 => Err(StoreError::InvalidRuleId(id)),
        _ => Ok(()),
    }
}

impl Store {
    /// Loads all rules in registration (ID-ascending) order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a query fails.
    #[instrument(skip(self))]
    pub async fn rules_snapshot(&self) -> Result<RulesSnapshot> {
        let proxy_rules = sqlx::query_as::<_, ProxyRule>(
            r"SELECT id, pattern, enabled, use_proxy, proxy_url_override
              FROM proxy_rules ORDER BY id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        let header_rows = sqlx::query(
            r"SELECT id, pattern, enabled, headers_json FROM header_rules ORDER BY id ASC",
        )
        .fetch_all(self.pool())
        .await?;
        let header_rules = header_rows
            .into_iter()
            .map(|row| HeaderRule {
                id: row.get("id"),
                pattern: row.get("pattern"),
                enabled: row.get::<i64, _>("enabled") != 0,
                headers_json: serde_json::from_str(row.get::<&str, _>("headers_json"))
                    .unwrap_or_else(|_| serde_json::json!({})),
            })
            .collect();

        let mirror_rows = sqlx::query(
            r"SELECT id, pattern, enabled, candidates_json FROM mirror_rules ORDER BY id ASC",
        )
        .fetch_all(self.pool())
        .await?;
        let mirror_rules = mirror_rows
            .into_iter()
            .map(|row| MirrorRule {
                id: row.get("id"),
                pattern: row.get("pattern"),
                enabled: row.get::<i64, _>("enabled") != 0,
                candidates_json: serde_json::from_str(row.get::<&str, _>("candidates_json"))
                    .unwrap_or_else(|_| serde_json::json!([])),
            })
            .collect();

        Ok(RulesSnapshot {
            proxy_rules,
            header_rules,
            mirror_rules,
        })
    }

    /// Inserts or updates a proxy rule; returns the rule ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRuleId`] for negative IDs or
    /// [`StoreError::Database`] on failure.
    #[instrument(skip(self))]
    pub async fn upsert_proxy_rule(
        &self,
        id: Option<i64>,
        pattern: &str,
        enabled: bool,
        use_proxy: bool,
        proxy_url_override: Option<&str>,
    ) -> Result<i64> {
        reject_placeholder_id(id)?;
        if let Some(id) = id {
            sqlx::query(
                r"UPDATE proxy_rules
                  SET pattern = ?2, enabled = ?3, use_proxy = ?4, proxy_url_override = ?5
                  WHERE id = ?1",
            )
            .bind(id)
            .bind(pattern)
            .bind(enabled)
            .bind(use_proxy)
            .bind(proxy_url_override)
            .execute(self.pool())
            .await?;
            Ok(id)
        } else {
            let row = sqlx::query(
                r"INSERT INTO proxy_rules (pattern, enabled, use_proxy, proxy_url_override)
                  VALUES (?, ?, ?, ?) RETURNING id",
            )
            .bind(pattern)
            .bind(enabled)
            .bind(use_proxy)
            .bind(proxy_url_override)
            .fetch_one(self.pool())
            .await?;
            Ok(row.get("id"))
        }
    }

    /// Finds an existing proxy rule whose pattern is exactly `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn find_proxy_rule_by_pattern(&self, pattern: &str) -> Result<Option<ProxyRule>> {
        let rule = sqlx::query_as::<_, ProxyRule>(
            r"SELECT id, pattern, enabled, use_proxy, proxy_url_override
              FROM proxy_rules WHERE pattern = ? COLLATE NOCASE ORDER BY id ASC LIMIT 1",
        )
        .bind(pattern)
        .fetch_optional(self.pool())
        .await?;
        Ok(rule)
    }

    /// Deletes a proxy rule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_proxy_rule(&self, id: i64) -> Result<()> {
        sqlx::query(r"DELETE FROM proxy_rules WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Inserts or updates a header rule; returns the rule ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRuleId`] for negative IDs or
    /// [`StoreError::Database`] on failure.
    #[instrument(skip(self, headers_json))]
    pub async fn upsert_header_rule(
        &self,
        id: Option<i64>,
        pattern: &str,
        enabled: bool,
        headers_json: &serde_json::Value,
    ) -> Result<i64> {
        reject_placeholder_id(id)?;
        let raw = headers_json.to_string();
        if let Some(id) = id {
            sqlx::query(
                r"UPDATE header_rules SET pattern = ?2, enabled = ?3, headers_json = ?4
                  WHERE id = ?1",
            )
            .bind(id)
            .bind(pattern)
            .bind(enabled)
            .bind(&raw)
            .execute(self.pool())
            .await?;
            Ok(id)
        } else {
            let row = sqlx::query(
                r"INSERT INTO header_rules (pattern, enabled, headers_json)
                  VALUES (?, ?, ?) RETURNING id",
            )
            .bind(pattern)
            .bind(enabled)
            .bind(&raw)
            .fetch_one(self.pool())
            .await?;
            Ok(row.get("id"))
        }
    }

    /// Deletes a header rule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_header_rule(&self, id: i64) -> Result<()> {
        sqlx::query(r"DELETE FROM header_rules WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Inserts or updates a mirror rule; returns the rule ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRuleId`] for negative IDs or
    /// [`StoreError::Database`] on failure.
    #[instrument(skip(self, candidates_json))]
    pub async fn upsert_mirror_rule(
        &self,
        id: Option<i64>,
        pattern: &str,
        enabled: bool,
        candidates_json: &serde_json::Value,
    ) -> Result<i64> {
        reject_placeholder_id(id)?;
        let raw = candidates_json.to_string();
        if let Some(id) = id {
            sqlx::query(
                r"UPDATE mirror_rules SET pattern = ?2, enabled = ?3, candidates_json = ?4
                  WHERE id = ?1",
            )
            .bind(id)
            .bind(pattern)
            .bind(enabled)
            .bind(&raw)
            .execute(self.pool())
            .await?;
            Ok(id)
        } else {
            let row = sqlx::query(
                r"INSERT INTO mirror_rules (pattern, enabled, candidates_json)
                  VALUES (?, ?, ?) RETURNING id",
            )
            .bind(pattern)
            .bind(enabled)
            .bind(&raw)
            .fetch_one(self.pool())
            .await?;
            Ok(row.get("id"))
        }
    }

    /// Deletes a mirror rule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_mirror_rule(&self, id: i64) -> Result<()> {
        sqlx::query(r"DELETE FROM mirror_rules WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn test_store() -> Store {
        Store::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_proxy_rule_upsert_and_list_order() {
        let store = test_store().await;
        let first = store
            .upsert_proxy_rule(None, "example.com", true, true, None)
            .await
            .unwrap();
        let second = store
            .upsert_proxy_rule(None, "*.example.org", true, true, Some("http://p:8080"))
            .await
            .unwrap();
        assert!(second > first, "ids are monotonic");

        let snap = store.rules_snapshot().await.unwrap();
        assert_eq!(snap.proxy_rules.len(), 2);
        assert_eq!(snap.proxy_rules[0].id, first, "listed in registration order");
        assert_eq!(
            snap.proxy_rules[1].proxy_url_override.as_deref(),
            Some("http://p:8080")
        );
    }

    #[tokio::test]
    async fn test_proxy_rule_update_in_place() {
        let store = test_store().await;
        let id = store
            .upsert_proxy_rule(None, "example.com", true, true, None)
            .await
            .unwrap();
        let same = store
            .upsert_proxy_rule(Some(id), "example.com", false, true, None)
            .await
            .unwrap();
        assert_eq!(same, id);

        let snap = store.rules_snapshot().await.unwrap();
        assert_eq!(snap.proxy_rules.len(), 1);
        assert!(!snap.proxy_rules[0].enabled);
    }

    #[tokio::test]
    async fn test_negative_rule_id_rejected() {
        let store = test_store().await;
        let result = store
            .upsert_proxy_rule(Some(-1), "example.com", true, true, None)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidRuleId(-1))));

        let result = store
            .upsert_header_rule(Some(-7), "example.com", true, &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidRuleId(-7))));
    }

    #[tokio::test]
    async fn test_header_rule_json_round_trip() {
        let store = test_store().await;
        let payload = serde_json::json!({
            "User-Agent": {"value": "custom/1.0", "mode": "override"},
            "Referer": "https://example.com"
        });
        store
            .upsert_header_rule(None, "*.example.com", true, &payload)
            .await
            .unwrap();

        let snap = store.rules_snapshot().await.unwrap();
        assert_eq!(snap.header_rules.len(), 1);
        assert_eq!(snap.header_rules[0].headers_json, payload);
    }

    #[tokio::test]
    async fn test_mirror_rule_json_round_trip_and_delete() {
        let store = test_store().await;
        let payload = serde_json::json!(["https://mirror1.example", "https://mirror2.example"]);
        let id = store
            .upsert_mirror_rule(None, "slow.example", true, &payload)
            .await
            .unwrap();

        let snap = store.rules_snapshot().await.unwrap();
        assert_eq!(snap.mirror_rules[0].candidates_json, payload);

        store.delete_mirror_rule(id).await.unwrap();
        let snap = store.rules_snapshot().await.unwrap();
        assert!(snap.mirror_rules.is_empty());
    }

    #[tokio::test]
    async fn test_find_proxy_rule_by_pattern_is_case_insensitive() {
        let store = test_store().await;
        store
            .upsert_proxy_rule(None, "Example.COM", true, true, None)
            .await
            .unwrap();

        let found = store
            .find_proxy_rule_by_pattern("example.com")
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
