//! Tiering rule engine
//!
//! Owns the rule registry and turns rule evaluations into pending
//! migrations. Rules evaluate in ascending priority order; an object
//! already claimed by a pending or running migration is never claimed
//! twice.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tierstore_common::{Error, Result, RuleId, TaskId, TaskState, TierId};
use tierstore_registry::{ConfigEntry, ConfigManager, Repository, TierRegistry};
use tracing::{debug, info, warn};

use crate::migration::DataMigration;
use crate::rule::TieringRule;

const SUBSYSTEM: &str = "tiering";

/// Rule registry and migration planner
pub struct TieringEngine {
    registry: Arc<TierRegistry>,
    rules: Arc<dyn Repository<RuleId, TieringRule>>,
    migrations: Arc<dyn Repository<TaskId, DataMigration>>,
    config: Option<Arc<ConfigManager>>,
}

impl TieringEngine {
    #[must_use]
    pub fn new(
        registry: Arc<TierRegistry>,
        rules: Arc<dyn Repository<RuleId, TieringRule>>,
        migrations: Arc<dyn Repository<TaskId, DataMigration>>,
        config: Option<Arc<ConfigManager>>,
    ) -> Self {
        Self {
            registry,
            rules,
            migrations,
            config,
        }
    }

    /// Create a rule. Validation fails closed; nothing is stored on
    /// error.
    pub fn create_rule(&self, rule: TieringRule) -> Result<RuleId> {
        rule.validate()?;
        for tier in [&rule.source_tier, &rule.target_tier] {
            if !self.registry.has_tier(tier) {
                return Err(Error::configuration(format!(
                    "unknown tier in rule: {tier}"
                )));
            }
        }
        // Cost-optimized rules must actually reduce cost.
        if matches!(rule.kind, crate::rule::RuleKind::CostOptimized) {
            let source_cost = self.registry.config(&rule.source_tier)?.cost_per_gb_month;
            let target_cost = self.registry.config(&rule.target_tier)?.cost_per_gb_month;
            if target_cost >= source_cost {
                return Err(Error::configuration(format!(
                    "cost-optimized rule target tier {} is not cheaper than source {}",
                    rule.target_tier, rule.source_tier
                )));
            }
        }
        let id = rule.id;
        self.persist(&rule)?;
        self.rules.put(id, rule);
        debug!(rule = %id, "created tiering rule");
        Ok(id)
    }

    /// Update a rule in place
    pub fn update_rule(&self, id: RuleId, mutate: impl FnOnce(&mut TieringRule)) -> Result<()> {
        let mut rule = self.get_rule(id)?;
        mutate(&mut rule);
        rule.id = id;
        rule.updated_at = chrono::Utc::now();
        rule.validate()?;
        self.persist(&rule)?;
        self.rules.put(id, rule);
        Ok(())
    }

    /// Enable or disable a rule
    pub fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<()> {
        self.update_rule(id, |r| r.enabled = enabled)
    }

    /// Delete a rule
    pub fn delete_rule(&self, id: RuleId) -> Result<()> {
        self.rules
            .remove(&id)
            .ok_or_else(|| Error::not_found("tiering rule", id.to_string()))?;
        if let Some(config) = &self.config {
            config.remove(SUBSYSTEM, &id.to_string())?;
        }
        Ok(())
    }

    /// Fetch one rule
    pub fn get_rule(&self, id: RuleId) -> Result<TieringRule> {
        self.rules
            .get(&id)
            .ok_or_else(|| Error::not_found("tiering rule", id.to_string()))
    }

    /// Snapshot all rules
    #[must_use]
    pub fn list_rules(&self) -> Vec<TieringRule> {
        self.rules.list()
    }

    /// Restore rules persisted through the config manager (startup)
    pub fn load_persisted(&self) -> Result<usize> {
        let Some(config) = &self.config else {
            return Ok(0);
        };
        let mut loaded = 0;
        for entry in config.export(SUBSYSTEM).configurations {
            match serde_json::from_value::<TieringRule>(entry.settings.clone()) {
                Ok(rule) => {
                    self.rules.put(rule.id, rule);
                    loaded += 1;
                }
                Err(e) => warn!(config_id = %entry.config_id, error = %e,
                    "skipping unparseable tiering rule"),
            }
        }
        Ok(loaded)
    }

    /// Evaluate active rules in ascending priority order and create one
    /// pending migration per rule that matched objects. Objects already
    /// referenced by a non-terminal migration are skipped.
    pub fn evaluate_rules(&self) -> Result<Vec<TaskId>> {
        let now = SystemTime::now();
        let mut rules: Vec<TieringRule> =
            self.rules.list().into_iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| r.priority);

        // Objects claimed by in-flight migrations stay untouched.
        let mut claimed: HashSet<(TierId, PathBuf)> = self
            .migrations
            .list()
            .into_iter()
            .filter(|m| !m.is_terminal())
            .flat_map(|m| {
                let source = m.source_tier.clone();
                m.paths.into_iter().map(move |p| (source.clone(), p))
            })
            .collect();

        let mut created = Vec::new();
        for rule in rules {
            let objects = self.registry.list_objects(&rule.source_tier)?;
            let matched: Vec<PathBuf> = objects
                .iter()
                .filter(|m| {
                    rule.matches(m, now)
                        && !claimed.contains(&(rule.source_tier.clone(), m.path.clone()))
                })
                .map(|m| m.path.clone())
                .collect();
            if matched.is_empty() {
                continue;
            }
            for path in &matched {
                claimed.insert((rule.source_tier.clone(), path.clone()));
            }
            let migration = DataMigration::new(
                rule.id,
                rule.source_tier.clone(),
                rule.target_tier.clone(),
                matched,
            );
            info!(
                rule = %rule.id,
                migration = %migration.id,
                source = %migration.source_tier,
                target = %migration.target_tier,
                objects = migration.paths.len(),
                "tiering rule matched, migration queued"
            );
            created.push(migration.id);
            self.migrations.put(migration.id, migration);
        }
        Ok(created)
    }

    /// Fetch one migration record
    pub fn get_migration(&self, id: TaskId) -> Result<DataMigration> {
        self.migrations
            .get(&id)
            .ok_or_else(|| Error::not_found("migration", id.to_string()))
    }

    /// Snapshot migrations in a given state
    #[must_use]
    pub fn migrations_in_state(&self, state: TaskState) -> Vec<DataMigration> {
        self.migrations
            .list()
            .into_iter()
            .filter(|m| m.state == state)
            .collect()
    }

    fn persist(&self, rule: &TieringRule) -> Result<()> {
        if let Some(config) = &self.config {
            config.upsert(
                SUBSYSTEM,
                ConfigEntry::new(
                    rule.id.to_string(),
                    "tiering_rule",
                    rule.name.clone(),
                    serde_json::to_value(rule)?,
                    rule.enabled,
                ),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleKind;
    use std::time::Duration;
    use tempfile::TempDir;
    use tierstore_common::config::TierConfig;
    use tierstore_common::TierKind;
    use tierstore_registry::MemoryRepository;

    struct Fixture {
        _dir: TempDir,
        engine: TieringEngine,
        hot: TierId,
        warm: TierId,
        hot_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(TierRegistry::new());
        let hot = TierId::new_unchecked("hot");
        let warm = TierId::new_unchecked("warm");
        let hot_root = dir.path().join("hot");
        registry
            .register(TierConfig::new(
                hot.clone(),
                TierKind::Hot,
                hot_root.clone(),
                1 << 30,
            ))
            .unwrap();
        registry
            .register(TierConfig::new(
                warm.clone(),
                TierKind::Warm,
                dir.path().join("warm"),
                1 << 30,
            ))
            .unwrap();
        let engine = TieringEngine::new(
            registry,
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryRepository::new()),
            None,
        );
        Fixture {
            _dir: dir,
            engine,
            hot,
            warm,
            hot_root,
        }
    }

    fn write_aged(root: &std::path::Path, name: &str, age_days: u64) {
        let path = root.join(name);
        std::fs::write(&path, b"payload").unwrap();
        let t = SystemTime::now() - Duration::from_secs(age_days * 86_400 + 3_600);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(t)
            .unwrap();
    }

    #[test]
    fn test_age_based_rule_produces_one_migration() {
        let fx = fixture();
        for i in 0..5 {
            write_aged(&fx.hot_root, &format!("old_{i}.json"), 45);
        }
        write_aged(&fx.hot_root, "fresh.json", 2);

        fx.engine
            .create_rule(
                TieringRule::new(
                    "demote-old",
                    RuleKind::AgeBased,
                    fx.hot.clone(),
                    fx.warm.clone(),
                )
                .with_option_u64("age_days", 30),
            )
            .unwrap();

        let created = fx.engine.evaluate_rules().unwrap();
        assert_eq!(created.len(), 1);
        let migration = fx.engine.get_migration(created[0]).unwrap();
        assert_eq!(migration.paths.len(), 5);
        assert_eq!(migration.state, TaskState::Pending);
        assert!(!migration.paths.contains(&PathBuf::from("fresh.json")));
    }

    #[test]
    fn test_reevaluation_skips_claimed_objects() {
        let fx = fixture();
        write_aged(&fx.hot_root, "old.json", 45);

        fx.engine
            .create_rule(
                TieringRule::new("r", RuleKind::AgeBased, fx.hot.clone(), fx.warm.clone())
                    .with_option_u64("age_days", 30),
            )
            .unwrap();

        assert_eq!(fx.engine.evaluate_rules().unwrap().len(), 1);
        // Object is claimed by the pending migration; no duplicate.
        assert!(fx.engine.evaluate_rules().unwrap().is_empty());
    }

    #[test]
    fn test_priority_order_claims_first() {
        let fx = fixture();
        write_aged(&fx.hot_root, "old.json", 45);

        let low = fx
            .engine
            .create_rule(
                TieringRule::new("late", RuleKind::AgeBased, fx.hot.clone(), fx.warm.clone())
                    .with_option_u64("age_days", 30)
                    .with_priority(200),
            )
            .unwrap();
        let high = fx
            .engine
            .create_rule(
                TieringRule::new("early", RuleKind::AgeBased, fx.hot.clone(), fx.warm.clone())
                    .with_option_u64("age_days", 10)
                    .with_priority(1),
            )
            .unwrap();

        let created = fx.engine.evaluate_rules().unwrap();
        assert_eq!(created.len(), 1);
        let migration = fx.engine.get_migration(created[0]).unwrap();
        assert_eq!(migration.rule, high);
        assert_ne!(migration.rule, low);
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let fx = fixture();
        write_aged(&fx.hot_root, "old.json", 45);
        let id = fx
            .engine
            .create_rule(
                TieringRule::new("r", RuleKind::AgeBased, fx.hot.clone(), fx.warm.clone())
                    .with_option_u64("age_days", 30),
            )
            .unwrap();
        fx.engine.set_enabled(id, false).unwrap();
        assert!(fx.engine.evaluate_rules().unwrap().is_empty());
    }

    #[test]
    fn test_create_rule_unknown_tier() {
        let fx = fixture();
        let rule = TieringRule::new(
            "r",
            RuleKind::AgeBased,
            fx.hot.clone(),
            TierId::new_unchecked("nonexistent"),
        )
        .with_option_u64("age_days", 30);
        assert!(fx.engine.create_rule(rule).is_err());
    }
}
