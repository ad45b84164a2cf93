//! In-memory implementation of every store trait, used by service tests.
//!
//! All tables live in one arena guarded by a single lock, so multi-table
//! operations (cascading deletes, strategy cloning) are atomic by construction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{StoreError, StoreResult},
    models::{
        environment::{
            ChangeRequestEnvironment, CreateEnvironment, DEFAULT_SORT_ORDER, Environment, EnvironmentFilter,
            EnvironmentStore, EnvironmentWithCounts, ProjectEnvironment, UpdateEnvironment,
        },
        feature::{CreateFeature, Feature, FeatureToggleStore},
        feature_environment::{FeatureEnvironment, FeatureEnvironmentKey, FeatureEnvironmentStore},
        feature_strategy::{
            CreateFeatureStrategy, FeatureEnvironmentDetail, FeatureEnvironmentSummary, FeatureOverview,
            FeatureStrategy, FeatureStrategyStore, FeatureStrategyUpdate, FeatureToggleWithEnvironments,
            NewFeatureStrategy,
        },
        import_toggles::{FeatureLink, FeatureNameProject, FeatureTag, ImportTogglesStore, ProjectFeaturesLimit},
        project::{CreateProject, Project, ProjectStore},
        segment::{CreateSegment, Segment, SegmentStore},
        variant::{Variant, sort_variants},
    },
    visibility::VisibilityPolicy,
};

/// Records keyed by a (possibly composite) key, remembering insertion order.
#[derive(Debug)]
struct Table<K, V> {
    rows: BTreeMap<K, (u64, V)>,
    next_seq: u64,
}

impl<K: Ord + Clone, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Ord + Clone, V> Table<K, V> {
    fn get(&self, key: &K) -> Option<&V> {
        self.rows.get(key).map(|(_, value)| value)
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.rows.get_mut(key).map(|(_, value)| value)
    }

    fn contains(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    fn seq(&self, key: &K) -> u64 {
        self.rows.get(key).map(|(seq, _)| *seq).unwrap_or(u64::MAX)
    }

    /// Insert unless the key is taken. Returns whether the row was inserted.
    fn insert(&mut self, key: K, value: V) -> bool {
        if self.rows.contains_key(&key) {
            return false;
        }
        self.next_seq += 1;
        self.rows.insert(key, (self.next_seq, value));
        true
    }

    /// Insert, or hand the existing row and the rejected value to `merge`.
    fn upsert(&mut self, key: K, value: V, merge: impl FnOnce(&mut V, V)) {
        match self.rows.get_mut(&key) {
            Some((_, existing)) => merge(existing, value),
            None => {
                self.insert(key, value);
            }
        }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.rows.remove(key).map(|(_, value)| value)
    }

    /// Drop every row matching `predicate`, returning how many went.
    fn remove_where(&mut self, mut predicate: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|key, (_, value)| !predicate(key, value));
        before - self.rows.len()
    }

    fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.rows.iter().map(|(key, (_, value))| (key, value))
    }

    fn values(&self) -> impl Iterator<Item = &V> {
        self.rows.values().map(|(_, value)| value)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

type PairKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    environments: Table<String, Environment>,
    projects: Table<String, Project>,
    /// (project, environment) -> default strategy
    project_environments: Table<PairKey, Option<CreateFeatureStrategy>>,
    features: Table<String, Feature>,
    /// (environment, feature)
    feature_environments: Table<PairKey, FeatureEnvironment>,
    strategies: Table<Uuid, FeatureStrategy>,
    segments: Table<i64, Segment>,
    strategy_segments: Table<(Uuid, i64), ()>,
    tags: Table<(String, String, String), ()>,
    links: Table<Uuid, FeatureLink>,
    next_segment_id: i64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing timestamps so creation order is always observable.
    fn now(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now
    }

    fn fe_key(environment: &str, feature_name: &str) -> PairKey {
        (environment.to_string(), feature_name.to_string())
    }

    fn feature_in(&self, feature_name: &str, projects: &[String]) -> bool {
        self.features
            .get(&feature_name.to_string())
            .is_some_and(|f| projects.contains(&f.project))
    }

    fn remove_strategies_where(&mut self, predicate: impl Fn(&FeatureStrategy) -> bool) -> usize {
        let doomed: BTreeSet<Uuid> = self
            .strategies
            .values()
            .filter(|s| predicate(s))
            .map(|s| s.id)
            .collect();
        self.strategy_segments
            .remove_where(|(strategy_id, _), _| doomed.contains(strategy_id));
        self.strategies.remove_where(|id, _| doomed.contains(id))
    }

    fn remove_environment(&mut self, name: &str) {
        self.environments.remove(&name.to_string());
        self.project_environments.remove_where(|(_, env), _| env == name);
        self.feature_environments.remove_where(|(env, _), _| env == name);
        self.remove_strategies_where(|s| s.environment == name);
    }

    fn remove_feature(&mut self, name: &str) {
        self.features.remove(&name.to_string());
        self.feature_environments.remove_where(|(_, feature), _| feature == name);
        self.tags.remove_where(|(feature, _, _), _| feature == name);
        self.links.remove_where(|_, link| link.feature_name == name);
        self.remove_strategies_where(|s| s.feature_name == name);
    }

    fn sorted_environments<'a>(&'a self, envs: impl Iterator<Item = &'a Environment>) -> Vec<Environment> {
        let mut envs: Vec<&Environment> = envs.collect();
        envs.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then_with(|| self.environments.seq(&a.name).cmp(&self.environments.seq(&b.name)))
                .then_with(|| a.name.cmp(&b.name))
        });
        envs.into_iter().cloned().collect()
    }

    fn enabled_toggle_count(&self, environment: &str, project: Option<&str>) -> i64 {
        self.feature_environments
            .values()
            .filter(|fe| fe.enabled && fe.environment == environment)
            .filter(|fe| {
                project.is_none_or(|p| {
                    self.features
                        .get(&fe.feature_name)
                        .is_some_and(|f| f.project == p)
                })
            })
            .count() as i64
    }
}

fn sort_strategies(strategies: &mut [FeatureStrategy]) {
    strategies.sort_by(|a, b| {
        a.sort_order
            .cmp(&b.sort_order)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

#[derive(Debug, Default)]
pub struct MemoryStores {
    tables: RwLock<Tables>,
    visibility: VisibilityPolicy,
}

impl MemoryStores {
    pub fn new(visibility: VisibilityPolicy) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            visibility,
        }
    }
}

#[async_trait]
impl EnvironmentStore for MemoryStores {
    async fn create(&self, env: &CreateEnvironment) -> StoreResult<Environment> {
        let environment = Environment {
            name: env.name.clone(),
            environment_type: env.environment_type.clone(),
            sort_order: env.sort_order.unwrap_or(DEFAULT_SORT_ORDER),
            enabled: env.enabled.unwrap_or(true),
            protected: env.protected.unwrap_or(false),
            required_approvals: env.required_approvals,
        };
        let mut tables = self.tables.write().await;
        if !tables.environments.insert(env.name.clone(), environment.clone()) {
            return Err(StoreError::ConstraintViolation(format!(
                "environment {} already exists",
                env.name
            )));
        }
        Ok(environment)
    }

    async fn import_environments(&self, envs: &[Environment]) -> StoreResult<Vec<Environment>> {
        let mut tables = self.tables.write().await;
        Ok(envs
            .iter()
            .filter(|env| tables.environments.insert(env.name.clone(), (*env).clone()))
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str) -> StoreResult<Environment> {
        let tables = self.tables.read().await;
        tables
            .environments
            .get(&name.to_string())
            .filter(|env| self.visibility.allows(&env.name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Could not find environment with name: {name}")))
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.tables.read().await.environments.contains(&name.to_string()))
    }

    async fn count(&self) -> StoreResult<i64> {
        Ok(self.tables.read().await.environments.len() as i64)
    }

    async fn max_sort_order(&self) -> StoreResult<i32> {
        let tables = self.tables.read().await;
        Ok(tables.environments.values().map(|e| e.sort_order).max().unwrap_or(0))
    }

    async fn get_all(&self, filter: &EnvironmentFilter) -> StoreResult<Vec<Environment>> {
        let tables = self.tables.read().await;
        let matching = tables.environments.values().filter(|env| {
            self.visibility.allows(&env.name)
                && filter.enabled.is_none_or(|enabled| env.enabled == enabled)
                && filter.protected.is_none_or(|protected| env.protected == protected)
                && filter
                    .environment_type
                    .as_ref()
                    .is_none_or(|t| &env.environment_type == t)
        });
        Ok(tables.sorted_environments(matching))
    }

    async fn get_all_with_counts(&self, filter: &EnvironmentFilter) -> StoreResult<Vec<EnvironmentWithCounts>> {
        let environments = EnvironmentStore::get_all(self, filter).await?;
        let tables = self.tables.read().await;
        Ok(environments
            .into_iter()
            .map(|environment| EnvironmentWithCounts {
                project_count: tables
                    .project_environments
                    .iter()
                    .filter(|((_, env), _)| env == &environment.name)
                    .count() as i64,
                api_token_count: 0,
                enabled_toggle_count: tables.enabled_toggle_count(&environment.name, None),
                environment,
            })
            .collect())
    }

    async fn get_project_environments(&self, project_id: &str) -> StoreResult<Vec<ProjectEnvironment>> {
        let environments = EnvironmentStore::get_all(self, &EnvironmentFilter::default()).await?;
        let tables = self.tables.read().await;
        Ok(environments
            .into_iter()
            .map(|environment| {
                let link = tables
                    .project_environments
                    .get(&(project_id.to_string(), environment.name.clone()));
                ProjectEnvironment {
                    linked: link.is_some(),
                    project_api_token_count: 0,
                    project_enabled_toggle_count: tables.enabled_toggle_count(&environment.name, Some(project_id)),
                    default_strategy: link.cloned().flatten(),
                    environment,
                }
            })
            .collect())
    }

    async fn update(&self, patch: &UpdateEnvironment, name: &str) -> StoreResult<Option<Environment>> {
        let mut tables = self.tables.write().await;
        let Some(env) = tables.environments.get_mut(&name.to_string()) else {
            return Ok(None);
        };
        if env.protected {
            return Ok(None);
        }
        if let Some(environment_type) = &patch.environment_type {
            env.environment_type = environment_type.clone();
        }
        if let Some(protected) = patch.protected {
            env.protected = protected;
        }
        if let Some(required_approvals) = patch.required_approvals {
            env.required_approvals = Some(required_approvals);
        }
        Ok(Some(env.clone()))
    }

    async fn update_sort_order(&self, name: &str, sort_order: i32) -> StoreResult<()> {
        if let Some(env) = self.tables.write().await.environments.get_mut(&name.to_string()) {
            env.sort_order = sort_order;
        }
        Ok(())
    }

    async fn toggle(&self, name: &str, enabled: bool) -> StoreResult<()> {
        if let Some(env) = self.tables.write().await.environments.get_mut(&name.to_string()) {
            env.enabled = enabled;
        }
        Ok(())
    }

    async fn enable(&self, names: &[String]) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        for name in names {
            if let Some(env) = tables.environments.get_mut(name) {
                env.enabled = true;
            }
        }
        Ok(())
    }

    async fn disable(&self, names: &[String]) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        for name in names {
            if let Some(env) = tables.environments.get_mut(name) {
                env.enabled = false;
            }
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let protected = tables
            .environments
            .get(&name.to_string())
            .is_some_and(|env| env.protected);
        if !protected {
            tables.remove_environment(name);
        }
        Ok(())
    }

    async fn get_change_request_environments(&self, names: &[String]) -> StoreResult<Vec<ChangeRequestEnvironment>> {
        let tables = self.tables.read().await;
        let matching = names
            .iter()
            .filter_map(|name| tables.environments.get(name))
            .filter(|env| env.required_approvals.is_some_and(|n| n > 0));
        let mut envs: Vec<&Environment> = matching.collect();
        envs.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        envs.dedup_by(|a, b| a.name == b.name);
        Ok(envs
            .into_iter()
            .map(|env| ChangeRequestEnvironment {
                name: env.name.clone(),
                required_approvals: env.required_approvals.unwrap_or(1),
            })
            .collect())
    }
}

#[async_trait]
impl FeatureEnvironmentStore for MemoryStores {
    async fn get(&self, key: &FeatureEnvironmentKey) -> StoreResult<FeatureEnvironment> {
        self.get_environment_meta_data(&key.environment, &key.feature_name)
            .await
    }

    async fn get_environment_meta_data(&self, environment: &str, feature_name: &str) -> StoreResult<FeatureEnvironment> {
        self.tables
            .read()
            .await
            .feature_environments
            .get(&Tables::fe_key(environment, feature_name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Could not find {feature_name} in {environment}")))
    }

    async fn exists(&self, key: &FeatureEnvironmentKey) -> StoreResult<bool> {
        self.feature_has_environment(&key.environment, &key.feature_name)
            .await
    }

    async fn feature_has_environment(&self, environment: &str, feature_name: &str) -> StoreResult<bool> {
        Ok(self
            .tables
            .read()
            .await
            .feature_environments
            .contains(&Tables::fe_key(environment, feature_name)))
    }

    async fn is_environment_enabled(&self, feature_name: &str, environment: &str) -> StoreResult<bool> {
        Ok(self
            .tables
            .read()
            .await
            .feature_environments
            .get(&Tables::fe_key(environment, feature_name))
            .is_some_and(|fe| fe.enabled))
    }

    async fn get_all(&self, feature_name: Option<&str>) -> StoreResult<Vec<FeatureEnvironment>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<FeatureEnvironment> = tables
            .feature_environments
            .values()
            .filter(|fe| feature_name.is_none_or(|name| fe.feature_name == name))
            .filter(|fe| self.visibility.allows(&fe.environment))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(rows)
    }

    async fn get_all_by_features(
        &self,
        features: &[String],
        environment: Option<&str>,
    ) -> StoreResult<Vec<FeatureEnvironment>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<FeatureEnvironment> = tables
            .feature_environments
            .values()
            .filter(|fe| features.contains(&fe.feature_name))
            .filter(|fe| environment.is_none_or(|env| fe.environment == env))
            .filter(|fe| self.visibility.allows(&fe.environment))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(rows)
    }

    async fn get_environments_for_feature(&self, feature_name: &str) -> StoreResult<Vec<FeatureEnvironment>> {
        FeatureEnvironmentStore::get_all(self, Some(feature_name)).await
    }

    async fn delete(&self, key: &FeatureEnvironmentKey) -> StoreResult<()> {
        self.remove_environment_for_feature(&key.feature_name, &key.environment)
            .await
    }

    async fn remove_environment_for_feature(&self, feature_name: &str, environment: &str) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .feature_environments
            .remove(&Tables::fe_key(environment, feature_name));
        Ok(())
    }

    async fn add_environment_to_feature(&self, feature_name: &str, environment: &str, enabled: bool) -> StoreResult<()> {
        self.tables.write().await.feature_environments.upsert(
            Tables::fe_key(environment, feature_name),
            FeatureEnvironment::new(feature_name, environment, enabled),
            |existing, incoming| existing.enabled = incoming.enabled,
        );
        Ok(())
    }

    async fn add_feature_environment(&self, feature_environment: &FeatureEnvironment) -> StoreResult<()> {
        let row = FeatureEnvironment {
            variants: sort_variants(feature_environment.variants.clone()),
            last_seen_at: None,
            ..feature_environment.clone()
        };
        self.tables.write().await.feature_environments.upsert(
            Tables::fe_key(&row.environment, &row.feature_name),
            row,
            |existing, incoming| {
                existing.enabled = incoming.enabled;
                existing.variants = incoming.variants;
            },
        );
        Ok(())
    }

    async fn connect_project(&self, environment: &str, project_id: &str, idempotent: bool) -> StoreResult<()> {
        let inserted = self
            .tables
            .write()
            .await
            .project_environments
            .insert((project_id.to_string(), environment.to_string()), None);
        if !inserted && !idempotent {
            return Err(StoreError::ConstraintViolation(format!(
                "project {project_id} is already linked to environment {environment}"
            )));
        }
        Ok(())
    }

    async fn disconnect_project(&self, environment: &str, project_id: &str) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .project_environments
            .remove(&(project_id.to_string(), environment.to_string()));
        Ok(())
    }

    async fn connect_features(&self, environment: &str, project_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let names: Vec<String> = tables
            .features
            .values()
            .filter(|f| f.project == project_id)
            .map(|f| f.name.clone())
            .collect();
        for name in names {
            tables.feature_environments.insert(
                Tables::fe_key(environment, &name),
                FeatureEnvironment::new(name.as_str(), environment, false),
            );
        }
        Ok(())
    }

    async fn disconnect_features(&self, environment: &str, project_id: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let names: BTreeSet<String> = tables
            .features
            .values()
            .filter(|f| f.project == project_id)
            .map(|f| f.name.clone())
            .collect();
        tables
            .feature_environments
            .remove_where(|(env, feature), _| env == environment && names.contains(feature));
        Ok(())
    }

    async fn connect_feature_to_environments_for_project(
        &self,
        feature_name: &str,
        project_id: &str,
        enabled_in: &HashMap<String, bool>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let environments: Vec<String> = tables
            .project_environments
            .iter()
            .filter(|((project, _), _)| project == project_id)
            .map(|((_, env), _)| env.clone())
            .collect();
        for environment in environments {
            let enabled = enabled_in.get(&environment).copied().unwrap_or(false);
            tables.feature_environments.insert(
                Tables::fe_key(&environment, feature_name),
                FeatureEnvironment::new(feature_name, environment.as_str(), enabled),
            );
        }
        Ok(())
    }

    async fn disable_environment_if_no_strategies(&self, feature_name: &str, environment: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let has_strategies = tables
            .strategies
            .values()
            .any(|s| s.feature_name == feature_name && s.environment == environment);
        if !has_strategies {
            if let Some(fe) = tables
                .feature_environments
                .get_mut(&Tables::fe_key(environment, feature_name))
            {
                fe.enabled = false;
            }
        }
        Ok(())
    }

    async fn set_environment_enabled_status(
        &self,
        environment: &str,
        feature_name: &str,
        enabled: bool,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        match tables
            .feature_environments
            .get_mut(&Tables::fe_key(environment, feature_name))
        {
            Some(fe) if fe.enabled != enabled => {
                fe.enabled = enabled;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn copy_environment_features_by_projects(
        &self,
        source_environment: &str,
        destination_environment: &str,
        projects: &[String],
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let copies: Vec<FeatureEnvironment> = tables
            .feature_environments
            .values()
            .filter(|fe| fe.environment == source_environment && tables.feature_in(&fe.feature_name, projects))
            .map(|fe| FeatureEnvironment {
                environment: destination_environment.to_string(),
                last_seen_at: None,
                ..fe.clone()
            })
            .collect();
        for copy in copies {
            tables
                .feature_environments
                .insert(Tables::fe_key(&copy.environment, &copy.feature_name), copy);
        }
        Ok(())
    }

    async fn clone_strategies(
        &self,
        source_environment: &str,
        destination_environment: &str,
        projects: &[String],
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let mut sources: Vec<FeatureStrategy> = tables
            .strategies
            .values()
            .filter(|s| s.environment == source_environment && tables.feature_in(&s.feature_name, projects))
            .cloned()
            .collect();
        if sources.is_empty() {
            return Ok(());
        }
        if !tables.environments.contains(&destination_environment.to_string()) {
            return Err(StoreError::NotFound(format!(
                "Could not find environment with name: {destination_environment}"
            )));
        }
        sources.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut id_map = HashMap::new();
        for source in sources {
            let clone = FeatureStrategy {
                id: Uuid::new_v4(),
                environment: destination_environment.to_string(),
                created_at: tables.now(),
                ..source
            };
            id_map.insert(source.id, clone.id);
            tables.strategies.insert(clone.id, clone);
        }

        let attachments: Vec<(Uuid, i64)> = tables
            .strategy_segments
            .iter()
            .filter_map(|((strategy_id, segment_id), _)| id_map.get(strategy_id).map(|new_id| (*new_id, *segment_id)))
            .collect();
        for key in attachments {
            tables.strategy_segments.insert(key, ());
        }
        Ok(())
    }

    async fn set_variants_to_feature_environments(
        &self,
        feature_name: &str,
        environments: &[String],
        variants: &[Variant],
    ) -> StoreResult<()> {
        let sorted = sort_variants(variants.to_vec());
        let mut tables = self.tables.write().await;
        for environment in environments {
            let row = FeatureEnvironment {
                variants: sorted.clone(),
                ..FeatureEnvironment::new(feature_name, environment.as_str(), false)
            };
            tables
                .feature_environments
                .upsert(Tables::fe_key(environment, feature_name), row, |existing, incoming| {
                    existing.variants = incoming.variants
                });
        }
        Ok(())
    }

    async fn variant_exists(&self, feature_name: &str) -> StoreResult<bool> {
        Ok(self
            .tables
            .read()
            .await
            .feature_environments
            .values()
            .any(|fe| fe.feature_name == feature_name && !fe.variants.is_empty()))
    }

    async fn update_last_seen(&self, feature_name: &str, environment: &str, seen_at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(fe) = self
            .tables
            .write()
            .await
            .feature_environments
            .get_mut(&Tables::fe_key(environment, feature_name))
        {
            fe.last_seen_at = Some(seen_at);
        }
        Ok(())
    }
}

#[async_trait]
impl FeatureStrategyStore for MemoryStores {
    async fn create_strategy_feature_env(&self, strategy: &NewFeatureStrategy) -> StoreResult<FeatureStrategy> {
        let mut tables = self.tables.write().await;
        let created = FeatureStrategy {
            id: Uuid::new_v4(),
            feature_name: strategy.feature_name.clone(),
            project_id: strategy.project_id.clone(),
            environment: strategy.environment.clone(),
            strategy_name: strategy.strategy_name.clone(),
            parameters: strategy.parameters.clone(),
            constraints: strategy.constraints.clone(),
            variants: strategy.variants.clone(),
            sort_order: strategy.sort_order.unwrap_or(DEFAULT_SORT_ORDER),
            title: strategy.title.clone(),
            disabled: strategy.disabled,
            created_at: tables.now(),
        };
        tables.strategies.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_strategy_by_id(&self, id: Uuid) -> StoreResult<FeatureStrategy> {
        self.tables
            .read()
            .await
            .strategies
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Could not find strategy with id: {id}")))
    }

    async fn exists(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.tables.read().await.strategies.contains(&id))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        self.tables.write().await.remove_strategies_where(|s| s.id == id);
        Ok(())
    }

    async fn get_strategies_for_feature_env(
        &self,
        project_id: &str,
        feature_name: &str,
        environment: &str,
    ) -> StoreResult<Vec<FeatureStrategy>> {
        let tables = self.tables.read().await;
        let mut strategies: Vec<FeatureStrategy> = tables
            .strategies
            .values()
            .filter(|s| s.project_id == project_id && s.feature_name == feature_name && s.environment == environment)
            .cloned()
            .collect();
        sort_strategies(&mut strategies);
        Ok(strategies)
    }

    async fn get_strategies_for_toggle(&self, feature_name: &str) -> StoreResult<Vec<FeatureStrategy>> {
        let tables = self.tables.read().await;
        let mut strategies: Vec<FeatureStrategy> = tables
            .strategies
            .values()
            .filter(|s| s.feature_name == feature_name && self.visibility.allows(&s.environment))
            .cloned()
            .collect();
        sort_strategies(&mut strategies);
        strategies.sort_by(|a, b| a.environment.cmp(&b.environment));
        Ok(strategies)
    }

    async fn get_strategies_for_environment(&self, environment: &str) -> StoreResult<Vec<FeatureStrategy>> {
        let tables = self.tables.read().await;
        let mut strategies: Vec<FeatureStrategy> = tables
            .strategies
            .values()
            .filter(|s| s.environment == environment)
            .cloned()
            .collect();
        sort_strategies(&mut strategies);
        strategies.sort_by(|a, b| a.feature_name.cmp(&b.feature_name));
        Ok(strategies)
    }

    async fn remove_all_strategies_for_feature_env(&self, feature_name: &str, environment: &str) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .remove_strategies_where(|s| s.feature_name == feature_name && s.environment == environment);
        Ok(())
    }

    async fn update_strategy(&self, id: Uuid, update: &FeatureStrategyUpdate) -> StoreResult<FeatureStrategy> {
        let mut tables = self.tables.write().await;
        let strategy = tables
            .strategies
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("Could not find strategy with id: {id}")))?;
        strategy.constraints = update.constraints.clone().unwrap_or_default();
        if let Some(strategy_name) = &update.strategy_name {
            strategy.strategy_name = strategy_name.clone();
        }
        if let Some(parameters) = &update.parameters {
            strategy.parameters = parameters.clone();
        }
        if let Some(variants) = &update.variants {
            strategy.variants = variants.clone();
        }
        if let Some(title) = &update.title {
            strategy.title = Some(title.clone());
        }
        if let Some(disabled) = update.disabled {
            strategy.disabled = disabled;
        }
        Ok(strategy.clone())
    }

    async fn update_sort_order(&self, id: Uuid, sort_order: i32) -> StoreResult<()> {
        if let Some(strategy) = self.tables.write().await.strategies.get_mut(&id) {
            strategy.sort_order = sort_order;
        }
        Ok(())
    }

    async fn get_feature_toggle_with_envs(
        &self,
        feature_name: &str,
        archived: bool,
    ) -> StoreResult<FeatureToggleWithEnvironments> {
        let tables = self.tables.read().await;
        let feature = tables
            .features
            .get(&feature_name.to_string())
            .filter(|f| f.is_archived() == archived)
            .ok_or_else(|| StoreError::NotFound(format!("Could not find feature toggle with name {feature_name}")))?;

        let environments = tables
            .feature_environments
            .values()
            .filter(|fe| fe.feature_name == feature_name && self.visibility.allows(&fe.environment))
            .map(|fe| {
                let env = tables.environments.get(&fe.environment);
                FeatureEnvironmentDetail {
                    name: fe.environment.clone(),
                    environment_type: env.map(|e| e.environment_type.clone()).unwrap_or_default(),
                    enabled: fe.enabled,
                    sort_order: env.map(|e| e.sort_order).unwrap_or(0),
                    variants: fe.variants.clone(),
                    last_seen_at: fe.last_seen_at,
                    strategies: tables
                        .strategies
                        .values()
                        .filter(|s| s.feature_name == feature_name && s.environment == fe.environment)
                        .cloned()
                        .collect(),
                }
            })
            .collect();

        let mut result = FeatureToggleWithEnvironments {
            name: feature.name.clone(),
            description: feature.description.clone(),
            feature_type: feature.feature_type.clone(),
            project: feature.project.clone(),
            stale: feature.stale,
            archived: feature.is_archived(),
            created_at: feature.created_at,
            last_seen_at: None,
            environments,
        };
        result.order_environments();
        Ok(result)
    }

    async fn get_feature_overview(&self, project_id: &str, archived: bool) -> StoreResult<Vec<FeatureOverview>> {
        let tables = self.tables.read().await;
        let overview = tables
            .features
            .values()
            .filter(|f| f.project == project_id && f.is_archived() == archived)
            .map(|feature| {
                let rows: Vec<&FeatureEnvironment> = tables
                    .feature_environments
                    .values()
                    .filter(|fe| fe.feature_name == feature.name && self.visibility.allows(&fe.environment))
                    .collect();
                let mut summary = FeatureOverview {
                    name: feature.name.clone(),
                    description: feature.description.clone(),
                    feature_type: feature.feature_type.clone(),
                    stale: feature.stale,
                    archived: feature.is_archived(),
                    created_at: feature.created_at,
                    last_seen_at: rows.iter().filter_map(|fe| fe.last_seen_at).max(),
                    environments: rows
                        .iter()
                        .map(|fe| {
                            let env = tables.environments.get(&fe.environment);
                            FeatureEnvironmentSummary {
                                name: fe.environment.clone(),
                                environment_type: env.map(|e| e.environment_type.clone()).unwrap_or_default(),
                                enabled: fe.enabled,
                                sort_order: env.map(|e| e.sort_order).unwrap_or(0),
                                has_strategies: tables
                                    .strategies
                                    .values()
                                    .any(|s| s.feature_name == feature.name && s.environment == fe.environment),
                            }
                        })
                        .collect(),
                };
                summary.order_environments();
                summary
            })
            .collect();
        Ok(overview)
    }

    async fn get_strategies_by_segment(&self, segment_id: i64) -> StoreResult<Vec<FeatureStrategy>> {
        let tables = self.tables.read().await;
        let mut strategies: Vec<FeatureStrategy> = tables
            .strategy_segments
            .iter()
            .filter(|((_, segment), _)| *segment == segment_id)
            .filter_map(|((strategy_id, _), _)| tables.strategies.get(strategy_id).cloned())
            .collect();
        strategies.sort_by(|a, b| {
            a.feature_name
                .cmp(&b.feature_name)
                .then_with(|| a.sort_order.cmp(&b.sort_order))
        });
        Ok(strategies)
    }

    async fn delete_configurations_for_project_and_environment(
        &self,
        project_id: &str,
        environment: &str,
    ) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .remove_strategies_where(|s| s.project_id == project_id && s.environment == environment);
        Ok(())
    }
}

#[async_trait]
impl ImportTogglesStore for MemoryStores {
    async fn get_archived_features(&self, names: &[String]) -> StoreResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .features
            .values()
            .filter(|f| f.is_archived() && names.contains(&f.name))
            .map(|f| f.name.clone())
            .collect())
    }

    async fn get_existing_features(&self, names: &[String]) -> StoreResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .features
            .values()
            .filter(|f| names.contains(&f.name))
            .map(|f| f.name.clone())
            .collect())
    }

    async fn get_features_in_other_projects(
        &self,
        names: &[String],
        project_id: &str,
    ) -> StoreResult<Vec<FeatureNameProject>> {
        let tables = self.tables.read().await;
        Ok(tables
            .features
            .values()
            .filter(|f| names.contains(&f.name) && f.project != project_id)
            .map(|f| FeatureNameProject {
                name: f.name.clone(),
                project: f.project.clone(),
            })
            .collect())
    }

    async fn get_features_in_project(&self, names: &[String], project_id: &str) -> StoreResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .features
            .values()
            .filter(|f| names.contains(&f.name) && f.project == project_id)
            .map(|f| f.name.clone())
            .collect())
    }

    async fn strategies_exist_for_features(&self, names: &[String], environment: &str) -> StoreResult<bool> {
        if names.is_empty() {
            return Ok(true);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .strategies
            .values()
            .any(|s| s.environment == environment && names.contains(&s.feature_name)))
    }

    async fn delete_strategies_for_features(&self, names: &[String], environment: &str) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .remove_strategies_where(|s| s.environment == environment && names.contains(&s.feature_name));
        Ok(())
    }

    async fn delete_tags_for_features(&self, names: &[String]) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .tags
            .remove_where(|(feature, _, _), _| names.contains(feature));
        Ok(())
    }

    async fn delete_links_for_features(&self, names: &[String]) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .links
            .remove_where(|_, link| names.contains(&link.feature_name));
        Ok(())
    }

    async fn get_project_features_limit(&self, names: &[String], project_id: &str) -> StoreResult<ProjectFeaturesLimit> {
        let tables = self.tables.read().await;
        let active_in_project = |f: &&Feature| f.project == project_id && !f.is_archived();
        // archived names are skipped on import, so they never count as new
        let already_in_project = tables
            .features
            .values()
            .filter(|f| f.project == project_id && names.contains(&f.name))
            .count() as i64;
        Ok(ProjectFeaturesLimit {
            limit: tables
                .projects
                .get(&project_id.to_string())
                .and_then(|p| p.feature_limit),
            current_features_count: tables.features.values().filter(active_in_project).count() as i64,
            new_features_count: names.len() as i64 - already_in_project,
        })
    }

    async fn add_tags(&self, tags: &[FeatureTag]) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        for tag in tags {
            tables.tags.insert(
                (tag.feature_name.clone(), tag.tag_type.clone(), tag.tag_value.clone()),
                (),
            );
        }
        Ok(())
    }

    async fn add_links(&self, links: &[FeatureLink]) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        for link in links {
            tables.links.insert(Uuid::new_v4(), link.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for MemoryStores {
    async fn create(&self, project: &CreateProject) -> StoreResult<Project> {
        let mut tables = self.tables.write().await;
        let created = Project {
            id: project.id.clone(),
            name: project.name.clone(),
            description: project.description.clone(),
            feature_limit: project.feature_limit,
            created_at: tables.now(),
        };
        if !tables.projects.insert(project.id.clone(), created.clone()) {
            return Err(StoreError::ConstraintViolation(format!(
                "project {} already exists",
                project.id
            )));
        }
        Ok(created)
    }

    async fn get(&self, id: &str) -> StoreResult<Project> {
        self.tables
            .read()
            .await
            .projects
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("No project with id {id}")))
    }

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self.tables.read().await.projects.contains(&id.to_string()))
    }

    async fn get_all_ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.tables.read().await.projects.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn get_environments_for_project(&self, id: &str) -> StoreResult<Vec<String>> {
        let tables = self.tables.read().await;
        let linked = tables
            .environments
            .values()
            .filter(|env| self.visibility.allows(&env.name))
            .filter(|env| {
                tables
                    .project_environments
                    .contains(&(id.to_string(), env.name.clone()))
            });
        let mut envs: Vec<&Environment> = linked.collect();
        envs.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        Ok(envs.into_iter().map(|env| env.name.clone()).collect())
    }

    async fn get_project_links_for_environments(
        &self,
        environments: &[String],
    ) -> StoreResult<BTreeMap<String, Vec<String>>> {
        let tables = self.tables.read().await;
        let mut links: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for ((project, environment), _) in tables.project_environments.iter() {
            if environments.contains(environment) {
                links.entry(environment.clone()).or_default().push(project.clone());
            }
        }
        for projects in links.values_mut() {
            projects.sort();
        }
        Ok(links)
    }

    async fn get_default_strategy(
        &self,
        project_id: &str,
        environment: &str,
    ) -> StoreResult<Option<CreateFeatureStrategy>> {
        Ok(self
            .tables
            .read()
            .await
            .project_environments
            .get(&(project_id.to_string(), environment.to_string()))
            .cloned()
            .flatten())
    }

    async fn update_default_strategy(
        &self,
        project_id: &str,
        environment: &str,
        strategy: &CreateFeatureStrategy,
    ) -> StoreResult<CreateFeatureStrategy> {
        let mut tables = self.tables.write().await;
        let link = tables
            .project_environments
            .get_mut(&(project_id.to_string(), environment.to_string()))
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "Project {project_id} is not linked to environment {environment}"
                ))
            })?;
        *link = Some(strategy.clone());
        Ok(strategy.clone())
    }
}

#[async_trait]
impl FeatureToggleStore for MemoryStores {
    async fn create(&self, project_id: &str, feature: &CreateFeature) -> StoreResult<Feature> {
        let mut tables = self.tables.write().await;
        let created = Feature {
            name: feature.name.clone(),
            description: feature.description.clone(),
            feature_type: feature.feature_type.to_string(),
            project: project_id.to_string(),
            stale: false,
            archived_at: None,
            created_at: tables.now(),
        };
        if !tables.features.insert(feature.name.clone(), created.clone()) {
            return Err(StoreError::ConstraintViolation(format!(
                "A feature named {} already exists",
                feature.name
            )));
        }
        Ok(created)
    }

    async fn get(&self, name: &str) -> StoreResult<Feature> {
        self.tables
            .read()
            .await
            .features
            .get(&name.to_string())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("No feature toggle named {name}")))
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.tables.read().await.features.contains(&name.to_string()))
    }

    async fn archive(&self, name: &str) -> StoreResult<Feature> {
        let mut tables = self.tables.write().await;
        let now = tables.now();
        let feature = tables
            .features
            .get_mut(&name.to_string())
            .ok_or_else(|| StoreError::NotFound(format!("No feature toggle named {name}")))?;
        feature.archived_at = Some(now);
        Ok(feature.clone())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.tables.write().await.remove_feature(name);
        Ok(())
    }

    async fn get_all_by_project(&self, project_id: &str, archived: bool) -> StoreResult<Vec<Feature>> {
        Ok(self
            .tables
            .read()
            .await
            .features
            .values()
            .filter(|f| f.project == project_id && f.is_archived() == archived)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SegmentStore for MemoryStores {
    async fn create(&self, segment: &CreateSegment) -> StoreResult<Segment> {
        let mut tables = self.tables.write().await;
        if tables.segments.values().any(|s| s.name == segment.name) {
            return Err(StoreError::ConstraintViolation(format!(
                "segment {} already exists",
                segment.name
            )));
        }
        tables.next_segment_id += 1;
        let created = Segment {
            id: tables.next_segment_id,
            name: segment.name.clone(),
            description: segment.description.clone(),
            constraints: segment.constraints.clone(),
            created_at: tables.now(),
        };
        tables.segments.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: i64) -> StoreResult<Segment> {
        self.tables
            .read()
            .await
            .segments
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("No segment with id {id}")))
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.segments.remove(&id);
        tables.strategy_segments.remove_where(|(_, segment), _| *segment == id);
        Ok(())
    }

    async fn add_to_strategy(&self, strategy_id: Uuid, segment_id: i64) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .strategy_segments
            .insert((strategy_id, segment_id), ());
        Ok(())
    }

    async fn get_by_strategy(&self, strategy_id: Uuid) -> StoreResult<Vec<Segment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .strategy_segments
            .iter()
            .filter(|((strategy, _), _)| *strategy == strategy_id)
            .filter_map(|((_, segment_id), _)| tables.segments.get(segment_id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stores;

    async fn seeded(stores: &Stores) {
        for (name, sort_order) in [("default", 1), ("staging", 2)] {
            stores
                .environments
                .create(&CreateEnvironment {
                    sort_order: Some(sort_order),
                    ..CreateEnvironment::new(name, "development")
                })
                .await
                .unwrap();
        }
        stores
            .projects
            .create(&CreateProject {
                id: "x".into(),
                name: "X".into(),
                description: None,
                feature_limit: None,
                environments: None,
            })
            .await
            .unwrap();
        stores.features.create("x", &CreateFeature::named("f")).await.unwrap();
    }

    #[test]
    fn table_keeps_first_insert() {
        let mut table: Table<String, i32> = Table::default();
        assert!(table.insert("a".into(), 1));
        assert!(!table.insert("a".into(), 2));
        assert_eq!(table.get(&"a".to_string()), Some(&1));

        table.upsert("a".into(), 5, |existing, incoming| *existing += incoming);
        assert_eq!(table.get(&"a".to_string()), Some(&6));
        assert_eq!(table.remove_where(|_, v| *v > 3), 1);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn connect_features_matches_sql_semantics() {
        let stores = Stores::in_memory(VisibilityPolicy::Unrestricted);
        seeded(&stores).await;

        stores.feature_environments.connect_features("staging", "x").await.unwrap();
        stores
            .feature_environments
            .set_environment_enabled_status("staging", "f", true)
            .await
            .unwrap();
        stores.feature_environments.connect_features("staging", "x").await.unwrap();

        assert!(stores
            .feature_environments
            .is_environment_enabled("f", "staging")
            .await
            .unwrap());
        assert_eq!(
            stores.feature_environments.get_all(None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn deleting_environment_cascades() {
        let stores = Stores::in_memory(VisibilityPolicy::Unrestricted);
        seeded(&stores).await;
        stores
            .feature_environments
            .connect_project("staging", "x", false)
            .await
            .unwrap();
        stores.feature_environments.connect_features("staging", "x").await.unwrap();
        stores
            .feature_strategies
            .create_strategy_feature_env(&NewFeatureStrategy {
                feature_name: "f".into(),
                project_id: "x".into(),
                environment: "staging".into(),
                strategy_name: "default".into(),
                parameters: Default::default(),
                constraints: Vec::new(),
                variants: Vec::new(),
                sort_order: None,
                title: None,
                disabled: false,
            })
            .await
            .unwrap();

        EnvironmentStore::delete(stores.environments.as_ref(), "staging")
            .await
            .unwrap();

        assert!(!stores.feature_environments.feature_has_environment("staging", "f").await.unwrap());
        assert!(stores
            .feature_strategies
            .get_strategies_for_environment("staging")
            .await
            .unwrap()
            .is_empty());
        assert!(stores.projects.get_environments_for_project("x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clone_copies_segment_attachments() {
        let stores = Stores::in_memory(VisibilityPolicy::Unrestricted);
        seeded(&stores).await;
        let strategy = stores
            .feature_strategies
            .create_strategy_feature_env(&NewFeatureStrategy {
                feature_name: "f".into(),
                project_id: "x".into(),
                environment: "default".into(),
                strategy_name: "default".into(),
                parameters: Default::default(),
                constraints: Vec::new(),
                variants: Vec::new(),
                sort_order: None,
                title: None,
                disabled: false,
            })
            .await
            .unwrap();
        let segment = stores
            .segments
            .create(&CreateSegment {
                name: "beta".into(),
                description: None,
                constraints: Vec::new(),
            })
            .await
            .unwrap();
        stores.segments.add_to_strategy(strategy.id, segment.id).await.unwrap();

        stores
            .feature_environments
            .clone_strategies("default", "staging", &["x".to_string()])
            .await
            .unwrap();

        let using = stores.feature_strategies.get_strategies_by_segment(segment.id).await.unwrap();
        let envs: BTreeSet<String> = using.into_iter().map(|s| s.environment).collect();
        assert_eq!(envs, BTreeSet::from(["default".to_string(), "staging".to_string()]));
    }

    #[tokio::test]
    async fn clone_without_sources_ignores_missing_destination() {
        let stores = Stores::in_memory(VisibilityPolicy::Unrestricted);
        seeded(&stores).await;

        stores
            .feature_environments
            .clone_strategies("default", "nowhere", &["x".to_string()])
            .await
            .unwrap();
        assert!(stores
            .feature_strategies
            .get_strategies_for_environment("nowhere")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn archived_names_do_not_count_against_feature_limit() {
        let stores = Stores::in_memory(VisibilityPolicy::Unrestricted);
        seeded(&stores).await;
        stores.features.create("x", &CreateFeature::named("old")).await.unwrap();
        stores.features.archive("old").await.unwrap();

        let limit = stores
            .import_toggles
            .get_project_features_limit(&["old".to_string(), "fresh".to_string()], "x")
            .await
            .unwrap();
        assert_eq!(limit.current_features_count, 1);
        assert_eq!(limit.new_features_count, 1);
    }
}
