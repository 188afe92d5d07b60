//! Per object-type reconciliation pass
//!
//! Stages, in order and without backtracking:
//! 1. load rules            6. scope managed hosts to the type's groups
//! 2. resolve references    7. re-validate hosts present on both sides
//! 3. discover              8. extra = (managed - discovered) + failed re-validations
//! 4. diff for creation     9. anomaly guard
//! 5. create pass          10. removal action (delete / disable / simulate)

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use crate::config::ObjectTypeConfig;
use crate::error::{SyncError, SyncResult};
use crate::inventory::{parse_discovery, Inventory};
use crate::model::{DiscoveredObject, HostOptions, HostStatus, Macro, ManagedHost, ObjectType};
use crate::protocol::{AgentQuery, NOT_SUPPORTED_PREFIX};
use crate::registry::Registry;
use crate::report::TypeOutcome;
use crate::rules::{OptionalRule, Rule, RuleEvaluator, RuleSet, Target};

/// Share of managed hosts above which removal needs `force`.
pub const ANOMALY_THRESHOLD_PERCENT: usize = 10;

/// What happens to extra hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalAction {
    Delete,
    Disable,
    Simulate,
}

impl FromStr for RemovalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(RemovalAction::Delete),
            "disable" => Ok(RemovalAction::Disable),
            "simulate" => Ok(RemovalAction::Simulate),
            other => Err(format!("unknown action {other:?} (expected delete, disable or simulate)")),
        }
    }
}

impl fmt::Display for RemovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemovalAction::Delete => "delete",
            RemovalAction::Disable => "disable",
            RemovalAction::Simulate => "simulate",
        })
    }
}

/// Run-wide settings, fixed before the first pass.
#[derive(Debug, Clone)]
pub struct RunContext {
    action: RemovalAction,
    force: bool,
    workers: usize,
}

impl RunContext {
    pub fn new(action: RemovalAction) -> Self {
        Self {
            action,
            force: false,
            workers: 1,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn action(&self) -> RemovalAction {
        self.action
    }

    pub fn force(&self) -> bool {
        self.force
    }

    /// Concurrent per-object checks, never below one.
    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// A pass that stopped early, with the changes it had already made.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PassAborted {
    pub error: SyncError,
    pub partial: TypeOutcome,
}

/// True when removing `extra` of `managed` hosts exceeds the anomaly threshold.
pub fn exceeds_threshold(extra: usize, managed: usize) -> bool {
    extra > 0 && extra * 100 > managed * ANOMALY_THRESHOLD_PERCENT
}

/// Discovered objects without a registry host of the same technical name.
pub fn missing_objects<'i>(discovered: &'i Inventory, registered: &BTreeSet<String>) -> Vec<&'i DiscoveredObject> {
    discovered
        .iter()
        .filter(|(key, _)| !registered.contains(*key))
        .map(|(_, object)| object)
        .collect()
}

/// Managed hosts no longer discovered, plus the ones failing re-validation.
pub fn extra_hosts(
    managed: &BTreeMap<String, ManagedHost>,
    discovered: &Inventory,
    failed_common: BTreeSet<String>,
) -> BTreeSet<String> {
    let mut extra: BTreeSet<String> = managed
        .keys()
        .filter(|key| !discovered.contains_key(*key))
        .cloned()
        .collect();
    extra.extend(failed_common);
    extra
}

enum PendingTarget {
    Group(String),
    Template(String),
}

/// Stage 1 output: compiled rules, optional targets still named.
struct LoadedRules {
    include: Vec<Rule>,
    exclude: Vec<Rule>,
    optional: Vec<(Rule, PendingTarget)>,
}

fn load_rules(object_type: ObjectType, config: &ObjectTypeConfig) -> SyncResult<LoadedRules> {
    if config.effective_templates().is_empty() {
        return Err(SyncError::configuration(object_type, "no template configured"));
    }
    if config.effective_groups().is_empty() {
        return Err(SyncError::configuration(object_type, "no host group configured"));
    }

    let compile = |method: &str, pattern: &str| {
        Rule::new(method, pattern).map_err(|e| {
            SyncError::configuration(object_type, format!("invalid pattern {pattern:?} for {method}: {e}"))
        })
    };

    let include = config
        .include
        .iter()
        .map(|r| compile(r.method.as_str(), r.pattern.as_str()))
        .collect::<SyncResult<Vec<_>>>()?;
    let exclude = config
        .exclude
        .iter()
        .map(|r| compile(r.method.as_str(), r.pattern.as_str()))
        .collect::<SyncResult<Vec<_>>>()?;

    let mut optional = Vec::new();
    for r in &config.optional_groups {
        optional.push((compile(r.method.as_str(), r.pattern.as_str())?, PendingTarget::Group(r.target.trim().to_string())));
    }
    for r in &config.optional_templates {
        optional.push((compile(r.method.as_str(), r.pattern.as_str())?, PendingTarget::Template(r.target.trim().to_string())));
    }

    Ok(LoadedRules {
        include,
        exclude,
        optional,
    })
}

fn push_unique(ids: &mut Vec<String>, id: String) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

pub struct Reconciler<'a, R: Registry + ?Sized, A: AgentQuery + ?Sized> {
    registry: &'a R,
    agent: &'a A,
    ctx: &'a RunContext,
}

impl<'a, R: Registry + ?Sized, A: AgentQuery + ?Sized> Reconciler<'a, R, A> {
    pub fn new(registry: &'a R, agent: &'a A, ctx: &'a RunContext) -> Self {
        Self { registry, agent, ctx }
    }

    /// Runs every stage for one object type. An aborted pass still reports
    /// the hosts it created or removed before the failure.
    pub async fn sync_type(&self, object_type: ObjectType, config: &ObjectTypeConfig) -> Result<TypeOutcome, PassAborted> {
        let mut outcome = TypeOutcome::default();
        match self.run_stages(object_type, config, &mut outcome).await {
            Ok(()) => Ok(outcome),
            Err(error) => Err(PassAborted {
                error,
                partial: outcome,
            }),
        }
    }

    async fn run_stages(
        &self,
        object_type: ObjectType,
        config: &ObjectTypeConfig,
        outcome: &mut TypeOutcome,
    ) -> SyncResult<()> {
        let loaded = load_rules(object_type, config)?;
        let options = self.resolve_options(object_type, config, loaded).await?;

        let discovered = self.discover(object_type, config.use_uuid).await?;
        info!(object_type = %object_type, discovered = discovered.len(), "inventory received");

        let registered: BTreeSet<String> = self
            .registry
            .hosts(None)
            .await?
            .into_iter()
            .map(|h| h.host)
            .collect();
        let missing = missing_objects(&discovered, &registered);

        if missing.is_empty() {
            info!(object_type = %object_type, "no missing host, registry in sync");
        } else {
            info!(object_type = %object_type, missing = missing.len(), "creating missing hosts");
            self.create_pass(object_type, &options, missing, &mut outcome.added).await?;
        }

        let managed = self.scoped_hosts(&options).await?;
        let failed = self.revalidate(object_type, &options.rules, &managed, &discovered).await?;
        let extra = extra_hosts(&managed, &discovered, failed);

        if extra.is_empty() {
            info!(object_type = %object_type, managed = managed.len(), "no extra host");
            return Ok(());
        }

        if exceeds_threshold(extra.len(), managed.len()) {
            if !self.ctx.force {
                warn!(
                    object_type = %object_type,
                    extra = extra.len(),
                    managed = managed.len(),
                    threshold = ANOMALY_THRESHOLD_PERCENT,
                    "too many extra hosts, removal skipped (use force to override)"
                );
                outcome.removal_held = true;
                return Ok(());
            }
            warn!(object_type = %object_type, extra = extra.len(), managed = managed.len(), "anomaly threshold exceeded, forced removal");
        }

        outcome.removed = self.apply_removal(object_type, &managed, &extra).await;
        Ok(())
    }

    async fn resolve_options(
        &self,
        object_type: ObjectType,
        config: &ObjectTypeConfig,
        loaded: LoadedRules,
    ) -> SyncResult<HostOptions> {
        let proxy_id = match config.proxy.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(name) => Some(
                self.registry
                    .find_proxy(name)
                    .await?
                    .ok_or_else(|| SyncError::configuration(object_type, format!("proxy {name:?} not found")))?,
            ),
            None => None,
        };

        let mut template_ids = Vec::new();
        for name in config.effective_templates() {
            match self.registry.find_template(name).await? {
                Some(id) => push_unique(&mut template_ids, id),
                None => warn!(object_type = %object_type, template = name, "template not found, skipped"),
            }
        }
        if template_ids.is_empty() {
            return Err(SyncError::configuration(object_type, "none of the configured templates exists"));
        }

        let mut group_ids = Vec::new();
        for name in config.effective_groups() {
            if let Some(id) = self.ensure_group(object_type, name).await? {
                push_unique(&mut group_ids, id);
            }
        }
        if group_ids.is_empty() {
            return Err(SyncError::configuration(object_type, "no host group could be resolved or created"));
        }

        let mut optional = Vec::new();
        for (rule, pending) in loaded.optional {
            let target = match pending {
                PendingTarget::Group(name) => self.ensure_group(object_type, &name).await?.map(Target::Group),
                PendingTarget::Template(name) => {
                    let found = self.registry.find_template(&name).await?;
                    if found.is_none() {
                        warn!(object_type = %object_type, template = %name, "optional template not found, rule ignored");
                    }
                    found.map(Target::Template)
                }
            };
            if let Some(target) = target {
                optional.push(OptionalRule { rule, target });
            }
        }

        let macros = config
            .macros
            .iter()
            .map(|(name, value)| Macro {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();

        Ok(HostOptions {
            proxy_id,
            template_ids,
            group_ids,
            macros,
            rules: RuleSet {
                include: loaded.include,
                exclude: loaded.exclude,
                optional,
            },
        })
    }

    /// Looks a group up by name and creates it when absent.
    async fn ensure_group(&self, object_type: ObjectType, name: &str) -> SyncResult<Option<String>> {
        if let Some(id) = self.registry.find_group(name).await? {
            return Ok(Some(id));
        }

        match self.registry.create_group(name).await {
            Ok(id) => {
                info!(object_type = %object_type, group = name, id = %id, "host group created");
                Ok(Some(id))
            }
            Err(e) => match self.registry.find_group(name).await? {
                Some(id) => {
                    debug!(group = name, "host group already exists");
                    Ok(Some(id))
                }
                None => {
                    warn!(object_type = %object_type, group = name, error = %e, "cannot create host group");
                    Ok(None)
                }
            },
        }
    }

    async fn discover(&self, object_type: ObjectType, use_uuid: bool) -> SyncResult<Inventory> {
        let payload = self.agent.query(object_type.discovery_key()).await?;
        parse_discovery(object_type, &payload, use_uuid)
    }

    /// Every candidate runs to completion, so hosts created before a failing
    /// sibling still land in `added`. The first error is returned afterwards.
    async fn create_pass(
        &self,
        object_type: ObjectType,
        options: &HostOptions,
        missing: Vec<&DiscoveredObject>,
        added: &mut Vec<String>,
    ) -> SyncResult<()> {
        let results: Vec<SyncResult<Option<String>>> = stream::iter(missing)
            .map(|object| self.create_one(object_type, options, object))
            .buffer_unordered(self.ctx.workers())
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(Some(name)) => added.push(name),
                Ok(None) => {}
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => debug!(object_type = %object_type, error = %e, "further candidate failure"),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Admits one candidate through the rules and submits it.
    /// `Ok(None)` means rejected or refused by the registry.
    async fn create_one(
        &self,
        object_type: ObjectType,
        options: &HostOptions,
        object: &DiscoveredObject,
    ) -> SyncResult<Option<String>> {
        let evaluator = RuleEvaluator::new(self.agent);
        let rules = &options.rules;

        if !evaluator.passes_inclusion(rules, &object.key, &[]).await? {
            debug!(object_type = %object_type, host = %object.name, "not included");
            return Ok(None);
        }
        if !evaluator.passes_exclusion(rules, &object.key, &[]).await? {
            debug!(object_type = %object_type, host = %object.name, "excluded");
            return Ok(None);
        }

        let mut candidate = options.candidate(object);

        if let Some(method) = object_type.guest_name_method() {
            if let Some(dns) = self.guest_name(method, &object.key).await? {
                candidate = candidate.with_dns(dns);
            }
        }

        for target in evaluator.matched_optional(&rules.optional, &object.key).await? {
            candidate = match target {
                Target::Group(id) => candidate.with_group(&id),
                Target::Template(id) => candidate.with_template(&id),
            };
        }

        if candidate.group_ids.is_empty() {
            error!(object_type = %object_type, host = %candidate.name, "refusing to create a host without group");
            return Ok(None);
        }

        match self.registry.create_host(&candidate).await {
            Ok(id) => {
                info!(object_type = %object_type, host = %candidate.name, id = %id, "host created");
                Ok(Some(candidate.name))
            }
            Err(e) => {
                warn!(object_type = %object_type, host = %candidate.name, error = %e, "host creation rejected");
                Ok(None)
            }
        }
    }

    /// Live guest hostname, when the agent knows a usable one.
    async fn guest_name(&self, method: &str, object_key: &str) -> SyncResult<Option<String>> {
        let answer = self.agent.query(&format!("{method}[{object_key}]")).await?;
        let answer = answer.trim();
        if answer.is_empty() || answer == "null" || answer.starts_with(NOT_SUPPORTED_PREFIX) {
            debug!(object = object_key, "no guest name, keeping discovered name");
            return Ok(None);
        }
        Ok(Some(answer.to_string()))
    }

    async fn scoped_hosts(&self, options: &HostOptions) -> SyncResult<BTreeMap<String, ManagedHost>> {
        let hosts = self.registry.hosts(Some(&options.group_ids)).await?;
        Ok(hosts.into_iter().map(|h| (h.host.clone(), h)).collect())
    }

    /// Keys of common hosts that no longer pass inclusion/exclusion.
    /// Power-dependent methods are skipped so powered-off objects stay.
    async fn revalidate(
        &self,
        object_type: ObjectType,
        rules: &RuleSet,
        managed: &BTreeMap<String, ManagedHost>,
        discovered: &Inventory,
    ) -> SyncResult<BTreeSet<String>> {
        if rules.include.is_empty() && rules.exclude.is_empty() {
            return Ok(BTreeSet::new());
        }

        let skip = object_type.transient_methods();
        let common: Vec<&String> = managed.keys().filter(|k| discovered.contains_key(*k)).collect();

        let verdicts: Vec<Option<String>> = stream::iter(common)
            .map(|key| async move {
                let evaluator = RuleEvaluator::new(self.agent);
                let keep = evaluator.passes_inclusion(rules, key, skip).await?
                    && evaluator.passes_exclusion(rules, key, skip).await?;
                if !keep {
                    info!(object_type = %object_type, host = %key, "host no longer qualifies");
                }
                Ok::<_, SyncError>((!keep).then(|| key.clone()))
            })
            .buffer_unordered(self.ctx.workers())
            .try_collect()
            .await?;

        Ok(verdicts.into_iter().flatten().collect())
    }

    async fn apply_removal(
        &self,
        object_type: ObjectType,
        managed: &BTreeMap<String, ManagedHost>,
        extra: &BTreeSet<String>,
    ) -> Vec<String> {
        let mut removed = Vec::new();

        for key in extra {
            let Some(host) = managed.get(key) else {
                continue;
            };

            match self.ctx.action {
                RemovalAction::Delete => match self.registry.delete_host(&host.id).await {
                    Ok(()) => {
                        info!(object_type = %object_type, host = %host.name, "host deleted");
                        removed.push(host.name.clone());
                    }
                    Err(e) => warn!(object_type = %object_type, host = %host.name, error = %e, "host deletion rejected"),
                },
                RemovalAction::Disable => {
                    if host.status == HostStatus::Disabled {
                        info!(object_type = %object_type, host = %host.name, "host already disabled");
                        continue;
                    }
                    match self.registry.set_host_status(&host.id, HostStatus::Disabled).await {
                        Ok(()) => {
                            info!(object_type = %object_type, host = %host.name, "host disabled");
                            removed.push(host.name.clone());
                        }
                        Err(e) => warn!(object_type = %object_type, host = %host.name, error = %e, "host disable rejected"),
                    }
                }
                RemovalAction::Simulate => {
                    info!(object_type = %object_type, host = %host.name, "would remove host (simulation)");
                }
            }
        }

        removed
    }
}
