//! Access policy layer.
//!
//! Every component of the pipeline acts as a [`Principal`]. What a principal
//! may do is written down in one [`AuthorizationTable`]: a policy document
//! per principal plus the set of component-to-component invocations that are
//! allowed. Keeping the whole capability graph in one table makes it easy to
//! audit (see [`AuthorizationTable::describe`]).
//!
//! ## Names
//!
//! - **Actions** use `category:verb` names, e.g. `object:get`, `record:put`.
//! - **Resources** render as slash paths: `object/<bucket>/<key>`,
//!   `record/<table>/<id>`, `feed/<table>`, `instance/<id>`, `role/<name>`.
//! - **Patterns** in statements match a resource exactly, or by prefix when
//!   they end in `*`.
//!
//! Workers never receive a standing grant. Each launch carries a session
//! policy produced by [`PolicyDocument::worker_session`] that names exactly
//! one object and one record.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    config::PipelineConfig,
    error::{PipelineError, Result},
    types::{InstanceId, ObjectLocator, RecordId},
};

/// Granular verb that can be granted on a resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "object:get")]
    ObjectGet,
    #[serde(rename = "object:head")]
    ObjectHead,
    #[serde(rename = "object:put")]
    ObjectPut,
    #[serde(rename = "record:get")]
    RecordGet,
    #[serde(rename = "record:put")]
    RecordPut,
    #[serde(rename = "feed:read")]
    FeedRead,
    #[serde(rename = "instance:launch")]
    InstanceLaunch,
    #[serde(rename = "instance:describe")]
    InstanceDescribe,
    #[serde(rename = "instance:terminate")]
    InstanceTerminate,
    #[serde(rename = "role:ensure")]
    RoleEnsure,
    #[serde(rename = "role:pass")]
    RolePass,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::ObjectGet => "object:get",
            Action::ObjectHead => "object:head",
            Action::ObjectPut => "object:put",
            Action::RecordGet => "record:get",
            Action::RecordPut => "record:put",
            Action::FeedRead => "feed:read",
            Action::InstanceLaunch => "instance:launch",
            Action::InstanceDescribe => "instance:describe",
            Action::InstanceTerminate => "instance:terminate",
            Action::RoleEnsure => "role:ensure",
            Action::RolePass => "role:pass",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete resource path an action is checked against.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Resource(String);

impl Resource {
    pub fn object(locator: &ObjectLocator) -> Self {
        Self(format!("object/{}/{}", locator.bucket, locator.key))
    }

    pub fn record(table: &str, id: &RecordId) -> Self {
        Self(format!("record/{table}/{id}"))
    }

    pub fn feed(table: &str) -> Self {
        Self(format!("feed/{table}"))
    }

    pub fn instance(id: &InstanceId) -> Self {
        Self(format!("instance/{id}"))
    }

    /// Placeholder for an instance that does not have an id yet.
    pub fn new_instance() -> Self {
        Self("instance/new".to_string())
    }

    pub fn role(name: &str) -> Self {
        Self(format!("role/{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One allow statement: a set of actions over a set of resource patterns.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub actions: BTreeSet<Action>,
    pub resources: Vec<String>,
}

impl Statement {
    pub fn new(
        actions: impl IntoIterator<Item = Action>,
        resources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            actions: actions.into_iter().collect(),
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    fn allows(&self, action: Action, resource: &Resource) -> bool {
        self.actions.contains(&action)
            && self
                .resources
                .iter()
                .any(|pattern| pattern_matches(pattern, resource.as_str()))
    }
}

fn pattern_matches(pattern: &str, resource: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => resource.starts_with(prefix),
        None => pattern == resource,
    }
}

/// Allow-only policy. Anything not matched by a statement is denied.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub statements: Vec<Statement>,
}

impl PolicyDocument {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }

    pub fn allows(&self, action: Action, resource: &Resource) -> bool {
        self.statements
            .iter()
            .any(|statement| statement.allows(action, resource))
    }

    /// Session policy for a worker processing one upload: read the object,
    /// read/write the record, nothing else.
    pub fn worker_session(
        object: &ObjectLocator,
        table: &str,
        record_id: &RecordId,
    ) -> Self {
        Self::new(vec![
            Statement::new(
                [Action::ObjectGet, Action::ObjectHead],
                [Resource::object(object).0],
            ),
            Statement::new(
                [Action::RecordGet, Action::RecordPut],
                [Resource::record(table, record_id).0],
            ),
        ])
    }
}

/// Components that act against providers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    UploadIssuer,
    Ingestion,
    ChangeFeed,
    ChangeHandler,
    Worker,
    /// Publishes deployment artifacts such as the processing script.
    Deployer,
}

impl Principal {
    pub fn as_str(self) -> &'static str {
        match self {
            Principal::UploadIssuer => "upload_issuer",
            Principal::Ingestion => "ingestion",
            Principal::ChangeFeed => "change_feed",
            Principal::ChangeHandler => "change_handler",
            Principal::Worker => "worker",
            Principal::Deployer => "deployer",
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full capability graph of the pipeline.
#[derive(Clone, Debug, Default)]
pub struct AuthorizationTable {
    policies: BTreeMap<Principal, PolicyDocument>,
    invocations: BTreeSet<(Principal, Principal)>,
}

impl AuthorizationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Least-privilege table for the configured bucket, table and role.
    pub fn standard(config: &PipelineConfig) -> Self {
        let bucket = &config.storage.bucket;
        let prefix = &config.storage.object_prefix;
        let table = &config.storage.table_name;
        let role = &config.provision.role_name;

        let uploads = format!("object/{bucket}/{prefix}*");
        let records = format!("record/{table}/*");
        let script = format!("object/{bucket}/{}", config.provision.script_key);

        let mut authz = Self::new();
        authz.grant(
            Principal::UploadIssuer,
            Statement::new([Action::ObjectPut], [uploads.clone()]),
        );
        authz.grant(
            Principal::Ingestion,
            Statement::new([Action::RecordPut], [records.clone()]),
        );
        authz.grant(
            Principal::ChangeHandler,
            Statement::new([Action::FeedRead], [Resource::feed(table).0]),
        );
        authz.grant(
            Principal::ChangeHandler,
            Statement::new([Action::RecordGet], [records]),
        );
        authz.grant(
            Principal::ChangeHandler,
            Statement::new([Action::ObjectHead], [uploads, script.clone()]),
        );
        authz.grant(
            Principal::Deployer,
            Statement::new([Action::ObjectPut], [script]),
        );
        authz.grant(
            Principal::ChangeHandler,
            Statement::new(
                [Action::RoleEnsure, Action::RolePass],
                [Resource::role(role).0],
            ),
        );
        authz.grant(
            Principal::ChangeHandler,
            Statement::new(
                [
                    Action::InstanceLaunch,
                    Action::InstanceDescribe,
                    Action::InstanceTerminate,
                ],
                ["instance/*"],
            ),
        );
        authz.allow_invoke(Principal::ChangeFeed, Principal::ChangeHandler);
        authz
    }

    pub fn grant(&mut self, principal: Principal, statement: Statement) {
        self.policies
            .entry(principal)
            .or_default()
            .statements
            .push(statement);
    }

    pub fn allow_invoke(&mut self, from: Principal, to: Principal) {
        self.invocations.insert((from, to));
    }

    pub fn policy_for(&self, principal: Principal) -> Option<&PolicyDocument> {
        self.policies.get(&principal)
    }

    pub fn is_allowed(
        &self,
        principal: Principal,
        action: Action,
        resource: &Resource,
    ) -> bool {
        self.policies
            .get(&principal)
            .is_some_and(|policy| policy.allows(action, resource))
    }

    pub fn authorize(
        &self,
        principal: Principal,
        action: Action,
        resource: &Resource,
    ) -> Result<()> {
        if self.is_allowed(principal, action, resource) {
            return Ok(());
        }
        warn!(
            target: "uplift::access",
            %principal,
            %action,
            %resource,
            "access denied"
        );
        Err(PipelineError::PermissionDenied(format!(
            "{principal} may not {action} on {resource}"
        )))
    }

    pub fn can_invoke(&self, from: Principal, to: Principal) -> bool {
        self.invocations.contains(&(from, to))
    }

    pub fn ensure_invoke(&self, from: Principal, to: Principal) -> Result<()> {
        if self.can_invoke(from, to) {
            Ok(())
        } else {
            Err(PipelineError::PermissionDenied(format!(
                "{from} may not invoke {to}"
            )))
        }
    }

    /// Flat, sorted listing of every grant and invocation edge.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (principal, policy) in &self.policies {
            for statement in &policy.statements {
                let actions: Vec<&str> =
                    statement.actions.iter().map(|a| a.as_str()).collect();
                lines.push(format!(
                    "{principal}: allow {} on {}",
                    actions.join(","),
                    statement.resources.join(",")
                ));
            }
        }
        for (from, to) in &self.invocations {
            lines.push(format!("{from}: invoke {to}"));
        }
        lines
    }
}

/// A principal bound to the table, handed to components so they can check
/// their own outbound calls.
#[derive(Clone, Debug)]
pub struct AccessGuard {
    table: Arc<AuthorizationTable>,
    principal: Principal,
}

impl AccessGuard {
    pub fn new(table: Arc<AuthorizationTable>, principal: Principal) -> Self {
        Self { table, principal }
    }

    pub fn principal(&self) -> Principal {
        self.principal
    }

    pub fn check(&self, action: Action, resource: &Resource) -> Result<()> {
        self.table.authorize(self.principal, action, resource)
    }
}
