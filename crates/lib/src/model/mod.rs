//! Topology model for fleetlab.
//!
//! The model is a static description of a testbed:
//!
//! ```text
//! Model
//! ├── scope (tags + variables, the root variable store)
//! └── regions (by id)
//!     └── hosts (by id)
//!         └── components (by id)
//! ```
//!
//! Each node carries a [`Scope`] with tags and a scoped variable tree.
//! Tags are inherited down the chain for selection; variables resolve at
//! bind time (see [`bind`]). Hosts additionally carry [`HostData`], a
//! lock-guarded scratch map that operation-phase background tasks write
//! into and the persist stage dumps.

pub mod bind;
pub mod selector;
pub mod variables;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;

use crate::pipeline::action::Workflow;
use crate::pipeline::stage::{
  ActivationBinder, ConfigurationBinder, DisposalBinder, DistributionBinder, InfrastructureBinder, KittingBinder,
  OperatingBinder,
};
use crate::remote::RemoteIdentity;

pub use bind::{BindError, Bootstrap, BoundNode, EnvVars, Registry};
pub use selector::{Selector, SelectorError};
pub use variables::{BinderFn, VarEntry, Variable, VariableError, VariableValue, Variables};

/// Errors from model queries.
#[derive(Debug, Error)]
pub enum ModelError {
  /// Variable accessors require a bound model.
  #[error("model not bound")]
  NotBound,

  /// Selector parsing failed.
  #[error("selector error: {0}")]
  Selector(#[from] SelectorError),

  /// Variable lookup failed.
  #[error("variable error: {0}")]
  Variable(#[from] VariableError),

  /// Region id lookup failed.
  #[error("region not found: {0}")]
  RegionNotFound(String),

  /// Host lookup failed.
  #[error("host not found: {0}")]
  HostNotFound(String),

  /// A bare host id matched hosts in more than one region.
  #[error("host id {id} matched {count} hosts, expected exactly one")]
  AmbiguousHost { id: String, count: usize },

  /// An exactly-one selection matched nothing.
  #[error("selection {regions}/{hosts} matched no hosts")]
  EmptySelection { regions: String, hosts: String },

  /// An exactly-one selection matched several hosts.
  #[error("selection {regions}/{hosts} matched {count} hosts, expected exactly one")]
  AmbiguousSelection {
    regions: String,
    hosts: String,
    count: usize,
  },

  /// No region carries the tag.
  #[error("no region matched tag @{0}")]
  NoRegionForTag(String),

  /// Several regions carry a tag used for an exactly-one lookup.
  #[error("tag @{tag} matched {count} regions, expected exactly one")]
  AmbiguousRegionTag { tag: String, count: usize },

  /// Host has no public address (infrastructure has not expressed it).
  #[error("host {0} has no public address")]
  NoAddress(HostId),
}

/// Fully qualified host address: region id plus host id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostId {
  pub region: String,
  pub host: String,
}

impl HostId {
  pub fn new(region: impl Into<String>, host: impl Into<String>) -> Self {
    Self {
      region: region.into(),
      host: host.into(),
    }
  }
}

impl std::fmt::Display for HostId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.region, self.host)
  }
}

/// Tags and variables carried by every model node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Scope {
  pub tags: Vec<String>,
  pub variables: Variables,
}

/// Per-host scratch data accumulated during the operation phase.
///
/// Shared by handle: background tasks clone the `HostData` and write through
/// the lock while stages keep borrowing the model. The lock is never held
/// across an await.
#[derive(Debug, Clone, Default)]
pub struct HostData(Arc<Mutex<BTreeMap<String, serde_json::Value>>>);

impl HostData {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
    self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Set `key` to `value`, replacing any previous entry.
  pub fn insert(&self, key: impl Into<String>, value: serde_json::Value) {
    self.lock().insert(key.into(), value);
  }

  /// Append `value` to the array at `key`, creating it if absent.
  pub fn append(&self, key: &str, value: serde_json::Value) {
    let mut data = self.lock();
    let entry = data
      .entry(key.to_string())
      .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if let serde_json::Value::Array(items) = entry {
      items.push(value);
    } else {
      *entry = serde_json::Value::Array(vec![value]);
    }
  }

  /// Run `f` against the underlying map while holding the lock.
  pub fn update(&self, f: impl FnOnce(&mut BTreeMap<String, serde_json::Value>)) {
    f(&mut self.lock());
  }

  /// Clone the value at `key` out of the map.
  pub fn get(&self, key: &str) -> Option<serde_json::Value> {
    self.lock().get(key).cloned()
  }

  /// Clone the whole map out.
  pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
    self.lock().clone()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

impl Serialize for HostData {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.snapshot().serialize(serializer)
  }
}

/// A deployable unit staged onto hosts.
#[derive(Debug, Clone, Serialize)]
pub struct Component {
  pub id: String,

  /// Process name on the host; also the kill pattern for teardown.
  pub binary_name: String,

  /// Local config file staged into the per-host config tree.
  pub config_src: Option<PathBuf>,
  pub config_name: Option<String>,

  /// Local control script staged into the kit.
  pub script_src: Option<PathBuf>,
  pub script_name: Option<String>,

  /// Names of PKI identities the component presents and trusts.
  pub public_identity: Option<String>,
  pub private_identity: Option<String>,

  pub scope: Scope,
}

impl Component {
  pub fn new(id: impl Into<String>, binary_name: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      binary_name: binary_name.into(),
      config_src: None,
      config_name: None,
      script_src: None,
      script_name: None,
      public_identity: None,
      private_identity: None,
      scope: Scope::default(),
    }
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.scope.tags.push(tag.into());
    self
  }

  pub fn config(mut self, src: impl Into<PathBuf>, name: impl Into<String>) -> Self {
    self.config_src = Some(src.into());
    self.config_name = Some(name.into());
    self
  }

  pub fn script(mut self, src: impl Into<PathBuf>, name: impl Into<String>) -> Self {
    self.script_src = Some(src.into());
    self.script_name = Some(name.into());
    self
  }

  pub fn identities(mut self, public: impl Into<String>, private: impl Into<String>) -> Self {
    self.public_identity = Some(public.into());
    self.private_identity = Some(private.into());
    self
  }
}

/// One machine in a region.
#[derive(Debug, Clone, Serialize)]
pub struct Host {
  pub id: String,

  /// Filled by the infrastructure phase.
  pub public_ip: String,
  pub private_ip: String,

  pub instance_type: String,
  pub scope: Scope,
  pub components: BTreeMap<String, Component>,
  pub data: HostData,
}

impl Host {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      public_ip: String::new(),
      private_ip: String::new(),
      instance_type: String::new(),
      scope: Scope::default(),
      components: BTreeMap::new(),
      data: HostData::new(),
    }
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.scope.tags.push(tag.into());
    self
  }

  pub fn instance_type(mut self, instance_type: impl Into<String>) -> Self {
    self.instance_type = instance_type.into();
    self
  }

  pub fn component(mut self, component: Component) -> Self {
    self.components.insert(component.id.clone(), component);
    self
  }
}

/// A deployment region holding hosts.
#[derive(Debug, Clone, Serialize)]
pub struct Region {
  pub id: String,

  /// Availability zone or equivalent placement hint, passed to provisioning.
  pub az: String,

  pub scope: Scope,
  pub hosts: BTreeMap<String, Host>,
}

impl Region {
  pub fn new(id: impl Into<String>, az: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      az: az.into(),
      scope: Scope::default(),
      hosts: BTreeMap::new(),
    }
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.scope.tags.push(tag.into());
    self
  }

  pub fn host(mut self, host: Host) -> Self {
    self.hosts.insert(host.id.clone(), host);
    self
  }
}

/// The complete testbed description.
///
/// Built by topology code, registered in a [`Registry`], and usable by the
/// pipeline only after a successful bind.
#[derive(Default, Serialize)]
pub struct Model {
  /// Registry name, stamped at bind time.
  pub id: String,

  pub scope: Scope,
  pub regions: BTreeMap<String, Region>,

  /// Bind-time hooks, run before variable resolution.
  #[serde(skip)]
  pub bootstraps: Vec<Box<dyn Bootstrap>>,

  /// Per-phase stage binders, executed in list order.
  #[serde(skip)]
  pub infrastructure: Vec<InfrastructureBinder>,
  #[serde(skip)]
  pub configuration: Vec<ConfigurationBinder>,
  #[serde(skip)]
  pub kitting: Vec<KittingBinder>,
  #[serde(skip)]
  pub distribution: Vec<DistributionBinder>,
  #[serde(skip)]
  pub activation: Vec<ActivationBinder>,
  #[serde(skip)]
  pub operation: Vec<OperatingBinder>,
  #[serde(skip)]
  pub disposal: Vec<DisposalBinder>,

  /// Named workflows invocable by the CLI.
  #[serde(skip)]
  pub actions: BTreeMap<String, Workflow>,

  bound: bool,
}

impl std::fmt::Debug for Model {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Model")
      .field("id", &self.id)
      .field("regions", &self.regions)
      .field("actions", &self.actions.keys().collect::<Vec<_>>())
      .field("bound", &self.bound)
      .finish_non_exhaustive()
  }
}

impl Model {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn region(mut self, region: Region) -> Self {
    self.regions.insert(region.id.clone(), region);
    self
  }

  pub fn is_bound(&self) -> bool {
    self.bound
  }

  pub(crate) fn mark_bound(&mut self) {
    self.bound = true;
  }

  /// Select hosts by a region selector and a host selector.
  ///
  /// Returns matches in deterministic region/host order; an empty result is
  /// not an error here, callers decide whether that is acceptable.
  pub fn select_hosts(&self, regions: &str, hosts: &str) -> Result<Vec<HostId>, ModelError> {
    let region_sel = Selector::parse(regions)?;
    let host_sel = Selector::parse(hosts)?;

    let mut out = Vec::new();
    for (region_id, region) in &self.regions {
      let region_tags: Vec<&str> = self
        .scope
        .tags
        .iter()
        .chain(region.scope.tags.iter())
        .map(String::as_str)
        .collect();
      if !region_sel.matches(region_id, region_tags.iter().copied()) {
        continue;
      }
      for (host_id, host) in &region.hosts {
        let host_tags = region_tags.iter().copied().chain(host.scope.tags.iter().map(String::as_str));
        if host_sel.matches(host_id, host_tags) {
          out.push(HostId::new(region_id, host_id));
        }
      }
    }
    Ok(out)
  }

  /// Select hosts, treating an empty match as an error.
  pub fn select_nonempty(&self, regions: &str, hosts: &str) -> Result<Vec<HostId>, ModelError> {
    let matched = self.select_hosts(regions, hosts)?;
    if matched.is_empty() {
      return Err(ModelError::EmptySelection {
        regions: regions.to_string(),
        hosts: hosts.to_string(),
      });
    }
    Ok(matched)
  }

  /// Select exactly one host; zero or several matches are errors.
  pub fn select_host(&self, regions: &str, hosts: &str) -> Result<HostId, ModelError> {
    let mut matched = self.select_hosts(regions, hosts)?;
    match matched.len() {
      1 => Ok(matched.remove(0)),
      0 => Err(ModelError::EmptySelection {
        regions: regions.to_string(),
        hosts: hosts.to_string(),
      }),
      count => Err(ModelError::AmbiguousSelection {
        regions: regions.to_string(),
        hosts: hosts.to_string(),
        count,
      }),
    }
  }

  /// All hosts in deterministic region/host order.
  pub fn all_hosts(&self) -> Vec<HostId> {
    self
      .regions
      .iter()
      .flat_map(|(region_id, region)| {
        region.hosts.keys().map(move |host_id| HostId::new(region_id, host_id))
      })
      .collect()
  }

  pub fn region_by_id(&self, id: &str) -> Result<&Region, ModelError> {
    self.regions.get(id).ok_or_else(|| ModelError::RegionNotFound(id.to_string()))
  }

  pub fn host(&self, id: &HostId) -> Result<&Host, ModelError> {
    self
      .regions
      .get(&id.region)
      .and_then(|region| region.hosts.get(&id.host))
      .ok_or_else(|| ModelError::HostNotFound(id.to_string()))
  }

  pub fn host_mut(&mut self, id: &HostId) -> Result<&mut Host, ModelError> {
    self
      .regions
      .get_mut(&id.region)
      .and_then(|region| region.hosts.get_mut(&id.host))
      .ok_or_else(|| ModelError::HostNotFound(id.to_string()))
  }

  /// Look up a host by bare id across all regions; exactly one must match.
  pub fn host_by_id(&self, host_id: &str) -> Result<(HostId, &Host), ModelError> {
    let mut matched = Vec::new();
    for (region_id, region) in &self.regions {
      if let Some(host) = region.hosts.get(host_id) {
        matched.push((HostId::new(region_id, host_id), host));
      }
    }
    match matched.len() {
      1 => Ok(matched.remove(0)),
      0 => Err(ModelError::HostNotFound(host_id.to_string())),
      count => Err(ModelError::AmbiguousHost {
        id: host_id.to_string(),
        count,
      }),
    }
  }

  /// Look up the single region carrying `tag`.
  pub fn region_by_tag(&self, tag: &str) -> Result<&Region, ModelError> {
    let mut matched = Vec::new();
    for region in self.regions.values() {
      let inherited = self.scope.tags.iter().chain(region.scope.tags.iter());
      if inherited.map(String::as_str).any(|t| t == tag) {
        matched.push(region);
      }
    }
    match matched.len() {
      1 => Ok(matched.remove(0)),
      0 => Err(ModelError::NoRegionForTag(tag.to_string())),
      count => Err(ModelError::AmbiguousRegionTag {
        tag: tag.to_string(),
        count,
      }),
    }
  }

  /// All components carrying `tag` (inherited down the full scope chain),
  /// as (host, component id) pairs.
  pub fn components_by_tag(&self, tag: &str) -> Vec<(HostId, String)> {
    let mut out = Vec::new();
    for (region_id, region) in &self.regions {
      for (host_id, host) in &region.hosts {
        for (component_id, component) in &host.components {
          let inherited = self
            .scope
            .tags
            .iter()
            .chain(region.scope.tags.iter())
            .chain(host.scope.tags.iter())
            .chain(component.scope.tags.iter());
          if inherited.map(String::as_str).any(|t| t == tag) {
            out.push((HostId::new(region_id, host_id), component_id.clone()));
          }
        }
      }
    }
    out
  }

  /// Public address of a host; infrastructure must have expressed it.
  pub fn address(&self, id: &HostId) -> Result<String, ModelError> {
    let host = self.host(id)?;
    if host.public_ip.is_empty() {
      return Err(ModelError::NoAddress(id.clone()));
    }
    Ok(host.public_ip.clone())
  }

  /// Restore expressed per-host state (addresses and accumulated data)
  /// from a persisted model dump.
  ///
  /// A freshly bound model has no addresses; resuming a run pulls them
  /// back from `model.json`. Hosts absent from the dump are left alone,
  /// and dump entries with no matching host are ignored.
  pub fn absorb_state(&mut self, dump: &serde_json::Value) {
    for region in self.regions.values_mut() {
      let Some(hosts) = dump["regions"][&region.id]["hosts"].as_object() else {
        continue;
      };
      for host in region.hosts.values_mut() {
        let Some(entry) = hosts.get(&host.id) else {
          continue;
        };
        if let Some(ip) = entry["public_ip"].as_str()
          && !ip.is_empty()
        {
          host.public_ip = ip.to_string();
        }
        if let Some(ip) = entry["private_ip"].as_str()
          && !ip.is_empty()
        {
          host.private_ip = ip.to_string();
        }
        if let Some(data) = entry["data"].as_object() {
          for (key, value) in data {
            host.data.insert(key.clone(), value.clone());
          }
        }
      }
    }
  }

  /// Root variable lookup; requires a bound model.
  pub fn var(&self, path: &str) -> Result<&VariableValue, ModelError> {
    self.check_bound()?;
    Ok(self.scope.variables.must(path)?)
  }

  /// Optional root variable lookup; requires a bound model.
  pub fn var_opt(&self, path: &str) -> Result<Option<&VariableValue>, ModelError> {
    self.check_bound()?;
    Ok(self.scope.variables.get(path))
  }

  pub fn var_string(&self, path: &str) -> Result<String, ModelError> {
    self.check_bound()?;
    Ok(self.scope.variables.get_string(path)?)
  }

  pub fn var_bool(&self, path: &str) -> Result<bool, ModelError> {
    self.check_bound()?;
    Ok(self.scope.variables.get_bool(path)?)
  }

  pub fn var_int(&self, path: &str) -> Result<i64, ModelError> {
    self.check_bound()?;
    Ok(self.scope.variables.get_int(path)?)
  }

  pub fn var_duration(&self, path: &str) -> Result<std::time::Duration, ModelError> {
    self.check_bound()?;
    Ok(self.scope.variables.get_duration(path)?)
  }

  /// The ssh identity used for all remote operations, from `remote/username`
  /// and the optional `remote/key_path`.
  pub fn remote_identity(&self) -> Result<RemoteIdentity, ModelError> {
    let username = self.var_string("remote/username")?;
    let key_path = self
      .var_opt("remote/key_path")?
      .and_then(VariableValue::as_str)
      .map(PathBuf::from);
    Ok(RemoteIdentity { username, key_path })
  }

  fn check_bound(&self) -> Result<(), ModelError> {
    if !self.bound {
      return Err(ModelError::NotBound);
    }
    Ok(())
  }
}
