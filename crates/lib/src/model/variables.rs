//! Scoped variable store.
//!
//! Every node in the topology (model, region, host, component) carries a
//! variable tree. Values are typed, paths are slash-separated
//! (`remote/username`), and nesting is expressed by the tree itself.
//! Resolution semantics (defaults, global fallback, required checks) live in
//! the bind walk; this module only provides the store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bind::BoundNode;

/// Errors from variable store operations.
#[derive(Debug, Error)]
pub enum VariableError {
  /// A required lookup found no value.
  #[error("variable not set: {0}")]
  Missing(String),

  /// A typed lookup found a value of a different variant.
  #[error("variable {path} is {actual}, expected {expected}")]
  WrongType {
    path: String,
    expected: &'static str,
    actual: &'static str,
  },

  /// An empty path or empty path segment was given.
  #[error("invalid variable path: {0:?}")]
  InvalidPath(String),

  /// A path segment traverses an existing value leaf.
  #[error("variable path {0} traverses a value")]
  NotANamespace(String),
}

/// A typed variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableValue {
  String(String),
  Bool(bool),
  Int(i64),
  Duration(Duration),
}

impl VariableValue {
  /// Parse a value from its CLI literal form.
  ///
  /// `true`/`false` parse as booleans, integers as ints, humantime literals
  /// (`30s`, `5m`) as durations, and anything else as a string. Bare numbers
  /// parse as ints, so durations need a unit suffix.
  pub fn parse(literal: &str) -> VariableValue {
    match literal {
      "true" => return VariableValue::Bool(true),
      "false" => return VariableValue::Bool(false),
      _ => {}
    }
    if let Ok(n) = literal.parse::<i64>() {
      return VariableValue::Int(n);
    }
    if let Ok(d) = humantime::parse_duration(literal) {
      return VariableValue::Duration(d);
    }
    VariableValue::String(literal.to_string())
  }

  /// The variant name, for error messages.
  pub fn kind(&self) -> &'static str {
    match self {
      VariableValue::String(_) => "string",
      VariableValue::Bool(_) => "bool",
      VariableValue::Int(_) => "int",
      VariableValue::Duration(_) => "duration",
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      VariableValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      VariableValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      VariableValue::Int(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_duration(&self) -> Option<Duration> {
    match self {
      VariableValue::Duration(d) => Some(*d),
      _ => None,
    }
  }
}

impl std::fmt::Display for VariableValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      VariableValue::String(s) => write!(f, "{}", s),
      VariableValue::Bool(b) => write!(f, "{}", b),
      VariableValue::Int(n) => write!(f, "{}", n),
      VariableValue::Duration(d) => write!(f, "{}", humantime::format_duration(*d)),
    }
  }
}

/// Callback invoked during bind with the resolved value and the node the
/// variable was resolved at.
///
/// Binders run while the node's own variable tree is detached for resolution,
/// so they must write to node fields, not back into the scope being resolved.
pub type BinderFn = Arc<dyn Fn(&VariableValue, &mut BoundNode<'_>) + Send + Sync>;

/// A declared variable.
///
/// `value` is the resolved (or put) value; the remaining fields drive the
/// bind-time resolution walk.
#[derive(Clone, Serialize)]
pub struct Variable {
  /// Resolution must produce a value or bind fails.
  pub required: bool,

  /// Used when no value was put and, for scoped variables, before any
  /// global fallback.
  pub default: Option<VariableValue>,

  /// Never rendered in logs or displays.
  pub sensitive: bool,

  /// Scoped variables resolve locally; unscoped ones read the root store.
  pub scoped: bool,

  /// Scoped and unresolved after the local default: fall back to the same
  /// path in the root store.
  pub global_fallback: bool,

  /// The current value, if put or resolved.
  pub value: Option<VariableValue>,

  /// Invoked at bind time when resolution produced a value.
  #[serde(skip)]
  pub binder: Option<BinderFn>,
}

impl Default for Variable {
  fn default() -> Self {
    Self {
      required: false,
      default: None,
      sensitive: false,
      scoped: true,
      global_fallback: false,
      value: None,
      binder: None,
    }
  }
}

impl Variable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn required(mut self) -> Self {
    self.required = true;
    self
  }

  pub fn default_value(mut self, value: VariableValue) -> Self {
    self.default = Some(value);
    self
  }

  pub fn sensitive(mut self) -> Self {
    self.sensitive = true;
    self
  }

  pub fn unscoped(mut self) -> Self {
    self.scoped = false;
    self
  }

  pub fn global_fallback(mut self) -> Self {
    self.global_fallback = true;
    self
  }

  pub fn binder(mut self, f: impl Fn(&VariableValue, &mut BoundNode<'_>) + Send + Sync + 'static) -> Self {
    self.binder = Some(Arc::new(f));
    self
  }

  /// Render the value for logging, honoring `sensitive`.
  pub fn render(&self) -> String {
    match &self.value {
      Some(_) if self.sensitive => "<redacted>".to_string(),
      Some(v) => v.to_string(),
      None => "<unset>".to_string(),
    }
  }
}

impl std::fmt::Debug for Variable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Variable")
      .field("required", &self.required)
      .field("default", &self.default)
      .field("sensitive", &self.sensitive)
      .field("scoped", &self.scoped)
      .field("global_fallback", &self.global_fallback)
      .field("value", &self.value)
      .field("binder", &self.binder.as_ref().map(|_| "<fn>"))
      .finish()
  }
}

/// One entry in a variable tree: a declared variable or a nested namespace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VarEntry {
  Leaf(Variable),
  Nested(Variables),
}

/// A tree of variables keyed by path segment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Variables {
  entries: BTreeMap<String, VarEntry>,
}

impl Variables {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Declare a variable at `path`, creating intermediate namespaces.
  ///
  /// Replaces any existing declaration at that path.
  pub fn declare(&mut self, path: &str, var: Variable) -> Result<(), VariableError> {
    let (parent, leaf) = self.parent_mut(path)?;
    parent.entries.insert(leaf.to_string(), VarEntry::Leaf(var));
    Ok(())
  }

  /// Put a value at `path`.
  ///
  /// Sets the value on an existing declaration, or creates a plain
  /// declaration holding the value when the path is new.
  pub fn put(&mut self, path: &str, value: VariableValue) -> Result<(), VariableError> {
    let (parent, leaf) = self.parent_mut(path)?;
    match parent.entries.get_mut(leaf) {
      Some(VarEntry::Leaf(var)) => var.value = Some(value),
      Some(VarEntry::Nested(_)) => return Err(VariableError::NotANamespace(path.to_string())),
      None => {
        let var = Variable {
          value: Some(value),
          ..Variable::default()
        };
        parent.entries.insert(leaf.to_string(), VarEntry::Leaf(var));
      }
    }
    Ok(())
  }

  /// Returns the value at `path`, if one is set.
  pub fn get(&self, path: &str) -> Option<&VariableValue> {
    self.leaf(path).and_then(|var| var.value.as_ref())
  }

  /// Returns true if a value is set at `path`.
  pub fn has(&self, path: &str) -> bool {
    self.get(path).is_some()
  }

  /// Returns the value at `path` or an error naming the path.
  pub fn must(&self, path: &str) -> Result<&VariableValue, VariableError> {
    self.get(path).ok_or_else(|| VariableError::Missing(path.to_string()))
  }

  /// Returns the string value at `path`; absence or another variant is an error.
  pub fn get_string(&self, path: &str) -> Result<String, VariableError> {
    let value = self.must(path)?;
    value
      .as_str()
      .map(str::to_string)
      .ok_or_else(|| wrong_type(path, "string", value))
  }

  /// Returns the bool value at `path`; absence or another variant is an error.
  pub fn get_bool(&self, path: &str) -> Result<bool, VariableError> {
    let value = self.must(path)?;
    value.as_bool().ok_or_else(|| wrong_type(path, "bool", value))
  }

  /// Returns the int value at `path`; absence or another variant is an error.
  pub fn get_int(&self, path: &str) -> Result<i64, VariableError> {
    let value = self.must(path)?;
    value.as_int().ok_or_else(|| wrong_type(path, "int", value))
  }

  /// Returns the duration value at `path`; absence or another variant is an error.
  pub fn get_duration(&self, path: &str) -> Result<Duration, VariableError> {
    let value = self.must(path)?;
    value.as_duration().ok_or_else(|| wrong_type(path, "duration", value))
  }

  /// Returns the declaration at `path`, if any.
  pub fn leaf(&self, path: &str) -> Option<&Variable> {
    let mut node = self;
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
      match node.entries.get(segment)? {
        VarEntry::Leaf(var) if segments.peek().is_none() => return Some(var),
        VarEntry::Nested(nested) if segments.peek().is_some() => node = nested,
        _ => return None,
      }
    }
    None
  }

  /// Visit every declaration with its full path, mutably.
  ///
  /// Used by the bind-time resolution walk.
  pub fn for_each_leaf_mut(&mut self, f: &mut impl FnMut(&str, &mut Variable)) {
    let mut prefix = String::new();
    self.walk_mut(&mut prefix, f);
  }

  fn walk_mut(&mut self, prefix: &mut String, f: &mut impl FnMut(&str, &mut Variable)) {
    for (name, entry) in self.entries.iter_mut() {
      let saved = prefix.len();
      if !prefix.is_empty() {
        prefix.push('/');
      }
      prefix.push_str(name);
      match entry {
        VarEntry::Leaf(var) => f(prefix, var),
        VarEntry::Nested(nested) => nested.walk_mut(prefix, f),
      }
      prefix.truncate(saved);
    }
  }

  /// Walk to the parent namespace of `path`, creating missing namespaces.
  fn parent_mut<'s, 'p>(&'s mut self, path: &'p str) -> Result<(&'s mut Variables, &'p str), VariableError> {
    if path.is_empty() || path.split('/').any(str::is_empty) {
      return Err(VariableError::InvalidPath(path.to_string()));
    }
    let (namespace, leaf) = match path.rsplit_once('/') {
      Some((ns, leaf)) => (ns, leaf),
      None => return Ok((self, path)),
    };

    let mut node = self;
    for segment in namespace.split('/') {
      node = match node
        .entries
        .entry(segment.to_string())
        .or_insert_with(|| VarEntry::Nested(Variables::new()))
      {
        VarEntry::Nested(nested) => nested,
        VarEntry::Leaf(_) => return Err(VariableError::NotANamespace(path.to_string())),
      };
    }
    Ok((node, leaf))
  }
}

fn wrong_type(path: &str, expected: &'static str, actual: &VariableValue) -> VariableError {
  VariableError::WrongType {
    path: path.to_string(),
    expected,
    actual: actual.kind(),
  }
}
