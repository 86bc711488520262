//! Node selection syntax.
//!
//! Selectors address regions and hosts:
//! - `*` matches everything
//! - `@tag` matches nodes carrying the tag (tags are inherited down the
//!   model -> region -> host scope chain)
//! - `#id` or a bare id matches by exact id

use thiserror::Error;

/// Errors from selector parsing.
#[derive(Debug, Error)]
pub enum SelectorError {
  #[error("empty selector")]
  Empty,

  #[error("invalid selector: {0}")]
  Invalid(String),
}

/// A parsed selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
  All,
  Tag(String),
  Id(String),
}

impl Selector {
  /// Parse a selector literal.
  pub fn parse(literal: &str) -> Result<Selector, SelectorError> {
    match literal {
      "" => Err(SelectorError::Empty),
      "*" => Ok(Selector::All),
      _ => {
        if let Some(tag) = literal.strip_prefix('@') {
          if tag.is_empty() {
            return Err(SelectorError::Invalid(literal.to_string()));
          }
          return Ok(Selector::Tag(tag.to_string()));
        }
        if let Some(id) = literal.strip_prefix('#') {
          if id.is_empty() {
            return Err(SelectorError::Invalid(literal.to_string()));
          }
          return Ok(Selector::Id(id.to_string()));
        }
        Ok(Selector::Id(literal.to_string()))
      }
    }
  }

  /// Returns true if a node with the given id and inherited tags matches.
  pub fn matches<'a>(&self, id: &str, tags: impl IntoIterator<Item = &'a str>) -> bool {
    match self {
      Selector::All => true,
      Selector::Id(want) => id == want,
      Selector::Tag(want) => tags.into_iter().any(|tag| tag == want),
    }
  }
}

impl std::fmt::Display for Selector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Selector::All => write!(f, "*"),
      Selector::Tag(tag) => write!(f, "@{}", tag),
      Selector::Id(id) => write!(f, "#{}", id),
    }
  }
}
