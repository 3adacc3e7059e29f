//! Structured description of a listing (index) request.
//!
//! A [`QueryDescriptor`] carries field selection, filters, ordering and paging.
//! It serializes to a deterministic query string which doubles as the
//! listing's cache identity: logically identical descriptors always produce
//! the same string, and different descriptors never do.
//!
//! # Example
//!
//! ```ignore
//! let query = QueryDescriptor::new()
//!     .select("nid")
//!     .select("title")
//!     .filter("type", "article")
//!     .compare("created", Comparison::Greater)
//!     .order_by("created", SortDirection::Desc)
//!     .page(0)
//!     .page_size(10);
//!
//! let articles = store.list("node", &query).await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::form_urlencoded::byte_serialize;

/// Comparison applied to a filter parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
  Equals,
  NotEquals,
  Less,
  LessOrEqual,
  Greater,
  GreaterOrEqual,
  Like,
  In,
}

impl Comparison {
  pub fn as_str(&self) -> &'static str {
    match self {
      Comparison::Equals => "=",
      Comparison::NotEquals => "!=",
      Comparison::Less => "<",
      Comparison::LessOrEqual => "<=",
      Comparison::Greater => ">",
      Comparison::GreaterOrEqual => ">=",
      Comparison::Like => "like",
      Comparison::In => "in",
    }
  }
}

impl FromStr for Comparison {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "=" | "==" | "eq" => Ok(Comparison::Equals),
      "!=" | "<>" | "ne" => Ok(Comparison::NotEquals),
      "<" | "lt" => Ok(Comparison::Less),
      "<=" | "le" => Ok(Comparison::LessOrEqual),
      ">" | "gt" => Ok(Comparison::Greater),
      ">=" | "ge" => Ok(Comparison::GreaterOrEqual),
      "like" => Ok(Comparison::Like),
      "in" => Ok(Comparison::In),
      other => Err(format!("unknown comparison operator: {}", other)),
    }
  }
}

/// Sort direction for an `orderby` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
  #[default]
  Asc,
  Desc,
}

impl SortDirection {
  pub fn as_str(&self) -> &'static str {
    match self {
      SortDirection::Asc => "asc",
      SortDirection::Desc => "desc",
    }
  }
}

impl FromStr for SortDirection {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "asc" => Ok(SortDirection::Asc),
      "desc" => Ok(SortDirection::Desc),
      other => Err(format!("unknown sort direction: {}", other)),
    }
  }
}

/// A server-side listing option: a single value, or per-column values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOption {
  Value(String),
  Columns(BTreeMap<String, String>),
}

const ENTITY_LOAD: &str = "entity_load";

/// A listing request.
///
/// Field selection and ordering keep insertion order; filters and options
/// are kept sorted by name so insertion order never changes the identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDescriptor {
  fields: Vec<String>,
  parameters: BTreeMap<String, String>,
  parameters_op: BTreeMap<String, Comparison>,
  orderby: Vec<(String, SortDirection)>,
  page: Option<u32>,
  page_size: Option<u32>,
  options: BTreeMap<String, QueryOption>,
}

impl QueryDescriptor {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a field to the selection. Selecting a field twice is a no-op.
  pub fn select(mut self, field: impl Into<String>) -> Self {
    let field = field.into();
    if !self.fields.contains(&field) {
      self.fields.push(field);
    }
    self
  }

  /// Filter on `field == value` (or the comparison set with [`compare`](Self::compare)).
  pub fn filter(mut self, field: impl Into<String>, value: impl ToString) -> Self {
    self.parameters.insert(field.into(), value.to_string());
    self
  }

  /// Set the comparison operator used for `field`'s filter.
  pub fn compare(mut self, field: impl Into<String>, op: Comparison) -> Self {
    self.parameters_op.insert(field.into(), op);
    self
  }

  /// Append a sort column. Re-ordering an existing column replaces its direction in place.
  pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
    let field = field.into();
    match self.orderby.iter_mut().find(|(f, _)| *f == field) {
      Some(existing) => existing.1 = direction,
      None => self.orderby.push((field, direction)),
    }
    self
  }

  pub fn page(mut self, page: u32) -> Self {
    self.page = Some(page);
    self
  }

  pub fn page_size(mut self, page_size: u32) -> Self {
    self.page_size = Some(page_size);
    self
  }

  /// Ask the remote store for fully loaded entities instead of partial rows.
  pub fn load_entities(mut self, entity_load: bool) -> Self {
    if entity_load {
      self
        .options
        .insert(ENTITY_LOAD.to_string(), QueryOption::Value("1".to_string()));
    } else {
      self.options.remove(ENTITY_LOAD);
    }
    self
  }

  /// Set a named server option, replacing any previous value.
  pub fn option(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self
      .options
      .insert(name.into(), QueryOption::Value(value.to_string()));
    self
  }

  /// Set one column of a per-column server option.
  pub fn option_column(
    mut self,
    name: impl Into<String>,
    column: impl Into<String>,
    value: impl ToString,
  ) -> Self {
    let name = name.into();
    let (column, value) = (column.into(), value.to_string());
    match self.options.get_mut(&name) {
      Some(QueryOption::Columns(columns)) => {
        columns.insert(column, value);
      }
      _ => {
        let columns = BTreeMap::from([(column, value)]);
        self.options.insert(name, QueryOption::Columns(columns));
      }
    }
    self
  }

  /// Whether the listing returns fully loaded entities.
  pub fn is_fully_loaded(&self) -> bool {
    match self.options.get(ENTITY_LOAD) {
      Some(QueryOption::Value(v)) => !matches!(v.as_str(), "" | "0" | "false"),
      _ => false,
    }
  }

  pub fn options(&self) -> &BTreeMap<String, QueryOption> {
    &self.options
  }

  pub fn fields(&self) -> &[String] {
    &self.fields
  }

  pub fn parameters(&self) -> &BTreeMap<String, String> {
    &self.parameters
  }

  pub fn comparisons(&self) -> &BTreeMap<String, Comparison> {
    &self.parameters_op
  }

  pub fn ordering(&self) -> &[(String, SortDirection)] {
    &self.orderby
  }

  pub fn page_index(&self) -> Option<u32> {
    self.page
  }

  pub fn page_len(&self) -> Option<u32> {
    self.page_size
  }

  /// Deterministic, percent-encoded query string.
  ///
  /// An empty descriptor serializes to an empty string.
  pub fn to_query_string(&self) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !self.fields.is_empty() {
      let fields: Vec<String> = self.fields.iter().map(|f| encode(f)).collect();
      parts.push(format!("fields={}", fields.join(",")));
    }

    for (field, value) in &self.parameters {
      parts.push(format!("parameters[{}]={}", encode(field), encode(value)));
    }

    for (field, op) in &self.parameters_op {
      parts.push(format!(
        "parameters_op[{}]={}",
        encode(field),
        encode(op.as_str())
      ));
    }

    for (field, direction) in &self.orderby {
      parts.push(format!("orderby[{}]={}", encode(field), direction.as_str()));
    }

    for (name, option) in &self.options {
      match option {
        QueryOption::Value(value) => {
          parts.push(format!("options[{}]={}", encode(name), encode(value)));
        }
        QueryOption::Columns(columns) => {
          for (column, value) in columns {
            parts.push(format!(
              "options[{}][{}]={}",
              encode(name),
              encode(column),
              encode(value)
            ));
          }
        }
      }
    }

    if let Some(page) = self.page {
      parts.push(format!("page={}", page));
    }

    if let Some(page_size) = self.page_size {
      parts.push(format!("pagesize={}", page_size));
    }

    parts.join("&")
  }
}

impl fmt::Display for QueryDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_query_string())
  }
}

fn encode(raw: &str) -> String {
  byte_serialize(raw.as_bytes()).collect()
}
