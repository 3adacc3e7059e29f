use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Method, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{RemoteCall, RemoteRequest, RemoteResponse};
use crate::config::{Config, RemoteConfig};
use crate::entity::{EntityId, EntityRecord};
use crate::error::RemoteError;
use crate::registry::TypeRegistry;

/// Per-type wire details taken from the registry.
#[derive(Debug, Clone)]
struct WireType {
  primary_key: String,
  wrap_writes: bool,
}

/// REST client for a JSON record store.
///
/// Resource layout: `{type}/{id}.json` for single entities and `{type}.json`
/// for create and index.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
  types: Arc<HashMap<String, WireType>>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, registry: &TypeRegistry) -> Result<Self> {
    let raw = config
      .base_url
      .as_deref()
      .ok_or_else(|| eyre!("No remote base_url configured"))?;

    // Url::join replaces the last segment unless the base ends with '/'
    let raw = if raw.ends_with('/') {
      raw.to_string()
    } else {
      format!("{}/", raw)
    };
    let base = Url::parse(&raw).map_err(|e| eyre!("Invalid base_url {}: {}", raw, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let types = registry
      .types()
      .map(|t| {
        (
          t.name.clone(),
          WireType {
            primary_key: t.primary_key.clone(),
            wrap_writes: t.wrap_writes,
          },
        )
      })
      .collect();

    Ok(Self {
      client,
      base,
      token: Config::get_api_token(),
      types: Arc::new(types),
    })
  }

  /// Method and URL for a request.
  ///
  /// Ids are pushed as a single escaped path segment, so an id can never
  /// address a different resource.
  fn endpoint(&self, request: &RemoteRequest) -> Result<(Method, Url), RemoteError> {
    let (method, entity_type, id) = match request {
      RemoteRequest::Retrieve { entity_type, id } => (Method::GET, entity_type, Some(id)),
      RemoteRequest::Create { entity_type, .. } => (Method::POST, entity_type, None),
      RemoteRequest::Update { entity_type, id, .. } => (Method::PUT, entity_type, Some(id)),
      RemoteRequest::Delete { entity_type, id } => (Method::DELETE, entity_type, Some(id)),
      RemoteRequest::Index { entity_type, .. } => (Method::GET, entity_type, None),
    };

    let mut url = self.base.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| RemoteError::new("invalid_url", format!("{} cannot be a base", self.base)))?;
      segments.pop_if_empty();
      match id {
        Some(id) => segments.push(entity_type).push(&format!("{}.json", id)),
        None => segments.push(&format!("{}.json", entity_type)),
      };
    }

    if let RemoteRequest::Index { query, .. } = request {
      let query_string = query.to_query_string();
      if !query_string.is_empty() {
        url.set_query(Some(&query_string));
      }
    }

    Ok((method, url))
  }

  /// JSON body for write requests.
  fn body(&self, request: &RemoteRequest) -> Option<Value> {
    let (entity_type, record) = match request {
      RemoteRequest::Create {
        entity_type,
        record,
      }
      | RemoteRequest::Update {
        entity_type,
        record,
        ..
      } => (entity_type, record),
      _ => return None,
    };

    let wrap = self
      .types
      .get(entity_type)
      .map(|t| t.wrap_writes)
      .unwrap_or(false);

    if wrap {
      Some(json!({ entity_type.as_str(): record.to_json() }))
    } else {
      Some(record.to_json())
    }
  }

  fn primary_key(&self, entity_type: &str) -> Option<&str> {
    self.types.get(entity_type).map(|t| t.primary_key.as_str())
  }

  fn carries_id(&self, record: &EntityRecord) -> bool {
    self
      .primary_key(&record.entity_type)
      .map(|pk| record.id(pk).is_some())
      .unwrap_or(false)
  }

  /// Turn a successful HTTP response into a [`RemoteResponse`].
  fn interpret(
    &self,
    request: &RemoteRequest,
    location: Option<&str>,
    body: &str,
  ) -> Result<RemoteResponse, RemoteError> {
    let entity_type = request.entity_type();
    let parsed: Option<Value> = if body.trim().is_empty() {
      None
    } else {
      Some(
        serde_json::from_str(body)
          .map_err(|e| RemoteError::new("invalid_json", format!("{}: {}", entity_type, e)))?,
      )
    };

    match request {
      RemoteRequest::Retrieve { .. } => parsed
        .and_then(|v| EntityRecord::from_json(entity_type, v))
        .map(RemoteResponse::Record)
        .ok_or_else(|| RemoteError::new("invalid_response", "expected a JSON object")),

      RemoteRequest::Index { .. } => match parsed {
        Some(Value::Array(items)) => Ok(RemoteResponse::Records(
          items
            .into_iter()
            .filter_map(|item| EntityRecord::from_json(entity_type, item))
            .collect(),
        )),
        // Some servers answer an empty index with an object or nothing
        Some(Value::Object(map)) if map.is_empty() => Ok(RemoteResponse::Records(Vec::new())),
        None => Ok(RemoteResponse::Records(Vec::new())),
        Some(_) => Err(RemoteError::new("invalid_response", "expected a JSON array")),
      },

      RemoteRequest::Create { .. } => {
        let record = parsed
          .clone()
          .and_then(|v| EntityRecord::from_json(entity_type, v));
        let id = self
          .created_id(entity_type, parsed.as_ref(), location)
          .ok_or_else(|| RemoteError::new("invalid_response", "create returned no id"))?;
        // Only echo the record back when it is the stored entity, not a receipt.
        let record = record.filter(|r| self.carries_id(r));
        Ok(RemoteResponse::Created { id, record })
      }

      RemoteRequest::Update { .. } => Ok(
        parsed
          .and_then(|v| EntityRecord::from_json(entity_type, v))
          .filter(|r| self.carries_id(r))
          .map(RemoteResponse::Record)
          .unwrap_or(RemoteResponse::Empty),
      ),

      RemoteRequest::Delete { .. } => Ok(RemoteResponse::Empty),
    }
  }

  /// Find the id handed out by a create: primary key, `id`, `uri`, a bare
  /// string or number body, or `Location`.
  fn created_id(
    &self,
    entity_type: &str,
    body: Option<&Value>,
    location: Option<&str>,
  ) -> Option<EntityId> {
    let from_body = body.and_then(|b| {
      let pk = self.primary_key(entity_type);
      pk.and_then(|pk| b.get(pk))
        .and_then(EntityId::from_json)
        .or_else(|| b.get("id").and_then(EntityId::from_json))
        .or_else(|| b.get("uri").and_then(Value::as_str).and_then(id_from_location))
        .or_else(|| b.as_str().and_then(id_from_location))
        .or_else(|| EntityId::from_json(b).filter(|_| b.is_number()))
    });

    from_body.or_else(|| location.and_then(id_from_location))
  }

  async fn execute(self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
    let (method, url) = self.endpoint(&request)?;
    debug!(%method, %url, "remote call");

    let mut builder = self
      .client
      .request(method, url)
      .header(header::ACCEPT, "application/json");

    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }

    if let Some(body) = self.body(&request) {
      builder = builder.json(&body);
    }

    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    let location = response
      .headers()
      .get(header::LOCATION)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let text = response.text().await.map_err(transport_error)?;

    if !status.is_success() {
      return Err(status_error(status, &text));
    }

    self.interpret(&request, location.as_deref(), &text)
  }
}

impl RemoteCall for HttpRemote {
  fn call(&self, request: RemoteRequest) -> BoxFuture<'static, Result<RemoteResponse, RemoteError>> {
    self.clone().execute(request).boxed()
  }
}

/// Last path segment of a resource location, e.g. `.../node/12` -> `12`.
fn id_from_location(location: &str) -> Option<EntityId> {
  let trimmed = location.trim_end_matches('/');
  let last = trimmed.rsplit('/').next()?;
  let last = last.strip_suffix(".json").unwrap_or(last);
  EntityId::parse(last)
}

fn transport_error(e: reqwest::Error) -> RemoteError {
  let code = if e.is_timeout() { "timeout" } else { "transport" };
  let err = RemoteError::new(code, e.to_string());
  match e.status() {
    Some(status) => err.with_status(status.as_u16()),
    None => err,
  }
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
  let detail = if body.trim().is_empty() {
    status
      .canonical_reason()
      .unwrap_or("request failed")
      .to_string()
  } else {
    body.trim().to_string()
  };
  RemoteError::new("http", detail).with_status(status.as_u16())
}
