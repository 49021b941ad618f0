use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::api::types::{ban_remaining, detail_entity, list_entities};
use crate::ban::Remaining;
use crate::cache::{CacheKey, Entity, EntityId, EntityKind, ListKey, Mutation, MutationOutcome, Transport};
use crate::config::Config;
use crate::error::FetchError;

/// Dashboard REST API client
#[derive(Clone)]
pub struct HttpClient {
  http: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpClient {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_base_url(
      &config.api.url,
      Config::get_api_token(),
      Duration::from_secs(config.api.timeout_secs),
    )
  }

  pub fn with_base_url(base: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
    let base = Url::parse(base).map_err(|e| eyre!("Invalid API url {}: {}", base, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("API url {} cannot be used as a base", base));
    }

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base, token })
  }

  /// Build `{base}/{segments...}`, keeping any path prefix of the base.
  fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| FetchError::InvalidKey(format!("bad base url {}", self.base)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.http.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  /// Send a request and fail on any non-success status. `kind` and `id`
  /// name the resource for a 404.
  async fn execute(
    &self,
    builder: RequestBuilder,
    what: &str,
    kind: EntityKind,
    id: Option<&EntityId>,
  ) -> Result<Response, FetchError> {
    let response = builder.send().await?;
    let status = response.status();
    debug!(what, %status, "backend responded");

    if !status.is_success() {
      return Err(classify_status(status, what, kind, id));
    }
    Ok(response)
  }

  /// Send a request and return its JSON body, if any.
  async fn send(
    &self,
    builder: RequestBuilder,
    what: &str,
    kind: EntityKind,
    id: Option<&EntityId>,
  ) -> Result<Option<Value>, FetchError> {
    let response = self.execute(builder, what, kind, id).await?;
    decode_body(&response.bytes().await?, what)
  }

  /// Remaining ban time for a user; `None` for a permanent ban.
  pub async fn fetch_remaining(&self, subject: &EntityId) -> Result<Option<Remaining>, FetchError> {
    let id = subject.to_string();
    let url = self.endpoint(&[EntityKind::User.path_segment(), &id, "ban"])?;
    let what = format!("ban status of user {}", id);
    let body = self
      .send(self.request(Method::GET, url), &what, EntityKind::User, Some(subject))
      .await?;
    ban_remaining(body, Utc::now())
  }
}

/// Map a non-success HTTP status to the error taxonomy.
fn classify_status(
  status: StatusCode,
  what: &str,
  kind: EntityKind,
  id: Option<&EntityId>,
) -> FetchError {
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Auth {
      status: status.as_u16(),
    },
    StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound {
      kind,
      id: id.cloned(),
    },
    _ => FetchError::Network(format!("{} failed with HTTP {}", what, status)),
  }
}

/// Parse a response body as JSON. Blank bodies are `None`.
fn decode_body(bytes: &[u8], what: &str) -> Result<Option<Value>, FetchError> {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Ok(None);
  }
  serde_json::from_slice(bytes)
    .map(Some)
    .map_err(|e| FetchError::Decode(format!("{}: {}", what, e)))
}

#[async_trait]
impl Transport for HttpClient {
  async fn fetch_entity(&self, key: &CacheKey) -> Result<Entity, FetchError> {
    let id = key.id.to_string();
    let url = self.endpoint(&[key.kind.path_segment(), &id])?;
    let body = self
      .send(
        self.request(Method::GET, url),
        &key.to_string(),
        key.kind,
        Some(&key.id),
      )
      .await?
      .ok_or_else(|| FetchError::Decode(format!("{} returned an empty body", key)))?;
    detail_entity(key.kind, body)
  }

  async fn fetch_list(&self, key: &ListKey) -> Result<Vec<Entity>, FetchError> {
    let mut url = self.endpoint(&[key.kind.path_segment()])?;
    if !key.filters.is_empty() {
      url.query_pairs_mut().extend_pairs(key.query_pairs());
    }
    let body = self
      .send(self.request(Method::GET, url), &key.description(), key.kind, None)
      .await?;
    list_entities(key.kind, body.unwrap_or(Value::Null))
  }

  async fn create(&self, kind: EntityKind, body: &Value) -> Result<Entity, FetchError> {
    let url = self.endpoint(&[kind.path_segment()])?;
    let what = format!("create {}", kind);
    let body = self
      .send(self.request(Method::POST, url).json(body), &what, kind, None)
      .await?
      .ok_or_else(|| FetchError::Decode(format!("{} returned an empty body", what)))?;
    detail_entity(kind, body)
  }

  async fn send_mutation(
    &self,
    key: &CacheKey,
    mutation: &Mutation,
  ) -> Result<MutationOutcome, FetchError> {
    let id = key.id.to_string();
    let what = format!("{} {}", mutation.label(), key);

    let builder = match mutation {
      Mutation::Update(patch) => self
        .request(Method::PATCH, self.endpoint(&[key.kind.path_segment(), &id])?)
        .json(patch),
      Mutation::Delete => {
        self.request(Method::DELETE, self.endpoint(&[key.kind.path_segment(), &id])?)
      }
      Mutation::Action { name, body } => self
        .request(
          Method::POST,
          self.endpoint(&[key.kind.path_segment(), &id, name])?,
        )
        .json(body),
    };

    let response = self
      .execute(builder, &what, key.kind, Some(&key.id))
      .await?;
    // The status alone confirms a delete; the body is never read
    if matches!(mutation, Mutation::Delete) {
      return Ok(MutationOutcome::Deleted);
    }

    // Some endpoints answer with a bare acknowledgement instead of the entity
    let body = match decode_body(&response.bytes().await?, &what) {
      Ok(Some(body)) => body,
      Ok(None) => return Ok(MutationOutcome::Accepted),
      Err(FetchError::Decode(msg)) => {
        debug!(what = %what, %msg, "mutation acknowledged without an entity");
        return Ok(MutationOutcome::Accepted);
      }
      Err(err) => return Err(err),
    };
    match detail_entity(key.kind, body) {
      Ok(entity) => Ok(MutationOutcome::Saved(entity)),
      Err(FetchError::Decode(_)) => Ok(MutationOutcome::Accepted),
      Err(err) => Err(err),
    }
  }
}
