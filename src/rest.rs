//! REST-style backend speaking the PostgREST dialect (as served by Supabase).
//!
//! Reads are `GET /{table}?select=..&col=op.value&order=..&limit=..&offset=..`;
//! writes use `POST`, `PATCH` and `DELETE` with `Prefer: return=representation`
//! so the affected rows come back. A non-default schema is selected with the
//! `Accept-Profile` / `Content-Profile` headers, which is also how catalog
//! views in `information_schema` are reached when the server exposes them.

use crate::backend::{InsertOutcome, QueryBackend, QueryResult, QueryRow, Record};
use crate::builder::validate_ident;
use crate::config::RestConfig;
use crate::error::{DbError, Result};
use crate::filter::{FilterOp, FilterSet, Predicate};
use crate::query::QuerySpec;
use crate::value::Scalar;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const RETURN_REPRESENTATION: &str = "return=representation";

pub struct RestBackend {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| DbError::Configuration("API key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| DbError::Configuration("API key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.rest_url(),
            timeout: config.timeout,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(RestConfig::from_env()?)
    }

    fn request(&self, method: Method, table: &str, schema: Option<&str>) -> Result<RequestBuilder> {
        let table = validate_ident(table)?;
        let mut request = self
            .client
            .request(method.clone(), format!("{}/{}", self.base_url, table));

        if let Some(schema) = schema {
            let header = if method == Method::GET {
                "Accept-Profile"
            } else {
                "Content-Profile"
            };
            request = request.header(header, validate_ident(schema)?);
        }

        Ok(request)
    }

    async fn send(&self, what: &str, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await.map_err(|e| self.transport_error(what, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(what, e))?;

        debug!(status = %status, what, "rest response");

        if !status.is_success() {
            return Err(error_from_response(status, &body));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn transport_error(&self, what: &str, err: reqwest::Error) -> DbError {
        if err.is_timeout() {
            DbError::timeout(what, self.timeout)
        } else {
            DbError::Http(err)
        }
    }
}

/// Query parameter for one predicate
pub fn predicate_param(predicate: &Predicate) -> (String, String) {
    let value = match (predicate.op, &predicate.value) {
        // `eq.null` would compare with the text "null"
        (FilterOp::Eq, Scalar::Null) => "is.null".to_string(),
        (FilterOp::Neq, Scalar::Null) => "not.is.null".to_string(),
        (op, value) => format!("{}.{}", op.tag(), value.to_param()),
    };
    (predicate.column.clone(), value)
}

/// Query parameters for a filter set, equality filters first
pub fn filter_params(filters: &FilterSet) -> Vec<(String, String)> {
    filters.predicates().map(|p| predicate_param(&p)).collect()
}

/// Query parameters for a read
pub fn select_params(spec: &QuerySpec) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), spec.select.join(","))];
    params.extend(filter_params(&spec.filters));

    if let Some(order) = &spec.order {
        params.push((
            "order".to_string(),
            format!("{}.{}", order.column, order.direction.tag()),
        ));
    }
    if let Some(limit) = spec.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = spec.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }

    params
}

/// Turn a failed response into a backend error, keeping the body
pub fn error_from_response(status: StatusCode, body: &str) -> DbError {
    match serde_json::from_str::<Value>(body) {
        Ok(payload) => {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| payload.to_string());
            DbError::backend_with_payload(format!("{} ({})", message, status), payload)
        }
        Err(_) if body.trim().is_empty() => DbError::backend(format!("request failed ({})", status)),
        Err(_) => DbError::backend(format!("{} ({})", body.trim(), status)),
    }
}

/// Rows from a response body: an array of objects, a single object, or nothing
pub fn rows_from_body(body: Value) -> Result<QueryResult> {
    match body {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(QueryRow::from(map)),
                other => Err(DbError::backend(format!("unexpected row shape: {}", other))),
            })
            .collect(),
        Value::Object(map) => Ok(vec![QueryRow::from(map)]),
        other => Err(DbError::backend(format!("unexpected response body: {}", other))),
    }
}

#[async_trait]
impl QueryBackend for RestBackend {
    fn name(&self) -> &'static str {
        "rest"
    }

    fn operators(&self) -> &'static [FilterOp] {
        &FilterOp::ALL
    }

    async fn select(&self, spec: &QuerySpec) -> Result<QueryResult> {
        spec.validate()?;
        let request = self
            .request(Method::GET, &spec.table, spec.schema.as_deref())?
            .query(&select_params(spec));

        rows_from_body(self.send(&format!("select on {}", spec.table), request).await?)
    }

    async fn insert(&self, table: &str, record: &Record) -> Result<InsertOutcome> {
        let request = self
            .request(Method::POST, table, None)?
            .header("Prefer", RETURN_REPRESENTATION)
            .json(record);

        let rows = rows_from_body(self.send(&format!("insert into {}", table), request).await?)?;
        Ok(match rows.into_iter().next() {
            Some(row) => InsertOutcome::Inserted(row),
            None => InsertOutcome::NoDataReturned,
        })
    }

    async fn update(
        &self,
        table: &str,
        values: &Record,
        filters: &FilterSet,
    ) -> Result<QueryResult> {
        filters.require_any("update")?;
        let request = self
            .request(Method::PATCH, table, None)?
            .header("Prefer", RETURN_REPRESENTATION)
            .query(&filter_params(filters))
            .json(values);

        rows_from_body(self.send(&format!("update of {}", table), request).await?)
    }

    async fn delete(&self, table: &str, filters: &FilterSet) -> Result<QueryResult> {
        filters.require_any("delete")?;
        let request = self
            .request(Method::DELETE, table, None)?
            .header("Prefer", RETURN_REPRESENTATION)
            .query(&filter_params(filters));

        rows_from_body(self.send(&format!("delete from {}", table), request).await?)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortDirection;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response and hand back the raw request
    async fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..head_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= head_end + 4 + content_length
    }

    fn backend(url: &str) -> RestBackend {
        RestBackend::new(RestConfig::new(url, "test-key").with_timeout(Duration::from_millis(500)))
            .unwrap()
    }

    #[test]
    fn test_select_params() {
        let spec = QuerySpec::new("users")
            .select(vec!["id", "email"])
            .where_eq("role", Scalar::Text("admin".into()))
            .where_pred(Predicate::new("email", FilterOp::Like, Scalar::Text("%example.com".into())))
            .order_by("id", SortDirection::Desc)
            .limit(10)
            .offset(20);

        let params = select_params(&spec);

        assert_eq!(
            params,
            vec![
                ("select".to_string(), "id,email".to_string()),
                ("role".to_string(), "eq.admin".to_string()),
                ("email".to_string(), "like.%example.com".to_string()),
                ("order".to_string(), "id.desc".to_string()),
                ("limit".to_string(), "10".to_string()),
                ("offset".to_string(), "20".to_string()),
            ]
        );
    }

    #[test]
    fn test_null_equality_params() {
        assert_eq!(
            predicate_param(&Predicate::eq("deleted_at", Scalar::Null)).1,
            "is.null"
        );
        assert_eq!(
            predicate_param(&Predicate::new("deleted_at", FilterOp::Neq, Scalar::Null)).1,
            "not.is.null"
        );
        assert_eq!(
            predicate_param(&Predicate::new("active", FilterOp::Is, Scalar::Bool(true))).1,
            "is.true"
        );
    }

    #[test]
    fn test_error_from_response_keeps_payload() {
        let err = error_from_response(
            StatusCode::NOT_FOUND,
            r#"{"code":"42P01","message":"relation \"public.nope\" does not exist"}"#,
        );

        assert!(err.to_string().contains("relation \"public.nope\" does not exist"));
        assert_eq!(err.payload().unwrap()["code"], "42P01");

        let err = error_from_response(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(err.to_string().contains("upstream down"));
    }

    #[test]
    fn test_rows_from_body() {
        assert!(rows_from_body(Value::Null).unwrap().is_empty());
        assert_eq!(rows_from_body(json!([{"id": 1}, {"id": 2}])).unwrap().len(), 2);
        assert!(rows_from_body(json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_select_over_http() {
        let (url, server) = serve_once("200 OK", r#"[{"id":1,"email":"a@example.com"}]"#).await;
        let backend = backend(&url);

        let rows = backend
            .select(&QuerySpec::new("users").where_eq("id", Scalar::Int(1)))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_string("email"), Some("a@example.com".to_string()));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /rest/v1/users?select=*&id=eq.1 HTTP/1.1"));
        assert!(request.to_lowercase().contains("apikey: test-key"));
    }

    #[tokio::test]
    async fn test_schema_profile_header() {
        let (url, server) = serve_once("200 OK", "[]").await;
        let backend = backend(&url);

        let rows = backend
            .select(&QuerySpec::new("tables").in_schema("information_schema"))
            .await
            .unwrap();

        assert!(rows.is_empty());
        let request = server.await.unwrap().to_lowercase();
        assert!(request.contains("accept-profile: information_schema"));
    }

    #[tokio::test]
    async fn test_backend_error_surfaces() {
        let (url, _server) = serve_once(
            "400 Bad Request",
            r#"{"code":"42703","message":"column users.nope does not exist"}"#,
        )
        .await;
        let backend = backend(&url);

        let err = backend.select(&QuerySpec::new("users")).await.unwrap_err();

        assert!(err.is_backend());
        assert!(err.to_string().contains("column users.nope does not exist"));
        assert_eq!(err.payload().unwrap()["code"], "42703");
    }

    #[tokio::test]
    async fn test_insert_without_echo() {
        let (url, server) = serve_once("201 Created", "").await;
        let backend = backend(&url);
        let record = json!({"title": "New task"}).as_object().cloned().unwrap();

        let outcome = backend.insert("tasks", &record).await.unwrap();

        assert_eq!(outcome, InsertOutcome::NoDataReturned);
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /rest/v1/tasks HTTP/1.1"));
        assert!(request.ends_with(r#"{"title":"New task"}"#));
    }

    #[tokio::test]
    async fn test_delete_without_filters_never_sent() {
        // Nothing listens here; reaching the network would be a different error.
        let backend = backend("http://127.0.0.1:9");

        let err = backend.delete("users", &FilterSet::new()).await.unwrap_err();
        assert!(err.is_validation());

        let values = json!({"role": "x"}).as_object().cloned().unwrap();
        let err = backend
            .update("users", &values, &FilterSet::new())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_timeout_is_backend_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let backend = RestBackend::new(
            RestConfig::new(&url, "k").with_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        let err = backend.select(&QuerySpec::new("users")).await.unwrap_err();

        assert!(err.is_backend());
        assert!(err.to_string().contains("timed out"));
        drop(listener);
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let backend = backend("http://127.0.0.1:9");
        assert!(backend
            .request(Method::GET, "users/../secrets", None)
            .is_err());
    }
}
