//! REST client for a hosted CRM org.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::QueryPage;
use crate::{ApiError, ObjectDescribe, OrgApi, OrgCredentials, Query, Record, SaveResult, Session};

/// REST API version used for every data call.
pub const API_VERSION: &str = "v61.0";

/// Maximum records per composite collection request.
pub const COMPOSITE_LIMIT: usize = 200;

/// Client for one org's REST API.
pub struct OrgClient {
    http: Client,
    credentials: Option<OrgCredentials>,
    session: Arc<RwLock<Option<Session>>>,
}

impl OrgClient {
    /// Create an unauthenticated client.
    pub fn new() -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            http,
            credentials: None,
            session: Arc::new(RwLock::new(None)),
        })
    }

    /// Create a client around an existing session (no re-login on expiry).
    pub fn with_session(session: Session) -> Result<Self, ApiError> {
        let client = Self::new()?;
        Ok(Self {
            session: Arc::new(RwLock::new(Some(session))),
            ..client
        })
    }

    /// Create a client and log in with the given credentials. The
    /// credentials are kept so an expired session can be renewed.
    pub async fn connect(credentials: OrgCredentials) -> Result<Self, ApiError> {
        let mut client = Self::new()?;
        client.login(&credentials).await?;
        client.credentials = Some(credentials);
        Ok(client)
    }

    /// Authenticate with the OAuth username-password flow.
    pub async fn login(&self, credentials: &OrgCredentials) -> Result<(), ApiError> {
        let url = format!(
            "{}/services/oauth2/token",
            credentials.login_url.trim_end_matches('/')
        );
        let password = format!("{}{}", credentials.password, credentials.security_token);

        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("username", credentials.username.as_str()),
                ("password", password.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.map_err(|e| {
                ApiError::Auth(format!(
                    "login failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(ApiError::Auth(format!("login failed ({}): {}", status, text)));
        }

        let session: Session = response.json().await?;
        debug!(
            instance = %session.instance_url,
            username = %credentials.username,
            "authenticated with org"
        );

        *self.session.write().await = Some(session);
        Ok(())
    }

    /// The instance URL of the current session.
    pub async fn instance_url(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.instance_url.clone())
    }

    async fn current_session(&self) -> Result<Session, ApiError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| ApiError::Auth("not authenticated".to_string()))
    }

    /// Log in again with the stored credentials.
    /// Returns true if a fresh session was obtained.
    async fn relogin(&self) -> bool {
        let Some(credentials) = &self.credentials else {
            return false;
        };
        match self.login(credentials).await {
            Ok(()) => {
                debug!("renewed expired session");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to renew session");
                false
            }
        }
    }

    fn data_url(session: &Session, path: &str) -> String {
        format!(
            "{}/services/data/{}/{}",
            session.instance_url.trim_end_matches('/'),
            API_VERSION,
            path.trim_start_matches('/')
        )
    }

    /// Send a request built against the current session. A 401 triggers one
    /// re-login and resend.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn(&Client, &Session) -> RequestBuilder,
    {
        let session = self.current_session().await?;
        let response = build(&self.http, &session)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED && self.relogin().await {
            let session = self.current_session().await?;
            return Ok(build(&self.http, &session)
                .bearer_auth(&session.access_token)
                .send()
                .await?);
        }
        Ok(response)
    }

    /// Map error statuses to [`ApiError`]; pass successful responses through.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(ApiError::RateLimited { retry_after_secs });
        }

        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.map_err(|e| {
            ApiError::InvalidResponse(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;

        if status.is_server_error() {
            return Err(ApiError::Server {
                status: status.as_u16(),
                body: text,
            });
        }

        // Standard error body is an array of {errorCode, message}
        if let Ok(errors) = serde_json::from_str::<Vec<ErrorBody>>(&text) {
            if let Some(first) = errors.into_iter().next() {
                return Err(ApiError::Api {
                    code: first.error_code,
                    message: first.message,
                });
            }
        }

        Err(ApiError::InvalidResponse(format!(
            "request failed ({}): {}",
            status, text
        )))
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn collection_request(
        &self,
        method: reqwest::Method,
        object: &str,
        records: &[Record],
    ) -> Result<Vec<SaveResult>, ApiError> {
        let mut results = Vec::with_capacity(records.len());
        for chunk in records.chunks(COMPOSITE_LIMIT) {
            let typed: Vec<Value> = chunk
                .iter()
                .map(|record| {
                    let mut record = record.clone();
                    record.insert("attributes".to_string(), json!({ "type": object }));
                    Value::Object(record)
                })
                .collect();
            let body = json!({ "allOrNone": false, "records": typed });

            let response = self
                .send(|http, session| {
                    http.request(method.clone(), Self::data_url(session, "composite/sobjects"))
                        .json(&body)
                })
                .await?;
            let page: Vec<SaveResult> = Self::handle_response(response).await?;

            if page.len() != chunk.len() {
                return Err(ApiError::InvalidResponse(format!(
                    "expected {} results for {}, got {}",
                    chunk.len(),
                    object,
                    page.len()
                )));
            }
            results.extend(page);
        }
        Ok(results)
    }
}

#[async_trait]
impl OrgApi for OrgClient {
    async fn query(&self, query: &Query) -> Result<Vec<Record>, ApiError> {
        let soql = query.to_soql();
        debug!(object = %query.object, soql = %soql, "running query");

        let response = self
            .send(|http, session| {
                http.get(Self::data_url(session, "query"))
                    .query(&[("q", soql.as_str())])
            })
            .await?;
        let mut page: QueryPage = Self::handle_response(response).await?;
        let mut records = std::mem::take(&mut page.records);

        while !page.done {
            let Some(next) = page.next_records_url.take() else {
                break;
            };
            let response = self
                .send(|http, session| {
                    http.get(format!(
                        "{}{}",
                        session.instance_url.trim_end_matches('/'),
                        next
                    ))
                })
                .await?;
            page = Self::handle_response(response).await?;
            records.append(&mut page.records);
        }

        Ok(records)
    }

    async fn insert_batch(
        &self,
        object: &str,
        records: &[Record],
    ) -> Result<Vec<SaveResult>, ApiError> {
        self.collection_request(reqwest::Method::POST, object, records)
            .await
    }

    async fn update_batch(
        &self,
        object: &str,
        records: &[Record],
    ) -> Result<Vec<SaveResult>, ApiError> {
        self.collection_request(reqwest::Method::PATCH, object, records)
            .await
    }

    async fn create(&self, object: &str, record: &Record) -> Result<String, ApiError> {
        let path = format!("sobjects/{}/", object);
        let response = self
            .send(|http, session| http.post(Self::data_url(session, &path)).json(record))
            .await?;
        let result: SaveResult = Self::handle_response(response).await?;

        match result.id {
            Some(id) if result.success => Ok(id),
            _ => Err(ApiError::Api {
                code: "CREATE_FAILED".to_string(),
                message: result.error_message(),
            }),
        }
    }

    async fn get(&self, object: &str, id: &str) -> Result<Record, ApiError> {
        let path = format!("sobjects/{}/{}", object, id);
        let response = self
            .send(|http, session| http.get(Self::data_url(session, &path)))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                object: object.to_string(),
                id: id.to_string(),
            });
        }

        Self::handle_response(response).await
    }

    async fn describe(&self, object: &str) -> Result<ObjectDescribe, ApiError> {
        let path = format!("sobjects/{}/describe", object);
        let response = self
            .send(|http, session| http.get(Self::data_url(session, &path)))
            .await?;
        Self::handle_response(response).await
    }

    async fn download(&self, object: &str, id: &str, field: &str) -> Result<Vec<u8>, ApiError> {
        let path = format!("sobjects/{}/{}/{}", object, id, field);
        let response = self
            .send(|http, session| http.get(Self::data_url(session, &path)))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                object: object.to_string(),
                id: id.to_string(),
            });
        }

        let response = Self::check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Error entry in the API's standard error body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Filter;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_for(server: &MockServer) -> Session {
        Session {
            access_token: "token-1".to_string(),
            instance_url: server.uri(),
        }
    }

    fn credentials_for(server: &MockServer) -> OrgCredentials {
        OrgCredentials {
            login_url: server.uri(),
            username: "migrator@example.com".to_string(),
            password: "hunter2".to_string(),
            security_token: "TOKEN".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    fn data_path(rest: &str) -> String {
        format!("/services/data/{}/{}", API_VERSION, rest)
    }

    #[tokio::test]
    async fn test_instance_url_without_session() {
        let client = OrgClient::new().unwrap();
        assert_eq!(client.instance_url().await, None);
    }

    #[tokio::test]
    async fn test_login_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "abc",
                "instance_url": "https://acme.my.example.com",
                "token_type": "Bearer"
            })))
            .mount(&mock_server)
            .await;

        let client = OrgClient::connect(credentials_for(&mock_server))
            .await
            .unwrap();
        assert_eq!(
            client.instance_url().await,
            Some("https://acme.my.example.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_login_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "authentication failure"
            })))
            .mount(&mock_server)
            .await;

        let result = OrgClient::connect(credentials_for(&mock_server)).await;
        assert!(matches!(result, Err(ApiError::Auth(_))));
    }

    #[tokio::test]
    async fn test_query_without_session() {
        let client = OrgClient::new().unwrap();
        let result = client.query(&Query::select("Account", ["Id"])).await;
        assert!(matches!(result, Err(ApiError::Auth(_))));
    }

    #[tokio::test]
    async fn test_query_follows_next_records_url() {
        let mock_server = MockServer::start().await;
        let soql = "SELECT Id FROM Account WHERE Id IN ('001A', '001B')";

        Mock::given(method("GET"))
            .and(path(data_path("query")))
            .and(query_param("q", soql))
            .and(header("Authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 2,
                "done": false,
                "nextRecordsUrl": format!("/services/data/{}/query/01g-2000", API_VERSION),
                "records": [{ "Id": "001A" }]
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path(data_path("query/01g-2000")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalSize": 2,
                "done": true,
                "records": [{ "Id": "001B" }]
            })))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let query = Query::select("Account", ["Id"]).filter(Filter::is_in("Id", ["001A", "001B"]));
        let records = client.query(&query).await.unwrap();

        let ids: Vec<_> = records
            .iter()
            .map(|r| r["Id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["001A", "001B"]);
    }

    #[tokio::test]
    async fn test_insert_batch_returns_per_record_results() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(data_path("composite/sobjects")))
            .and(body_partial_json(json!({ "allOrNone": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "00T000000000001", "success": true, "errors": [] },
                { "success": false, "errors": [{
                    "statusCode": "REQUIRED_FIELD_MISSING",
                    "message": "Required fields are missing: [Subject]",
                    "fields": ["Subject"]
                }]}
            ])))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let records: Vec<Record> = vec![
            json!({ "Subject": "Call" }).as_object().cloned().unwrap(),
            json!({ "Subject": null }).as_object().cloned().unwrap(),
        ];
        let results = client.insert_batch("Task", &records).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert_eq!(results[0].id.as_deref(), Some("00T000000000001"));
        assert!(!results[1].success);
        assert_eq!(results[1].errors[0].status_code, "REQUIRED_FIELD_MISSING");
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(data_path("query")))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let result = client.query(&Query::select("Task", ["Id"])).await;
        assert!(matches!(
            result,
            Err(ApiError::RateLimited {
                retry_after_secs: Some(7)
            })
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(data_path("sobjects/Task/describe")))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let err = client.describe("Task").await.unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_api_error_body_is_parsed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(data_path("query")))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!([{
                "errorCode": "INVALID_FIELD",
                "message": "No such column 'Foo__c' on entity 'Task'"
            }])))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let err = client
            .query(&Query::select("Task", ["Foo__c"]))
            .await
            .unwrap_err();
        match err {
            ApiError::Api { code, .. } => assert_eq!(code, "INVALID_FIELD"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(data_path("sobjects/Task/00T000000000404")))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!([{
                "errorCode": "NOT_FOUND",
                "message": "The requested resource does not exist"
            }])))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let err = client.get("Task", "00T000000000404").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_returns_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(data_path("sobjects/Attachment/")))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "00P000000000001",
                "success": true,
                "errors": []
            })))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let record = json!({ "Name": "a.txt" }).as_object().cloned().unwrap();
        let id = client.create("Attachment", &record).await.unwrap();
        assert_eq!(id, "00P000000000001");
    }

    #[tokio::test]
    async fn test_download_bytes() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(data_path("sobjects/ContentVersion/068A/VersionData")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let bytes = client
            .download("ContentVersion", "068A", "VersionData")
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_expired_session_without_credentials_is_reported() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(data_path("sobjects/Task/describe")))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!([{
                "errorCode": "INVALID_SESSION_ID",
                "message": "Session expired or invalid"
            }])))
            .mount(&mock_server)
            .await;

        let client = OrgClient::with_session(session_for(&mock_server)).unwrap();
        let err = client.describe("Task").await.unwrap_err();
        assert!(err.is_expired_session());
    }
}
