use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, LINK};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credential::Credential;
use crate::errors::{WorkerError, WorkerResult};

const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("issue-worker/", env!("CARGO_PKG_VERSION"));
const MAX_COMMENT_PAGES: usize = 10;
const ERROR_BODY_LIMIT: usize = 500;

/// A GitHub issue (subset of fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// A pull request (subset of fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
    #[serde(default)]
    pub node_id: String,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub merged_at: Option<String>,
    pub head: BranchRef,
    pub base: BranchRef,
}

impl PullRequest {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }

    pub fn is_merged(&self) -> bool {
        self.merged_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    /// `owner:branch`
    pub head: String,
    pub base: String,
    pub body: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PullRequestPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoPermissions {
    #[serde(default)]
    pub pull: bool,
    #[serde(default)]
    pub push: bool,
}

/// A repository as seen by the authenticated user (subset of fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub full_name: String,
    /// Absent when the token cannot see collaborator permissions.
    #[serde(default)]
    pub permissions: Option<RepoPermissions>,
}

/// Issue and pull request operations the worker needs from the code host.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// The account the credential authenticates as.
    async fn authenticated_user(&self) -> WorkerResult<User>;

    async fn get_repository(&self, repo: &str) -> WorkerResult<Repository>;

    async fn get_issue(&self, repo: &str, number: u64) -> WorkerResult<Issue>;

    async fn list_issue_comments(&self, repo: &str, number: u64) -> WorkerResult<Vec<IssueComment>>;

    async fn create_issue_comment(&self, repo: &str, number: u64, body: &str) -> WorkerResult<()>;

    /// `None` when the number does not exist.
    async fn get_pull_request(&self, repo: &str, number: u64) -> WorkerResult<Option<PullRequest>>;

    /// Pull requests in any state whose head is `owner:branch`.
    async fn find_pull_requests(&self, repo: &str, head: &str) -> WorkerResult<Vec<PullRequest>>;

    async fn create_pull_request(&self, repo: &str, request: &NewPullRequest) -> WorkerResult<PullRequest>;

    async fn update_pull_request(
        &self,
        repo: &str,
        number: u64,
        patch: &PullRequestPatch,
    ) -> WorkerResult<PullRequest>;

    async fn mark_ready_for_review(&self, repo: &str, pull: &PullRequest) -> WorkerResult<()>;
}

/// GitHub REST client. Authentication is attached to each request; the
/// underlying `reqwest::Client` carries no default credentials.
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    credential: Credential,
}

impl GitHubClient {
    pub fn new(api_base: &str, credential: Credential) -> WorkerResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| WorkerError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// GraphQL endpoint for github.com (`/graphql`) or an Enterprise
    /// `.../api/v3` base (`.../api/graphql`).
    pub fn graphql_url(&self) -> String {
        match self.api_base.strip_suffix("/api/v3") {
            Some(host) => format!("{}/api/graphql", host),
            None => format!("{}/graphql", self.api_base),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header(AUTHORIZATION, self.credential.bearer_header())
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> WorkerResult<Response> {
        let resp = builder.send().await.map_err(|e| {
            WorkerError::Publish(self.credential.redact(&format!("{} failed: {}", what, e)))
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let mut message: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            message.push_str(" (rate limited or token lacks permission)");
        }
        Err(WorkerError::Api {
            status: status.as_u16(),
            message: self.credential.redact(&format!("{}: {}", what, message.trim())),
        })
    }

    async fn json<T: DeserializeOwned>(resp: Response, what: &str) -> WorkerResult<T> {
        resp.json::<T>()
            .await
            .map_err(|e| WorkerError::Publish(format!("cannot parse {} response: {}", what, e)))
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn authenticated_user(&self) -> WorkerResult<User> {
        let what = "fetch authenticated user";
        let resp = self
            .send(self.request(Method::GET, &self.url("/user")), what)
            .await?;
        Self::json(resp, what).await
    }

    async fn get_repository(&self, repo: &str) -> WorkerResult<Repository> {
        let what = format!("fetch repository {}", repo);
        let url = self.url(&format!("/repos/{}", repo));
        let resp = self.send(self.request(Method::GET, &url), &what).await?;
        Self::json(resp, &what).await
    }

    async fn get_issue(&self, repo: &str, number: u64) -> WorkerResult<Issue> {
        let what = format!("fetch issue {}#{}", repo, number);
        let url = self.url(&format!("/repos/{}/issues/{}", repo, number));
        let resp = self.send(self.request(Method::GET, &url), &what).await?;
        Self::json(resp, &what).await
    }

    async fn list_issue_comments(&self, repo: &str, number: u64) -> WorkerResult<Vec<IssueComment>> {
        let what = format!("list comments on {}#{}", repo, number);
        let mut comments = Vec::new();
        let mut next = Some(self.url(&format!(
            "/repos/{}/issues/{}/comments?per_page=100",
            repo, number
        )));
        let mut pages = 0;
        while let Some(url) = next.take() {
            let resp = self.send(self.request(Method::GET, &url), &what).await?;
            next = resp
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);
            let page: Vec<IssueComment> = Self::json(resp, &what).await?;
            comments.extend(page);
            pages += 1;
            if pages >= MAX_COMMENT_PAGES {
                debug!(repo, number, "comment pagination limit reached");
                break;
            }
        }
        Ok(comments)
    }

    async fn create_issue_comment(&self, repo: &str, number: u64, body: &str) -> WorkerResult<()> {
        let what = format!("comment on {}#{}", repo, number);
        let url = self.url(&format!("/repos/{}/issues/{}/comments", repo, number));
        self.send(
            self.request(Method::POST, &url)
                .json(&serde_json::json!({ "body": body })),
            &what,
        )
        .await?;
        Ok(())
    }

    async fn get_pull_request(&self, repo: &str, number: u64) -> WorkerResult<Option<PullRequest>> {
        let what = format!("fetch pull request {}#{}", repo, number);
        let url = self.url(&format!("/repos/{}/pulls/{}", repo, number));
        match self.send(self.request(Method::GET, &url), &what).await {
            Ok(resp) => Ok(Some(Self::json(resp, &what).await?)),
            Err(WorkerError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find_pull_requests(&self, repo: &str, head: &str) -> WorkerResult<Vec<PullRequest>> {
        let what = format!("list pull requests for {}", head);
        let url = self.url(&format!("/repos/{}/pulls", repo));
        let resp = self
            .send(
                self.request(Method::GET, &url)
                    .query(&[("head", head), ("state", "all"), ("per_page", "100")]),
                &what,
            )
            .await?;
        Self::json(resp, &what).await
    }

    async fn create_pull_request(&self, repo: &str, request: &NewPullRequest) -> WorkerResult<PullRequest> {
        let what = format!("create pull request for {}", request.head);
        let url = self.url(&format!("/repos/{}/pulls", repo));
        let resp = self
            .send(self.request(Method::POST, &url).json(request), &what)
            .await?;
        Self::json(resp, &what).await
    }

    async fn update_pull_request(
        &self,
        repo: &str,
        number: u64,
        patch: &PullRequestPatch,
    ) -> WorkerResult<PullRequest> {
        let what = format!("update pull request {}#{}", repo, number);
        let url = self.url(&format!("/repos/{}/pulls/{}", repo, number));
        let resp = self
            .send(self.request(Method::PATCH, &url).json(patch), &what)
            .await?;
        Self::json(resp, &what).await
    }

    async fn mark_ready_for_review(&self, repo: &str, pull: &PullRequest) -> WorkerResult<()> {
        let what = format!("mark {}#{} ready for review", repo, pull.number);
        let query = "mutation($id: ID!) { markPullRequestReadyForReview(input: {pullRequestId: $id}) { pullRequest { isDraft } } }";
        let payload = serde_json::json!({
            "query": query,
            "variables": { "id": pull.node_id },
        });
        let resp = self
            .send(
                self.request(Method::POST, &self.graphql_url()).json(&payload),
                &what,
            )
            .await?;
        let body: GraphQlResponse = Self::json(resp, &what).await?;
        if let Some(error) = body.errors.first() {
            return Err(WorkerError::Publish(
                self.credential
                    .redact(&format!("{}: {}", what, error.message)),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
    header
        .split(',')
        .map(str::trim)
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let start = part.find('<')?;
            let end = part.find('>')?;
            (end > start).then(|| part[start + 1..end].to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn next_link_is_extracted() {
        let header = r#"<https://api.github.com/repositories/1/issues/2/comments?page=2>; rel="next", <https://api.github.com/repositories/1/issues/2/comments?page=5>; rel="last""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.github.com/repositories/1/issues/2/comments?page=2")
        );
        assert_eq!(parse_next_link(r#"<https://x>; rel="prev""#), None);
        assert_eq!(parse_next_link(""), None);
    }

    #[test]
    fn graphql_url_for_public_and_enterprise() {
        let cred = Credential::new("t").unwrap();
        let client = GitHubClient::new("https://api.github.com/", cred.clone()).unwrap();
        assert_eq!(client.graphql_url(), "https://api.github.com/graphql");
        let client = GitHubClient::new("https://ghe.example.com/api/v3", cred).unwrap();
        assert_eq!(client.graphql_url(), "https://ghe.example.com/api/graphql");
    }

    #[test]
    fn pull_request_deserializes_subset() {
        let json = r#"{
            "number": 12,
            "html_url": "https://github.com/acme/widgets/pull/12",
            "node_id": "PR_kwDO",
            "state": "closed",
            "draft": true,
            "body": null,
            "merged_at": null,
            "head": {"ref": "agent/issue-42-main", "label": "acme:agent/issue-42-main", "sha": "abc"},
            "base": {"ref": "main", "label": "acme:main", "sha": "def"},
            "user": {"login": "bot"}
        }"#;
        let pr: PullRequest = serde_json::from_str(json).unwrap();
        assert_eq!(pr.number, 12);
        assert!(pr.draft);
        assert!(!pr.is_open());
        assert!(!pr.is_merged());
        assert_eq!(pr.head.name, "agent/issue-42-main");
        assert_eq!(pr.base.name, "main");
    }

    #[test]
    fn patch_omits_unset_fields() {
        let patch = PullRequestPatch {
            state: Some("open".to_string()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&patch).unwrap(), r#"{"state":"open"}"#);
    }

    // ── against a local mock API ────────────────────────────────────

    #[derive(Default)]
    struct Seen {
        auth: Vec<String>,
        graphql: Vec<serde_json::Value>,
        created: Vec<serde_json::Value>,
    }

    type Shared = Arc<Mutex<Seen>>;

    async fn issue(State(seen): State<Shared>, headers: HeaderMap) -> Json<serde_json::Value> {
        if let Some(auth) = headers.get("authorization") {
            seen.lock().unwrap().auth.push(auth.to_str().unwrap().to_string());
        }
        Json(serde_json::json!({
            "number": 42, "title": "Add widget", "body": "Please add it",
            "state": "open", "html_url": "https://github.com/acme/widgets/issues/42"
        }))
    }

    async fn comments(
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> (HeaderMap, Json<serde_json::Value>) {
        let mut out = HeaderMap::new();
        if query.get("page").map(String::as_str) == Some("2") {
            return (out, Json(serde_json::json!([{ "id": 2, "body": "second" }])));
        }
        let host = headers.get("host").unwrap().to_str().unwrap().to_string();
        let next = format!(
            "<http://{}/repos/acme/widgets/issues/42/comments?page=2>; rel=\"next\"",
            host
        );
        out.insert("link", next.parse().unwrap());
        (out, Json(serde_json::json!([{ "id": 1, "body": "first", "user": {"login": "alice"} }])))
    }

    async fn create_pull(
        State(seen): State<Shared>,
        Json(body): Json<serde_json::Value>,
    ) -> (AxumStatus, Json<serde_json::Value>) {
        if body["head"] == "acme:exists" {
            return (
                AxumStatus::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"message": "A pull request already exists for acme:exists."})),
            );
        }
        seen.lock().unwrap().created.push(body.clone());
        (
            AxumStatus::CREATED,
            Json(serde_json::json!({
                "number": 7, "html_url": "https://github.com/acme/widgets/pull/7",
                "node_id": "PR_7", "state": "open", "draft": false, "body": body["body"],
                "head": {"ref": "agent/issue-42-main"},
                "base": {"ref": body["base"]}
            })),
        )
    }

    async fn missing() -> AxumStatus {
        AxumStatus::NOT_FOUND
    }

    async fn user(headers: HeaderMap) -> (AxumStatus, Json<serde_json::Value>) {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer ghp_mocktoken") => (AxumStatus::OK, Json(serde_json::json!({"login": "worker-bot"}))),
            _ => (
                AxumStatus::UNAUTHORIZED,
                Json(serde_json::json!({"message": "Bad credentials"})),
            ),
        }
    }

    async fn repository() -> Json<serde_json::Value> {
        Json(serde_json::json!({
            "full_name": "acme/widgets",
            "private": false,
            "permissions": {"admin": false, "push": true, "pull": true}
        }))
    }

    async fn graphql(
        State(seen): State<Shared>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        seen.lock().unwrap().graphql.push(body);
        Json(serde_json::json!({"data": {"markPullRequestReadyForReview": {"pullRequest": {"isDraft": false}}}}))
    }

    async fn mock_api() -> (String, Shared) {
        let seen: Shared = Arc::default();
        let app = Router::new()
            .route("/user", get(user))
            .route("/repos/acme/widgets", get(repository))
            .route("/repos/acme/widgets/issues/42", get(issue))
            .route("/repos/acme/widgets/issues/42/comments", get(comments))
            .route("/repos/acme/widgets/pulls", post(create_pull))
            .route("/repos/acme/widgets/pulls/99", get(missing))
            .route("/graphql", post(graphql))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn client(base: &str) -> GitHubClient {
        GitHubClient::new(base, Credential::new("ghp_mocktoken").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn fetches_issue_with_bearer_auth() {
        let (base, seen) = mock_api().await;
        let issue = client(&base).get_issue("acme/widgets", 42).await.unwrap();
        assert_eq!(issue.title, "Add widget");
        assert_eq!(seen.lock().unwrap().auth, vec!["Bearer ghp_mocktoken"]);
    }

    #[tokio::test]
    async fn follows_comment_pagination() {
        let (base, _) = mock_api().await;
        let comments = client(&base)
            .list_issue_comments("acme/widgets", 42)
            .await
            .unwrap();
        let ids: Vec<u64> = comments.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(comments[0].user.as_ref().unwrap().login, "alice");
    }

    #[tokio::test]
    async fn creates_non_draft_pull_request() {
        let (base, seen) = mock_api().await;
        let request = NewPullRequest {
            title: "#42: Add widget".to_string(),
            head: "acme:agent/issue-42-main".to_string(),
            base: "main".to_string(),
            body: "Closes #42".to_string(),
            draft: false,
        };
        let pr = client(&base)
            .create_pull_request("acme/widgets", &request)
            .await
            .unwrap();
        assert_eq!(pr.number, 7);
        assert_eq!(pr.base.name, "main");
        let created = &seen.lock().unwrap().created[0];
        assert_eq!(created["draft"], false);
        assert_eq!(created["base"], "main");
    }

    #[tokio::test]
    async fn unprocessable_create_surfaces_status() {
        let (base, _) = mock_api().await;
        let request = NewPullRequest {
            title: "t".to_string(),
            head: "acme:exists".to_string(),
            base: "main".to_string(),
            body: String::new(),
            draft: false,
        };
        let err = client(&base)
            .create_pull_request("acme/widgets", &request)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Api { status: 422, .. }), "{}", err);
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn missing_pull_request_is_none() {
        let (base, _) = mock_api().await;
        assert!(client(&base)
            .get_pull_request("acme/widgets", 99)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ready_for_review_uses_graphql_node_id() {
        let (base, seen) = mock_api().await;
        let pr = PullRequest {
            number: 7,
            html_url: String::new(),
            node_id: "PR_7".to_string(),
            state: "open".to_string(),
            draft: true,
            body: None,
            merged_at: None,
            head: BranchRef {
                name: "agent/issue-42-main".to_string(),
                label: None,
            },
            base: BranchRef {
                name: "main".to_string(),
                label: None,
            },
        };
        client(&base)
            .mark_ready_for_review("acme/widgets", &pr)
            .await
            .unwrap();
        let calls = &seen.lock().unwrap().graphql;
        assert_eq!(calls[0]["variables"]["id"], "PR_7");
        assert!(calls[0]["query"]
            .as_str()
            .unwrap()
            .contains("markPullRequestReadyForReview"));
    }

    #[tokio::test]
    async fn reads_user_and_push_permission() {
        let (base, _) = mock_api().await;
        let client = client(&base);
        assert_eq!(client.authenticated_user().await.unwrap().login, "worker-bot");
        let repo = client.get_repository("acme/widgets").await.unwrap();
        assert_eq!(repo.full_name, "acme/widgets");
        assert!(repo.permissions.unwrap().push);
    }

    #[tokio::test]
    async fn bad_token_is_unauthorized() {
        let (base, _) = mock_api().await;
        let client = GitHubClient::new(&base, Credential::new("ghp_wrong").unwrap()).unwrap();
        let err = client.authenticated_user().await.unwrap_err();
        assert!(matches!(err, WorkerError::Api { status: 401, .. }), "{}", err);
        assert!(!err.to_string().contains("ghp_wrong"));
    }

    #[tokio::test]
    async fn unreachable_api_is_publish_error() {
        let err = client("http://127.0.0.1:9")
            .get_issue("acme/widgets", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Publish(_)));
    }
}
