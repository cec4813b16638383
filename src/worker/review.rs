//! Ensures exactly one ready-for-review pull request exists for a job.
//!
//! Lookup order: the number remembered from a previous run, then any pull
//! request whose head is the work branch, preferring one whose body carries
//! the job's key marker. A pull request tagged with another job's key, or an
//! untagged one against a different base, is never adopted. Only when nothing
//! matches is a new one created, and a create that races with another writer
//! falls back to a second lookup.

use std::sync::Arc;

use issue_worker_common::{JobIdentity, ReviewRef};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::errors::{WorkerError, WorkerResult};
use crate::worker::github::{CodeHost, Issue, NewPullRequest, PullRequest, PullRequestPatch};

const TITLE_LIMIT: usize = 80;
const COMMIT_SUBJECT_LIMIT: usize = 60;

/// Stable key for (repo, issue, base). Embedded in the pull request body.
pub fn idempotency_key(job: &JobIdentity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job.repo.as_bytes());
    hasher.update(b"\n");
    hasher.update(job.issue_number.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(job.base_branch.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(12).map(|b| format!("{:02x}", b)).collect()
}

const MARKER_PREFIX: &str = "<!-- issue-worker:key=";

pub fn key_marker(key: &str) -> String {
    format!("{}{} -->", MARKER_PREFIX, key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Tagged,
    Untagged,
    Foreign,
}

fn ownership(pull: &PullRequest, job: &JobIdentity, marker: &str) -> Ownership {
    let body = pull.body.as_deref().unwrap_or_default();
    if body.contains(marker) {
        Ownership::Tagged
    } else if body.contains(MARKER_PREFIX) || pull.base.name != job.base_branch {
        Ownership::Foreign
    } else {
        Ownership::Untagged
    }
}

pub fn closes_line(issue_number: u64) -> String {
    format!("Closes #{}", issue_number)
}

fn truncate(text: &str, limit: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}

pub fn pull_request_title(issue: &Issue) -> String {
    truncate(&format!("#{}: {}", issue.number, issue.title), TITLE_LIMIT)
}

pub fn commit_message(issue: &Issue) -> String {
    let subject = truncate(
        &format!("Implement #{}: {}", issue.number, issue.title),
        COMMIT_SUBJECT_LIMIT,
    );
    format!("{}\n\nRefs #{}", subject, issue.number)
}

/// Title and body of the pull request for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewContent {
    pub title: String,
    pub body: String,
}

impl ReviewContent {
    pub fn render(job: &JobIdentity, issue: &Issue, verified: &[String]) -> Self {
        let mut body = String::new();
        body.push_str("## Summary\n\n");
        body.push_str(&format!(
            "Automated change for #{}: {}\n\n",
            issue.number,
            issue.title.trim()
        ));
        body.push_str("## How to test\n\n");
        if verified.is_empty() {
            body.push_str("No verification commands are configured; review the diff and run the project's test suite.\n\n");
        } else {
            body.push_str("These commands passed in the worker before this branch was pushed:\n\n");
            for command in verified {
                body.push_str(&format!("- `{}`\n", command));
            }
            body.push('\n');
        }
        body.push_str(&closes_line(issue.number));
        body.push_str("\n\n");
        body.push_str(&key_marker(&idempotency_key(job)));
        body.push('\n');
        Self {
            title: pull_request_title(issue),
            body,
        }
    }
}

pub struct ReviewRequester {
    host: Arc<dyn CodeHost>,
}

impl ReviewRequester {
    pub fn new(host: Arc<dyn CodeHost>) -> Self {
        Self { host }
    }

    pub async fn ensure_ready(
        &self,
        job: &JobIdentity,
        work_branch: &str,
        content: &ReviewContent,
        known_number: Option<u64>,
    ) -> WorkerResult<ReviewRef> {
        let marker = key_marker(&idempotency_key(job));
        let pull = match self.find_existing(job, work_branch, &marker, known_number).await? {
            Some(existing) => self.bring_up_to_date(job, existing, &marker).await?,
            None => self.create(job, work_branch, content, &marker).await?,
        };
        Ok(ReviewRef {
            number: pull.number,
            url: pull.html_url,
            ready: !pull.draft,
        })
    }

    async fn find_existing(
        &self,
        job: &JobIdentity,
        work_branch: &str,
        marker: &str,
        known_number: Option<u64>,
    ) -> WorkerResult<Option<PullRequest>> {
        if let Some(number) = known_number {
            match self.host.get_pull_request(&job.repo, number).await? {
                Some(pull)
                    if pull.head.name == work_branch
                        && ownership(&pull, job, marker) != Ownership::Foreign =>
                {
                    return Ok(Some(pull));
                }
                Some(_) => warn!(number, "remembered pull request now belongs to another branch or job"),
                None => warn!(number, "remembered pull request no longer exists"),
            }
        }

        let head = format!("{}:{}", job.owner(), work_branch);
        let mut candidates = self.host.find_pull_requests(&job.repo, &head).await?;
        candidates.retain(|pull| pull.head.name == work_branch);
        let (foreign, ours): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|pull| ownership(pull, job, marker) == Ownership::Foreign);

        // Open before closed, marker-tagged before untagged.
        let best = ours.into_iter().min_by_key(|pull| {
            (!pull.is_open(), ownership(pull, job, marker) != Ownership::Tagged)
        });
        if best.is_some() {
            return Ok(best);
        }
        match foreign.first() {
            Some(other) => Err(WorkerError::Publish(format!(
                "pull request #{} on {} belongs to another job (base {})",
                other.number, work_branch, other.base.name
            ))),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        job: &JobIdentity,
        work_branch: &str,
        content: &ReviewContent,
        marker: &str,
    ) -> WorkerResult<PullRequest> {
        let request = NewPullRequest {
            title: content.title.clone(),
            head: format!("{}:{}", job.owner(), work_branch),
            base: job.base_branch.clone(),
            body: content.body.clone(),
            draft: false,
        };
        match self.host.create_pull_request(&job.repo, &request).await {
            Ok(pull) => {
                info!(number = pull.number, url = %pull.html_url, "pull request opened");
                Ok(pull)
            }
            Err(WorkerError::Api { status: 422, message }) => {
                info!("create rejected as duplicate, looking up existing pull request");
                match self.find_existing(job, work_branch, marker, None).await? {
                    Some(existing) => self.bring_up_to_date(job, existing, marker).await,
                    None => Err(WorkerError::Api {
                        status: 422,
                        message,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Reopen, un-draft and tag an existing pull request. Human edits to the
    /// body are kept; missing lines are appended.
    async fn bring_up_to_date(
        &self,
        job: &JobIdentity,
        mut pull: PullRequest,
        marker: &str,
    ) -> WorkerResult<PullRequest> {
        if pull.is_merged() {
            return Err(WorkerError::Publish(format!(
                "pull request #{} for this branch is already merged",
                pull.number
            )));
        }

        let body = pull.body.clone().unwrap_or_default();
        let closes = closes_line(job.issue_number);
        let mut additions = Vec::new();
        if !body.contains(&closes) {
            additions.push(closes);
        }
        if !body.contains(marker) {
            additions.push(marker.to_string());
        }

        let mut patch = PullRequestPatch::default();
        if !pull.is_open() {
            patch.state = Some("open".to_string());
        }
        if !additions.is_empty() {
            let mut updated = body.trim_end().to_string();
            for line in additions {
                if !updated.is_empty() {
                    updated.push_str("\n\n");
                }
                updated.push_str(&line);
            }
            updated.push('\n');
            patch.body = Some(updated);
        }
        if patch.state.is_some() || patch.body.is_some() {
            info!(number = pull.number, reopen = patch.state.is_some(), "updating pull request");
            pull = self
                .host
                .update_pull_request(&job.repo, pull.number, &patch)
                .await?;
        }

        if pull.draft {
            info!(number = pull.number, "marking pull request ready for review");
            self.host.mark_ready_for_review(&job.repo, &pull).await?;
            pull.draft = false;
        }
        Ok(pull)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory code host shared by review and supervisor tests.

    use super::*;
    use crate::worker::github::{BranchRef, IssueComment, RepoPermissions, Repository, User};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeHostState {
        pub pulls: Vec<PullRequest>,
        pub created: usize,
        pub updates: Vec<PullRequestPatch>,
        pub ready_calls: usize,
        pub comments_posted: Vec<String>,
        /// Fail create with 422 after inserting, as if another writer won.
        pub race_on_create: bool,
        pub fail_issue_fetch: Option<String>,
        /// Status returned by `/user`, e.g. 401 for a revoked token.
        pub auth_status: Option<u16>,
        pub read_only: bool,
    }

    #[derive(Default)]
    pub struct FakeHost {
        pub state: Mutex<FakeHostState>,
    }

    impl FakeHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn pull(number: u64, branch: &str, state: &str, draft: bool, body: Option<&str>) -> PullRequest {
            Self::pull_onto(number, branch, "main", state, draft, body)
        }

        pub fn pull_onto(
            number: u64,
            branch: &str,
            base: &str,
            state: &str,
            draft: bool,
            body: Option<&str>,
        ) -> PullRequest {
            PullRequest {
                number,
                html_url: format!("https://github.com/acme/widgets/pull/{}", number),
                node_id: format!("PR_{}", number),
                state: state.to_string(),
                draft,
                body: body.map(str::to_string),
                merged_at: None,
                head: BranchRef {
                    name: branch.to_string(),
                    label: None,
                },
                base: BranchRef {
                    name: base.to_string(),
                    label: None,
                },
            }
        }

        pub fn open_count(&self) -> usize {
            self.state
                .lock()
                .unwrap()
                .pulls
                .iter()
                .filter(|p| p.is_open())
                .count()
        }
    }

    #[async_trait]
    impl CodeHost for FakeHost {
        async fn authenticated_user(&self) -> WorkerResult<User> {
            match self.state.lock().unwrap().auth_status {
                Some(status) => Err(WorkerError::Api {
                    status,
                    message: "fetch authenticated user: Bad credentials".to_string(),
                }),
                None => Ok(User {
                    login: "worker-bot".to_string(),
                }),
            }
        }

        async fn get_repository(&self, repo: &str) -> WorkerResult<Repository> {
            let read_only = self.state.lock().unwrap().read_only;
            Ok(Repository {
                full_name: repo.to_string(),
                permissions: Some(RepoPermissions {
                    pull: true,
                    push: !read_only,
                }),
            })
        }

        async fn get_issue(&self, _repo: &str, number: u64) -> WorkerResult<Issue> {
            if let Some(message) = self.state.lock().unwrap().fail_issue_fetch.clone() {
                return Err(WorkerError::Api { status: 500, message });
            }
            Ok(Issue {
                number,
                title: "Add a widget".to_string(),
                body: Some("The widget should spin.".to_string()),
                state: "open".to_string(),
                html_url: format!("https://github.com/acme/widgets/issues/{}", number),
            })
        }

        async fn list_issue_comments(&self, _repo: &str, _number: u64) -> WorkerResult<Vec<IssueComment>> {
            Ok(Vec::new())
        }

        async fn create_issue_comment(&self, _repo: &str, _number: u64, body: &str) -> WorkerResult<()> {
            self.state.lock().unwrap().comments_posted.push(body.to_string());
            Ok(())
        }

        async fn get_pull_request(&self, _repo: &str, number: u64) -> WorkerResult<Option<PullRequest>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .pulls
                .iter()
                .find(|p| p.number == number)
                .cloned())
        }

        async fn find_pull_requests(&self, _repo: &str, head: &str) -> WorkerResult<Vec<PullRequest>> {
            let branch = head.split_once(':').map(|(_, b)| b).unwrap_or(head);
            Ok(self
                .state
                .lock()
                .unwrap()
                .pulls
                .iter()
                .filter(|p| p.head.name == branch)
                .cloned()
                .collect())
        }

        async fn create_pull_request(&self, _repo: &str, request: &NewPullRequest) -> WorkerResult<PullRequest> {
            let mut state = self.state.lock().unwrap();
            let branch = request.head.split_once(':').map(|(_, b)| b).unwrap_or(&request.head);
            if state.pulls.iter().any(|p| p.head.name == branch && p.is_open()) {
                return Err(WorkerError::Api {
                    status: 422,
                    message: "A pull request already exists".to_string(),
                });
            }
            let number = 100 + state.pulls.len() as u64;
            let pull = Self::pull_onto(
                number,
                branch,
                &request.base,
                "open",
                request.draft,
                Some(request.body.as_str()),
            );
            state.pulls.push(pull.clone());
            state.created += 1;
            if state.race_on_create {
                return Err(WorkerError::Api {
                    status: 422,
                    message: "A pull request already exists".to_string(),
                });
            }
            Ok(pull)
        }

        async fn update_pull_request(
            &self,
            _repo: &str,
            number: u64,
            patch: &PullRequestPatch,
        ) -> WorkerResult<PullRequest> {
            let mut state = self.state.lock().unwrap();
            state.updates.push(patch.clone());
            let pull = state
                .pulls
                .iter_mut()
                .find(|p| p.number == number)
                .ok_or_else(|| WorkerError::Api { status: 404, message: "not found".to_string() })?;
            if let Some(body) = &patch.body {
                pull.body = Some(body.clone());
            }
            if let Some(s) = &patch.state {
                pull.state = s.clone();
            }
            Ok(pull.clone())
        }

        async fn mark_ready_for_review(&self, _repo: &str, pull: &PullRequest) -> WorkerResult<()> {
            let mut state = self.state.lock().unwrap();
            state.ready_calls += 1;
            if let Some(p) = state.pulls.iter_mut().find(|p| p.number == pull.number) {
                p.draft = false;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeHost;
    use super::*;

    fn job() -> JobIdentity {
        JobIdentity::new("acme/widgets", 42, "main").unwrap()
    }

    fn issue(title: &str) -> Issue {
        Issue {
            number: 42,
            title: title.to_string(),
            body: None,
            state: "open".to_string(),
            html_url: String::new(),
        }
    }

    fn content() -> ReviewContent {
        ReviewContent::render(&job(), &issue("Add a widget"), &["cargo test".to_string()])
    }

    #[test]
    fn key_is_stable_and_distinguishes_jobs() {
        let a = idempotency_key(&job());
        assert_eq!(a, idempotency_key(&job()));
        assert_eq!(a.len(), 24);
        let other = JobIdentity::new("acme/widgets", 42, "develop").unwrap();
        assert_ne!(a, idempotency_key(&other));
    }

    #[test]
    fn titles_are_truncated() {
        let long = "x".repeat(200);
        let title = pull_request_title(&issue(&long));
        assert_eq!(title.chars().count(), TITLE_LIMIT);
        assert!(title.ends_with("..."));
        let message = commit_message(&issue(&long));
        let subject = message.lines().next().unwrap();
        assert_eq!(subject.chars().count(), COMMIT_SUBJECT_LIMIT);
        assert!(message.ends_with("Refs #42"));
    }

    #[test]
    fn body_contains_closes_line_marker_and_commands() {
        let content = content();
        assert_eq!(content.title, "#42: Add a widget");
        assert!(content.body.contains("Closes #42"));
        assert!(content.body.contains(&key_marker(&idempotency_key(&job()))));
        assert!(content.body.contains("- `cargo test`"));
    }

    #[tokio::test]
    async fn creates_once_then_reuses() {
        let host = Arc::new(FakeHost::new());
        let requester = ReviewRequester::new(host.clone());

        let first = requester
            .ensure_ready(&job(), "agent/issue-42-main", &content(), None)
            .await
            .unwrap();
        assert!(first.ready);
        let second = requester
            .ensure_ready(&job(), "agent/issue-42-main", &content(), Some(first.number))
            .await
            .unwrap();
        let third = requester
            .ensure_ready(&job(), "agent/issue-42-main", &content(), None)
            .await
            .unwrap();

        assert_eq!(first.number, second.number);
        assert_eq!(first.number, third.number);
        assert_eq!(host.state.lock().unwrap().created, 1);
        assert!(host.state.lock().unwrap().updates.is_empty());
    }

    #[tokio::test]
    async fn draft_is_marked_ready() {
        let host = Arc::new(FakeHost::new());
        host.state.lock().unwrap().pulls.push(FakeHost::pull(
            5,
            "agent/issue-42-main",
            "open",
            true,
            Some("Closes #42"),
        ));
        let review = ReviewRequester::new(host.clone())
            .ensure_ready(&job(), "agent/issue-42-main", &content(), None)
            .await
            .unwrap();
        assert_eq!(review.number, 5);
        assert!(review.ready);
        let state = host.state.lock().unwrap();
        assert_eq!(state.ready_calls, 1);
        assert_eq!(state.created, 0);
        // Marker appended, human text kept.
        let body = state.pulls[0].body.clone().unwrap();
        assert!(body.starts_with("Closes #42"));
        assert!(body.contains("issue-worker:key="));
    }

    #[tokio::test]
    async fn closed_pull_request_is_reopened() {
        let host = Arc::new(FakeHost::new());
        let body = content().body;
        host.state.lock().unwrap().pulls.push(FakeHost::pull(
            9,
            "agent/issue-42-main",
            "closed",
            false,
            Some(body.as_str()),
        ));
        let review = ReviewRequester::new(host.clone())
            .ensure_ready(&job(), "agent/issue-42-main", &content(), None)
            .await
            .unwrap();
        assert_eq!(review.number, 9);
        let state = host.state.lock().unwrap();
        assert_eq!(state.updates.len(), 1);
        assert_eq!(state.updates[0].state.as_deref(), Some("open"));
        assert!(state.updates[0].body.is_none());
        assert_eq!(host_open(&state.pulls), 1);
    }

    fn host_open(pulls: &[PullRequest]) -> usize {
        pulls.iter().filter(|p| p.is_open()).count()
    }

    #[tokio::test]
    async fn prefers_open_tagged_candidate() {
        let host = Arc::new(FakeHost::new());
        let marker = key_marker(&idempotency_key(&job()));
        {
            let mut state = host.state.lock().unwrap();
            state.pulls.push(FakeHost::pull(1, "agent/issue-42-main", "closed", false, None));
            state.pulls.push(FakeHost::pull(2, "agent/issue-42-main", "open", false, Some("Closes #42")));
            state.pulls.push(FakeHost::pull(
                3,
                "agent/issue-42-main",
                "open",
                false,
                Some(format!("Closes #42\n{}", marker).as_str()),
            ));
        }
        let review = ReviewRequester::new(host.clone())
            .ensure_ready(&job(), "agent/issue-42-main", &content(), None)
            .await
            .unwrap();
        assert_eq!(review.number, 3);
    }

    #[tokio::test]
    async fn lost_create_race_resolves_to_existing() {
        let host = Arc::new(FakeHost::new());
        host.state.lock().unwrap().race_on_create = true;
        let review = ReviewRequester::new(host.clone())
            .ensure_ready(&job(), "agent/issue-42-main", &content(), None)
            .await
            .unwrap();
        assert_eq!(review.number, 100);
        assert_eq!(host.open_count(), 1);
    }

    #[tokio::test]
    async fn pull_request_of_another_base_is_not_adopted() {
        let host = Arc::new(FakeHost::new());
        let develop = JobIdentity::new("acme/widgets", 42, "develop").unwrap();
        // Opened by the job for `main`, on the branch the develop job asks about.
        let main_body = content().body;
        host.state.lock().unwrap().pulls.push(FakeHost::pull(
            7,
            "agent/issue-42-main",
            "open",
            false,
            Some(main_body.as_str()),
        ));
        let develop_content = ReviewContent::render(&develop, &issue("Add a widget"), &[]);

        let err = ReviewRequester::new(host.clone())
            .ensure_ready(&develop, "agent/issue-42-main", &develop_content, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Publish(_)), "{}", err);

        let err = ReviewRequester::new(host.clone())
            .ensure_ready(&develop, "agent/issue-42-main", &develop_content, Some(7))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Publish(_)), "{}", err);

        let state = host.state.lock().unwrap();
        assert_eq!(state.created, 0);
        assert!(state.updates.is_empty());
        assert_eq!(state.pulls[0].body.as_deref(), Some(main_body.as_str()));
    }

    #[tokio::test]
    async fn untagged_pull_request_against_other_base_is_not_adopted() {
        let host = Arc::new(FakeHost::new());
        host.state.lock().unwrap().pulls.push(FakeHost::pull_onto(
            8,
            "agent/issue-42-main",
            "release",
            "open",
            false,
            Some("Closes #42"),
        ));
        let err = ReviewRequester::new(host.clone())
            .ensure_ready(&job(), "agent/issue-42-main", &content(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("#8"), "{}", err);
        assert!(host.state.lock().unwrap().updates.is_empty());
    }

    #[tokio::test]
    async fn jobs_differing_only_by_base_get_their_own_pull_requests() {
        let host = Arc::new(FakeHost::new());
        let requester = ReviewRequester::new(host.clone());
        let main = job();
        let develop = JobIdentity::new("acme/widgets", 42, "develop").unwrap();

        let for_main = requester
            .ensure_ready(&main, &main.work_branch(), &content(), None)
            .await
            .unwrap();
        let develop_content = ReviewContent::render(&develop, &issue("Add a widget"), &[]);
        let for_develop = requester
            .ensure_ready(&develop, &develop.work_branch(), &develop_content, None)
            .await
            .unwrap();
        let again = requester
            .ensure_ready(&develop, &develop.work_branch(), &develop_content, None)
            .await
            .unwrap();

        assert_ne!(for_main.number, for_develop.number);
        assert_eq!(for_develop.number, again.number);
        let state = host.state.lock().unwrap();
        assert_eq!(state.created, 2);
        for pull in &state.pulls {
            let body = pull.body.as_deref().unwrap();
            assert_eq!(body.matches("issue-worker:key=").count(), 1);
        }
        let develop_pull = state.pulls.iter().find(|p| p.number == for_develop.number).unwrap();
        assert_eq!(develop_pull.base.name, "develop");
    }

    #[tokio::test]
    async fn merged_pull_request_is_a_publish_error() {
        let host = Arc::new(FakeHost::new());
        let mut merged = FakeHost::pull(4, "agent/issue-42-main", "closed", false, None);
        merged.merged_at = Some("2026-01-01T00:00:00Z".to_string());
        host.state.lock().unwrap().pulls.push(merged);
        let err = ReviewRequester::new(host)
            .ensure_ready(&job(), "agent/issue-42-main", &content(), Some(4))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Publish(_)));
    }
}
