//! Task description handed to the agent.

use issue_worker_common::JobIdentity;

use crate::worker::github::{Issue, IssueComment};

/// Oldest comments are dropped beyond this many.
const MAX_COMMENTS: usize = 30;

const CONSTRAINTS: &str = "\
- Use clear English names (verb plus object). Avoid abbreviations.
- Prefer maintainability, readability and security.
- Do not hardcode secrets; read them from the environment.
- Handle errors and edge cases explicitly.
- Add unit tests and a usage example for new behavior.
- Do not commit, push or change git configuration; the worker does that.
";

/// Render the markdown task. On reruns only comments newer than
/// `last_seen_comment_id` are listed.
pub fn render_task(
    job: &JobIdentity,
    work_branch: &str,
    issue: &Issue,
    comments: &[IssueComment],
    last_seen_comment_id: Option<u64>,
) -> String {
    let mut out = format!(
        "# Issue #{}: {}\n\nRepository: {}\nBase branch: {}\nWork branch: {}\n\n",
        issue.number,
        issue.title.trim(),
        job.repo,
        job.base_branch,
        work_branch
    );

    out.push_str("## Description\n\n");
    match issue.body.as_deref().map(str::trim) {
        Some(body) if !body.is_empty() => out.push_str(body),
        _ => out.push_str("(no description)"),
    }
    out.push_str("\n\n");

    let fresh: Vec<&IssueComment> = comments
        .iter()
        .filter(|c| last_seen_comment_id.is_none_or(|seen| c.id > seen))
        .collect();
    if !fresh.is_empty() {
        let heading = if last_seen_comment_id.is_some() {
            "## New comments since the last run"
        } else {
            "## Comments"
        };
        out.push_str(heading);
        out.push_str("\n\n");
        let skip = fresh.len().saturating_sub(MAX_COMMENTS);
        for comment in &fresh[skip..] {
            let author = comment
                .user
                .as_ref()
                .map(|u| u.login.as_str())
                .unwrap_or("unknown");
            out.push_str(&format!(
                "### Comment {} by {}\n\n{}\n\n",
                comment.id,
                author,
                comment.body.as_deref().unwrap_or("").trim()
            ));
        }
    }

    out.push_str("## Constraints\n\n");
    out.push_str(CONSTRAINTS);
    out
}

/// Largest comment id, for remembering what a run has already seen.
pub fn newest_comment_id(comments: &[IssueComment], previous: Option<u64>) -> Option<u64> {
    comments.iter().map(|c| c.id).chain(previous).max()
}
