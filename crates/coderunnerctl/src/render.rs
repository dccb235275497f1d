//! Output rendering for coderunnerctl.
//!
//! Formats job and repository information for terminal display.

use coderunner_core::types::{Job, JobSummary};
use coderunner_core::wire::RepositoryView;

/// Print confirmation after creating a job.
pub fn print_job_created(job_id: &str, status: &str, cow_path: &str) {
    println!("Created job: {job_id}");
    println!("  Status: {status}");
    println!("  Workspace: {cow_path}");
}

/// Print a list of job summaries in tabular format.
pub fn print_job_list(jobs: &[JobSummary]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!("{:<36} {:<20} {:<16} {:<20}", "ID", "REPOSITORY", "STATE", "CREATED");
    println!("{}", "-".repeat(96));

    for job in jobs {
        println!(
            "{:<36} {:<20} {:<16} {:<20}",
            job.id.0,
            truncate(&job.repository, 20),
            job.state.as_str(),
            format_time(&job.created_at),
        );
    }

    println!();
    println!("{} job(s)", jobs.len());
}

/// Print detailed information about a single job.
pub fn print_job_details(job: &Job) {
    println!("Job: {}", job.id);
    println!();
    println!("  Principal: {}", job.principal);
    println!("  Repository: {}", job.repository);
    println!("  State: {}", job.state.as_str());
    if let Some(pos) = job.queue_position {
        println!("  Queue pos: {pos}");
    }
    if let Some(title) = &job.title {
        println!("  Title: {title}");
    }
    println!("  Created: {}", format_time(&job.created_at));
    if let Some(started) = &job.started_at {
        println!("  Started: {}", format_time(started));
    }
    if let Some(completed) = &job.completed_at {
        println!("  Completed: {}", format_time(completed));
    }
    if let Some(code) = job.exit_code {
        println!("  Exit code: {code}");
    }
    if let Some(msg) = &job.error_message {
        println!("  Error: {msg}");
    }
    if !job.diagnostics.is_empty() {
        println!("  Diagnostics:");
        for d in &job.diagnostics {
            println!("    - {d}");
        }
    }
    if !job.output.text.is_empty() {
        println!();
        println!("  Output{}:", if job.output.truncated { " (truncated)" } else { "" });
        for line in job.output.text.lines() {
            println!("    {line}");
        }
    }
}

/// Print a list of registered repositories in tabular format.
pub fn print_repository_list(repos: &[RepositoryView]) {
    if repos.is_empty() {
        println!("No repositories registered.");
        return;
    }

    println!(
        "{:<20} {:<12} {:<10} {:<10} {:<8}",
        "NAME", "STATE", "BRANCH", "SIZE", "DIRTY"
    );
    println!("{}", "-".repeat(70));

    for repo in repos {
        println!(
            "{:<20} {:<12} {:<10} {:<10} {:<8}",
            truncate(&repo.name, 20),
            repo.clone_state.as_str(),
            repo.branch.as_deref().unwrap_or("-"),
            format_size(repo.size_bytes),
            if repo.dirty { "yes" } else { "no" },
        );
    }

    println!();
    println!("{} repositor{}", repos.len(), if repos.len() == 1 { "y" } else { "ies" });
}

/// Print detailed information about a single repository.
pub fn print_repository_details(repo: &RepositoryView) {
    println!("Repository: {}", repo.name);
    println!();
    println!("  Origin: {}", repo.origin_url);
    if let Some(desc) = &repo.description {
        println!("  Description: {desc}");
    }
    println!("  State: {}", repo.clone_state.as_str());
    println!("  Index-aware: {}", repo.index_aware);
    println!("  Registered: {}", format_time(&repo.registered_at));
    if let Some(branch) = &repo.branch {
        println!("  Branch: {branch}");
    }
    if let Some(head) = &repo.head {
        println!("  Head: {} {}", &head.hash[..head.hash.len().min(12)], head.subject);
        println!("    by {} at {}", head.author, format_time(&head.timestamp));
    }
    println!("  Size: {}", format_size(repo.size_bytes));
    println!("  Dirty: {}", repo.dirty);
    println!("  Ahead/Behind: {}/{}", repo.ahead, repo.behind);
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{size:.1}{}", UNITS[unit])
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
