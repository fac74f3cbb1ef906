use crate::domain::model::{MarkStatus, Submission};
use chrono::{DateTime, Local};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Sentences shorter than this are too generic to count as a shared issue.
const MIN_ISSUE_WORDS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackMetrics {
    pub word_count: usize,
    pub time_spent: Duration,
    pub completed_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub current_student: Option<String>,
    pub elapsed: Duration,
    pub estimated_remaining: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
    pub progress: Progress,
    pub consistency_warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub total_time: Duration,
    pub average_time: Duration,
    pub average_feedback_length: usize,
    pub shortest_feedback: usize,
    pub longest_feedback: usize,
}

impl BatchStats {
    pub fn completion_percentage(&self) -> f64 {
        if self.total > 0 {
            self.completed as f64 * 100.0 / self.total as f64
        } else {
            0.0
        }
    }

    /// Shortest feedback under half the longest.
    pub fn has_consistency_warning(&self) -> bool {
        self.longest_feedback > 0 && (self.shortest_feedback as f64) < self.longest_feedback as f64 * 0.5
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// A run through a queue of scripts, keeping an eye on how long each takes
/// and how much feedback each gets.
#[derive(Debug)]
pub struct MarkingSession {
    queue: Vec<Submission>,
    metrics: HashMap<String, FeedbackMetrics>,
    started: Instant,
}

impl MarkingSession {
    pub fn new(submissions: Vec<Submission>) -> Self {
        Self {
            queue: submissions,
            metrics: HashMap::new(),
            started: Instant::now(),
        }
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.queue
    }

    pub fn submission_mut(&mut self, pi_number: &str) -> Option<&mut Submission> {
        self.queue
            .iter_mut()
            .find(|s| s.student.pi_number == pi_number)
    }

    pub fn into_submissions(self) -> Vec<Submission> {
        self.queue
    }

    /// Starts marking the first pending script.
    pub fn next(&mut self) -> Option<&Submission> {
        let index = self
            .queue
            .iter()
            .position(|s| matches!(s.status, MarkStatus::Pending))?;
        let submission = &mut self.queue[index];
        submission.start_marking().ok()?;
        tracing::debug!("Marking {} next", submission.student.display_name());
        Some(&self.queue[index])
    }

    /// Completions for students outside the queue are ignored.
    pub fn record_completion(
        &mut self,
        pi_number: &str,
        feedback_words: usize,
        time_spent: Duration,
    ) -> CompletionReport {
        if !self.queue.iter().any(|s| s.student.pi_number == pi_number) {
            tracing::warn!("⚠️ {} is not in this marking session", pi_number);
            return CompletionReport {
                progress: self.progress(),
                consistency_warning: None,
            };
        }
        self.metrics.insert(
            pi_number.to_string(),
            FeedbackMetrics {
                word_count: feedback_words,
                time_spent,
                completed_at: Local::now(),
            },
        );

        let mut consistency_warning = None;
        if self.metrics.len() > 3 {
            let average = self.average_feedback_length();
            if (feedback_words as f64) < average * 0.5 {
                let message = format!(
                    "Feedback for {} is much shorter than average ({} vs {:.0} words)",
                    pi_number, feedback_words, average
                );
                tracing::warn!("⚠️ Consistency warning: {}", message);
                consistency_warning = Some(message);
            }
        }

        CompletionReport {
            progress: self.progress(),
            consistency_warning,
        }
    }

    fn average_feedback_length(&self) -> f64 {
        if self.metrics.is_empty() {
            return 0.0;
        }
        let total: usize = self.metrics.values().map(|m| m.word_count).sum();
        total as f64 / self.metrics.len() as f64
    }

    fn in_progress(&self) -> impl Iterator<Item = &Submission> {
        self.queue
            .iter()
            .filter(|s| matches!(s.status, MarkStatus::InProgress { .. }))
    }

    pub fn progress(&self) -> Progress {
        let completed = self.metrics.len();
        let total = self.queue.len();
        let elapsed = self.started.elapsed();
        let estimated_remaining = if completed > 0 {
            (elapsed / completed as u32) * total.saturating_sub(completed) as u32
        } else {
            Duration::ZERO
        };
        Progress {
            current: completed,
            total,
            current_student: self.in_progress().next().map(|s| s.student.pi_number.clone()),
            elapsed,
            estimated_remaining,
        }
    }

    pub fn stats(&self) -> BatchStats {
        let lengths: Vec<usize> = self.metrics.values().map(|m| m.word_count).collect();
        let total_time = self.started.elapsed();
        let average_time = if lengths.is_empty() {
            Duration::ZERO
        } else {
            total_time / lengths.len() as u32
        };
        BatchStats {
            total: self.queue.len(),
            completed: lengths.len(),
            in_progress: self.in_progress().count(),
            total_time,
            average_time,
            average_feedback_length: self.average_feedback_length() as usize,
            shortest_feedback: lengths.iter().copied().min().unwrap_or(0),
            longest_feedback: lengths.iter().copied().max().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonIssue {
    pub pattern: String,
    pub occurrences: usize,
    pub affected_students: Vec<String>,
}

fn sentences(feedback: &str) -> impl Iterator<Item = String> + '_ {
    feedback
        .split(['.', '!', '?', '\n'])
        .map(|s| {
            s.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        })
        .filter(|s| word_count(s) >= MIN_ISSUE_WORDS)
}

/// Feedback sentences that recur across more than one marked script, most
/// frequent first.
pub fn detect_common_issues(submissions: &[Submission]) -> Vec<CommonIssue> {
    let mut seen: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for submission in submissions {
        let Some(marking) = submission.status.marking() else {
            continue;
        };
        for sentence in sentences(&marking.feedback) {
            seen.entry(sentence)
                .or_default()
                .insert(submission.student.pi_number.clone());
        }
    }

    let mut issues: Vec<CommonIssue> = seen
        .into_iter()
        .filter(|(_, students)| students.len() > 1)
        .map(|(pattern, students)| CommonIssue {
            pattern,
            occurrences: students.len(),
            affected_students: students.into_iter().collect(),
        })
        .collect();
    issues.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then(a.pattern.cmp(&b.pattern)));
    issues
}

/// Holds marked work until `release_time`, then returns all of it at once.
/// Scripts that aren't in a marked state come back unchanged.
pub async fn release_at(mut marked: Vec<Submission>, release_time: DateTime<Local>) -> Vec<Submission> {
    if let Ok(delay) = (release_time - Local::now()).to_std() {
        tracing::info!(
            "⏳ Holding {} scripts until {}",
            marked.len(),
            release_time.format("%Y-%m-%d %H:%M")
        );
        tokio::time::sleep(delay).await;
    }

    for submission in &mut marked {
        if let Err(e) = submission.return_to_student() {
            tracing::warn!(
                "⚠️ Not returning {}: {}",
                submission.student.pi_number,
                e
            );
        }
    }
    tracing::info!("📤 Released {} scripts", marked.len());
    marked
}
