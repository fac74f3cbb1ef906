use crate::utils::error::{EtmaError, Result};
use chrono::{DateTime, Local, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

fn course_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([A-Z]{1,4}\d{2,4})-(\d{2})([A-Z])$").unwrap())
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// A student enrolled on a module, identified by their PI number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub pi_number: String,
    pub forenames: String,
    pub surname: String,
    pub email: Option<String>,
    pub address_lines: Vec<String>,
}

impl Student {
    pub fn new(
        pi_number: impl Into<String>,
        forenames: impl Into<String>,
        surname: impl Into<String>,
    ) -> Self {
        Self {
            pi_number: pi_number.into(),
            forenames: forenames.into(),
            surname: surname.into(),
            email: None,
            address_lines: Vec::new(),
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = normalize_optional(email);
        self
    }

    /// Blank lines are dropped.
    pub fn with_address<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.address_lines = lines
            .into_iter()
            .filter_map(|l| normalize_optional(Some(l.into())))
            .collect();
        self
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.forenames, self.surname)
    }

    /// `Surname, Forenames (PI)`, the form used in marking lists.
    pub fn display_name(&self) -> String {
        format!("{}, {} ({})", self.surname, self.forenames, self.pi_number)
    }

    pub fn formatted_address(&self) -> String {
        self.address_lines.join("\n")
    }
}

pub const DEFAULT_SMTP_SERVER: &str = "smtp.open.ac.uk";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tutor {
    pub staff_id: Option<String>,
    pub forenames: String,
    pub surname: String,
    pub initials: String,
    pub email: Option<String>,
    pub smtp_server: Option<String>,
}

impl Tutor {
    pub fn new(forenames: impl Into<String>, surname: impl Into<String>) -> Self {
        let forenames = forenames.into();
        let surname = surname.into();
        let initials = derive_initials(&forenames, &surname);
        Self {
            staff_id: None,
            forenames,
            surname,
            initials,
            email: None,
            smtp_server: None,
        }
    }

    /// Keeps derived initials when `initials` is blank.
    pub fn with_initials(mut self, initials: &str) -> Self {
        if !initials.trim().is_empty() {
            self.initials = initials.trim().to_string();
        }
        self
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.forenames, self.surname)
    }

    pub fn effective_smtp_server(&self) -> &str {
        self.smtp_server
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SMTP_SERVER)
    }
}

fn derive_initials(forenames: &str, surname: &str) -> String {
    forenames
        .split_whitespace()
        .chain(surname.split_whitespace().take(1))
        .filter_map(|part| part.chars().next())
        .flat_map(char::to_uppercase)
        .collect()
}

/// An OU module presentation such as `DD102-24J`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub code: String,
    pub module_code: String,
    pub year: Option<i32>,
    pub presentation: Option<char>,
    pub title: Option<String>,
}

impl Course {
    /// Codes that don't follow the `MODULE-YYP` pattern are kept verbatim.
    pub fn parse(code: &str) -> Self {
        let normalized = code.trim().to_uppercase();
        match course_pattern().captures(&normalized) {
            Some(caps) => {
                let yy: i32 = caps[2].parse().unwrap_or(0);
                let year = if yy < 50 { 2000 + yy } else { 1900 + yy };
                Self {
                    code: code.to_string(),
                    module_code: caps[1].to_string(),
                    year: Some(year),
                    presentation: caps[3].chars().next(),
                    title: None,
                }
            }
            None => Self {
                code: code.to_string(),
                module_code: code.to_string(),
                year: None,
                presentation: None,
                title: None,
            },
        }
    }

    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.code)
    }

    /// e.g. `October 2024`.
    pub fn presentation_name(&self) -> String {
        match (self.presentation, self.year) {
            (Some(p), Some(year)) => {
                let month = match p {
                    'J' => "October".to_string(),
                    'B' => "February".to_string(),
                    'D' => "May".to_string(),
                    'K' => "November".to_string(),
                    other => other.to_string(),
                };
                format!("{} {}", month, year)
            }
            _ => self.code.clone(),
        }
    }
}

impl std::fmt::Display for Course {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marking {
    pub score: u32,
    pub max_score: u32,
    pub marked_at: DateTime<Local>,
    pub feedback: String,
}

impl Marking {
    pub fn percentage(&self) -> f64 {
        if self.max_score > 0 {
            f64::from(self.score) * 100.0 / f64::from(self.max_score)
        } else {
            0.0
        }
    }

    /// OU grade band, bucketed by whole tens of the percentage.
    pub fn grade(&self) -> &'static str {
        match (self.percentage() as u32) / 10 {
            9 | 10 => "Distinction",
            7 | 8 => "Pass 2",
            5 | 6 => "Pass 3",
            4 => "Pass 4",
            _ => "Fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarkStatus {
    Pending,
    InProgress {
        started_at: DateTime<Local>,
        notes: Option<String>,
    },
    Marked(Marking),
    Returned {
        marking: Marking,
        returned_at: DateTime<Local>,
    },
    Problem {
        reason: String,
        occurred_at: DateTime<Local>,
    },
}

impl MarkStatus {
    pub fn name(&self) -> &'static str {
        match self {
            MarkStatus::Pending => "pending",
            MarkStatus::InProgress { .. } => "in progress",
            MarkStatus::Marked(_) => "marked",
            MarkStatus::Returned { .. } => "returned",
            MarkStatus::Problem { .. } => "flagged",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, MarkStatus::Marked(_) | MarkStatus::Returned { .. })
    }

    pub fn needs_attention(&self) -> bool {
        matches!(self, MarkStatus::Problem { .. })
    }

    pub fn marking(&self) -> Option<&Marking> {
        match self {
            MarkStatus::Marked(m) => Some(m),
            MarkStatus::Returned { marking, .. } => Some(marking),
            _ => None,
        }
    }
}

/// One student's script for one TMA, plus where it sits in the marking flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub student: Student,
    pub course: Course,
    pub tma_number: String,
    pub submitted_at: Option<NaiveDate>,
    pub file_path: Option<PathBuf>,
    pub status: MarkStatus,
}

impl Submission {
    pub fn new(student: Student, course: Course, tma_number: impl Into<String>) -> Self {
        Self {
            student,
            course,
            tma_number: tma_number.into(),
            submitted_at: None,
            file_path: None,
            status: MarkStatus::Pending,
        }
    }

    fn invalid(&self, to: &str) -> EtmaError {
        EtmaError::InvalidTransition {
            from: self.status.name().to_string(),
            to: to.to_string(),
        }
    }

    pub fn start_marking(&mut self) -> Result<()> {
        if !matches!(self.status, MarkStatus::Pending) {
            return Err(self.invalid("started"));
        }
        self.status = MarkStatus::InProgress {
            started_at: Local::now(),
            notes: None,
        };
        Ok(())
    }

    pub fn complete_mark(&mut self, score: u32, max_score: u32, feedback: &str) -> Result<()> {
        if !matches!(self.status, MarkStatus::InProgress { .. }) {
            return Err(self.invalid("marked"));
        }
        crate::utils::validation::validate_score(score, max_score)?;
        self.status = MarkStatus::Marked(Marking {
            score,
            max_score,
            marked_at: Local::now(),
            feedback: feedback.to_string(),
        });
        Ok(())
    }

    pub fn return_to_student(&mut self) -> Result<()> {
        let MarkStatus::Marked(marking) = &self.status else {
            return Err(self.invalid("returned"));
        };
        self.status = MarkStatus::Returned {
            marking: marking.clone(),
            returned_at: Local::now(),
        };
        Ok(())
    }

    /// Puts a marked (not yet returned) script back in progress so the mark
    /// can be changed.
    pub fn reopen(&mut self) -> Result<()> {
        if !matches!(self.status, MarkStatus::Marked(_)) {
            return Err(self.invalid("reopened"));
        }
        self.status = MarkStatus::InProgress {
            started_at: Local::now(),
            notes: Some("re-marking".to_string()),
        };
        Ok(())
    }

    pub fn flag_problem(&mut self, reason: &str) {
        self.status = MarkStatus::Problem {
            reason: reason.to_string(),
            occurred_at: Local::now(),
        };
    }

    pub fn status_description(&self) -> String {
        match &self.status {
            MarkStatus::Pending => "Awaiting marking".to_string(),
            MarkStatus::InProgress { started_at, notes } => {
                let mut s = format!("In progress since {}", started_at.date_naive());
                if let Some(n) = notes {
                    s.push_str(&format!(" ({})", n));
                }
                s
            }
            MarkStatus::Marked(m) => {
                format!("Marked: {}/{} ({})", m.score, m.max_score, m.grade())
            }
            MarkStatus::Returned {
                marking,
                returned_at,
            } => format!(
                "Returned on {} - {}",
                returned_at.date_naive(),
                marking.grade()
            ),
            MarkStatus::Problem { reason, .. } => format!("Problem: {}", reason),
        }
    }

    /// e.g. `TM129-24J-TMA01-A1234567`.
    pub fn file_name(&self) -> String {
        format!(
            "{}-TMA{}-{}",
            self.course.code, self.tma_number, self.student.pi_number
        )
    }
}
