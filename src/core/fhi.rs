//! FHI ("eTMA Handler Information") files: the per-submission XML record the
//! OU ships alongside each script, and that the tutor writes marks back into.

use crate::domain::model::{Course, MarkStatus, Marking, Student, Submission, Tutor};
use crate::utils::error::{EtmaError, Result};
use chrono::{Local, NaiveDate, TimeZone};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub const SUBMISSION_ROOT: &str = "student_submission";
pub const TUTOR_SAMPLE_ROOT: &str = "tutor_sample";
pub const DEFAULT_MAX_SCORE: u32 = 100;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub const STUDENT_FIELDS: &[&str] = &[
    "ou_computer_user_name",
    "personal_id",
    "title",
    "initials",
    "forenames",
    "surname",
    "email_address",
    "address_line1",
    "address_line2",
    "address_line3",
    "address_line4",
    "address_line5",
    "postcode",
];

pub const TUTOR_FIELDS: &[&str] = &[
    "staff_id",
    "staff_title",
    "staff_initials",
    "staff_forenames",
    "staff_surname",
    "region_code",
];

pub const SUBMISSION_FIELDS: &[&str] = &[
    "course_code",
    "course_version_num",
    "pres_code",
    "assgnmt_suffix",
    "e_tma_submission_num",
    "e_tma_submission_date",
    "walton_received_date",
    "marked_date",
    "submission_status",
    "late_submission_status",
    "zip_date",
    "zip_file",
    "score_update_allowed",
    "overall_grade_score",
    "tutor_comments",
    "max_assgnmt_score",
    "total_question_count",
    "permitted_question_count",
];

/// A parsed XML element. FHI files carry no meaningful mixed content, so an
/// element's text is the concatenation of all its text nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_mut_or_insert(&mut self, name: &str) -> &mut XmlElement {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(i) => i,
            None => {
                self.children.push(XmlElement::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

fn element_from_start(start: &BytesStart<'_>) -> Result<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    if !is_valid_name(&name) {
        return Err(EtmaError::xml(format!("malformed element name '{}'", name)));
    }
    let mut element = XmlElement::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| EtmaError::xml(format!("bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| EtmaError::xml(format!("bad attribute value: {}", e)))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_some() {
        return Err(EtmaError::xml(format!(
            "second root element <{}>",
            element.name
        )));
    } else {
        *root = Some(element);
    }
    Ok(())
}

/// Parses a complete document into its root element.
///
/// Rejects anything that is not well-formed: mismatched or unclosed tags,
/// several roots, text outside the root, and DOCTYPE declarations (which
/// FHI files never contain).
pub fn parse_tree(xml: &str) -> Result<XmlElement> {
    if xml.trim().is_empty() {
        return Err(EtmaError::xml("XML content is empty"));
    }

    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let position = reader.buffer_position();
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(element_from_start(&e)?),
            Ok(Event::Empty(e)) => {
                let element = element_from_start(&e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let element = stack
                    .pop()
                    .ok_or_else(|| EtmaError::xml(format!("unexpected </{}>", name)))?;
                if element.name != name {
                    return Err(EtmaError::xml(format!(
                        "expected </{}> but found </{}> near byte {}",
                        element.name, name, position
                    )));
                }
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| EtmaError::xml(format!("bad text near byte {}: {}", position, e)))?;
                match stack.last_mut() {
                    Some(el) => el.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err(EtmaError::xml("text outside the root element")),
                }
            }
            Ok(Event::CData(c)) => {
                let bytes = c.into_inner();
                match stack.last_mut() {
                    Some(el) => el.text.push_str(&String::from_utf8_lossy(&bytes)),
                    None => return Err(EtmaError::xml("CDATA outside the root element")),
                }
            }
            Ok(Event::DocType(_)) => {
                return Err(EtmaError::xml("DOCTYPE declarations are not allowed"));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(EtmaError::xml(format!(
                    "XML parse error near byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(EtmaError::xml(format!("unclosed element <{}>", open.name)));
    }
    root.ok_or_else(|| EtmaError::xml("no root element"))
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &XmlElement) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    writer
        .write_event(Event::Start(start))
        .map_err(|e| EtmaError::xml(e.to_string()))?;
    if element.children.is_empty() || !element.text.trim().is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&element.text)))
            .map_err(|e| EtmaError::xml(e.to_string()))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|e| EtmaError::xml(e.to_string()))?;
    Ok(())
}

/// Serialises with an ISO-8859-1 declaration; all text is escaped.
pub fn write_tree(root: &XmlElement) -> Result<String> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("ISO-8859-1"), None)))
        .map_err(|e| EtmaError::xml(e.to_string()))?;
    write_element(&mut writer, root)?;
    String::from_utf8(writer.into_inner()).map_err(|e| EtmaError::xml(e.to_string()))
}

pub fn check_well_formed(xml: &str) -> Result<()> {
    parse_tree(xml).map(|_| ())
}

pub fn is_valid_fhi(xml: &str) -> bool {
    parse_tree(xml)
        .map(|root| root.name == SUBMISSION_ROOT || root.name == TUTOR_SAMPLE_ROOT)
        .unwrap_or(false)
}

fn unclosed_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<(/?[a-z_]+)<").unwrap())
}

/// Fixes the `<tag<next` corruption (a dropped `>`) that broken saves left
/// behind. Returns `None` unless the result is well-formed.
pub fn attempt_repair(corrupted: &str) -> Option<String> {
    let pattern = unclosed_tag_pattern();
    let mut repaired = corrupted.to_string();
    // Overlapping runs like `<a<b<c` need more than one pass.
    while pattern.is_match(&repaired) {
        repaired = pattern.replace_all(&repaired, "<$1><").into_owned();
    }
    check_well_formed(&repaired).ok().map(|_| repaired)
}

/// A `student_submission` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FhiDocument {
    root: XmlElement,
}

impl FhiDocument {
    pub fn parse(xml: &str) -> Result<Self> {
        let root = parse_tree(xml)?;
        if root.name != SUBMISSION_ROOT {
            return Err(EtmaError::xml(format!(
                "expected root element '{}', found '{}'",
                SUBMISSION_ROOT, root.name
            )));
        }
        Ok(Self { root })
    }

    pub fn to_xml(&self) -> Result<String> {
        write_tree(&self.root)
    }

    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    /// Builds a fresh document with every known field present, in the order
    /// the OU tools write them.
    pub fn from_submission(submission: &Submission, tutor: Option<&Tutor>) -> Self {
        let mut root = XmlElement::new(SUBMISSION_ROOT);

        let student = &submission.student;
        let mut student_details = section("student_details", STUDENT_FIELDS);
        set(&mut student_details, "personal_id", &student.pi_number);
        set(&mut student_details, "forenames", &student.forenames);
        set(&mut student_details, "surname", &student.surname);
        set(
            &mut student_details,
            "email_address",
            student.email.as_deref().unwrap_or(""),
        );
        for (i, line) in student.address_lines.iter().take(5).enumerate() {
            set(&mut student_details, &format!("address_line{}", i + 1), line);
        }
        root.children.push(student_details);

        if let Some(t) = tutor {
            let mut tutor_details = section("tutor_details", TUTOR_FIELDS);
            set(&mut tutor_details, "staff_id", t.staff_id.as_deref().unwrap_or(""));
            set(&mut tutor_details, "staff_initials", &t.initials);
            set(&mut tutor_details, "staff_forenames", &t.forenames);
            set(&mut tutor_details, "staff_surname", &t.surname);
            root.children.push(tutor_details);
        }

        let course = &submission.course;
        let mut details = section("submission_details", SUBMISSION_FIELDS);
        set(&mut details, "course_code", &course.module_code);
        if let (Some(year), Some(p)) = (course.year, course.presentation) {
            set(&mut details, "pres_code", &format!("{:02}{}", year % 100, p));
        }
        set(&mut details, "assgnmt_suffix", &submission.tma_number);
        if let Some(date) = submission.submitted_at {
            set(
                &mut details,
                "e_tma_submission_date",
                &date.format(DATE_FORMAT).to_string(),
            );
        }
        root.children.push(details);
        root.children.push(XmlElement::new("question_details"));

        let mut doc = Self { root };
        if let Some(marking) = submission.status.marking() {
            doc.apply_marking(marking);
        }
        doc
    }

    pub fn field(&self, section: &str, name: &str) -> Option<&str> {
        self.root
            .child(section)
            .and_then(|s| s.child(name))
            .map(|f| f.text.as_str())
    }

    /// Trimmed field value, `None` when absent or blank.
    pub fn value(&self, section: &str, name: &str) -> Option<&str> {
        self.field(section, name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn set_field(&mut self, section: &str, name: &str, value: &str) {
        let section = self.root.child_mut_or_insert(section);
        section.child_mut_or_insert(name).text = value.to_string();
    }

    pub fn student(&self) -> Student {
        let get = |name: &str| self.value("student_details", name).unwrap_or("").to_string();
        let address = (1..=5)
            .map(|i| get(format!("address_line{}", i).as_str()))
            .chain(std::iter::once(get("postcode")));
        Student::new(get("personal_id"), get("forenames"), get("surname"))
            .with_email(self.value("student_details", "email_address").map(String::from))
            .with_address(address)
    }

    pub fn tutor(&self) -> Option<Tutor> {
        let forenames = self.value("tutor_details", "staff_forenames")?;
        let surname = self.value("tutor_details", "staff_surname")?;
        let mut tutor = Tutor::new(forenames, surname)
            .with_initials(self.value("tutor_details", "staff_initials").unwrap_or(""));
        tutor.staff_id = self.value("tutor_details", "staff_id").map(String::from);
        Some(tutor)
    }

    /// `course_code` and `pres_code` combined, e.g. `E225` + `25J` → `E225-25J`.
    pub fn course(&self) -> Course {
        let code = self.value("submission_details", "course_code").unwrap_or("");
        match self.value("submission_details", "pres_code") {
            Some(pres) => Course::parse(&format!("{}-{}", code, pres)),
            None => Course::parse(code),
        }
    }

    pub fn tma_number(&self) -> &str {
        self.value("submission_details", "assgnmt_suffix")
            .unwrap_or("")
    }

    pub fn max_score(&self) -> u32 {
        self.value("submission_details", "max_assgnmt_score")
            .and_then(|v| v.parse().ok())
            .filter(|&m| m > 0)
            .unwrap_or(DEFAULT_MAX_SCORE)
    }

    pub fn score(&self) -> Option<u32> {
        self.value("submission_details", "overall_grade_score")
            .and_then(|v| v.parse().ok())
    }

    pub fn marking(&self) -> Option<Marking> {
        let score = self.score()?;
        let marked_at = self
            .value("submission_details", "marked_date")
            .and_then(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .and_then(|dt| Local.from_local_datetime(&dt).single())
            .unwrap_or_else(Local::now);
        Some(Marking {
            score,
            max_score: self.max_score(),
            marked_at,
            feedback: self
                .field("submission_details", "tutor_comments")
                .unwrap_or("")
                .to_string(),
        })
    }

    pub fn to_submission(&self, path: Option<&Path>) -> Submission {
        let mut submission = Submission::new(self.student(), self.course(), self.tma_number());
        submission.submitted_at = self
            .value("submission_details", "e_tma_submission_date")
            .and_then(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok());
        submission.file_path = path.map(Path::to_path_buf);
        if let Some(marking) = self.marking() {
            submission.status = MarkStatus::Marked(marking);
        }
        submission
    }

    /// Writes score, comments and marked date back into the document.
    pub fn apply_marking(&mut self, marking: &Marking) {
        self.set_field(
            "submission_details",
            "overall_grade_score",
            &marking.score.to_string(),
        );
        self.set_field("submission_details", "tutor_comments", &marking.feedback);
        self.set_field(
            "submission_details",
            "marked_date",
            &marking.marked_at.format(DATE_FORMAT).to_string(),
        );
        if self.value("submission_details", "max_assgnmt_score").is_none() {
            self.set_field(
                "submission_details",
                "max_assgnmt_score",
                &marking.max_score.to_string(),
            );
        }
    }
}

fn section(name: &str, fields: &[&str]) -> XmlElement {
    let mut el = XmlElement::new(name);
    el.children = fields.iter().map(|f| XmlElement::with_text(*f, "")).collect();
    el
}

fn set(section: &mut XmlElement, name: &str, value: &str) {
    section.child_mut_or_insert(name).text = value.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<student_submission>
  <student_details>
    <personal_id>A1234567</personal_id>
    <forenames>Zoë</forenames>
    <surname>O'Brien &amp; Co</surname>
    <email_address></email_address>
    <address_line1>1 Walton Hall</address_line1>
    <postcode>MK7 6AA</postcode>
  </student_details>
  <tutor_details>
    <staff_forenames>Mary Anne</staff_forenames>
    <staff_surname>Evans</staff_surname>
  </tutor_details>
  <submission_details>
    <course_code>E225</course_code>
    <pres_code>25J</pres_code>
    <assgnmt_suffix>01</assgnmt_suffix>
    <e_tma_submission_date>2025-11-03</e_tma_submission_date>
    <overall_grade_score/>
    <max_assgnmt_score>100</max_assgnmt_score>
  </submission_details>
  <question_details>
    <question number="1"><score>10</score></question>
  </question_details>
</student_submission>"#;

    #[test]
    fn test_parse_sample() {
        let doc = FhiDocument::parse(SAMPLE).unwrap();
        let student = doc.student();
        assert_eq!(student.pi_number, "A1234567");
        assert_eq!(student.surname, "O'Brien & Co");
        assert_eq!(student.email, None);
        assert_eq!(student.formatted_address(), "1 Walton Hall\nMK7 6AA");

        let course = doc.course();
        assert_eq!(course.code, "E225-25J");
        assert_eq!(course.year, Some(2025));
        assert_eq!(doc.tutor().unwrap().initials, "MAE");

        let submission = doc.to_submission(None);
        assert_eq!(submission.status, MarkStatus::Pending);
        assert_eq!(
            submission.submitted_at,
            NaiveDate::from_ymd_opt(2025, 11, 3)
        );
    }

    #[test]
    fn test_marking_survives_rewrite() {
        let mut doc = FhiDocument::parse(SAMPLE).unwrap();
        let marking = Marking {
            score: 68,
            max_score: 100,
            marked_at: Local::now(),
            feedback: "Use <em>evidence</em> & cite sources".to_string(),
        };
        doc.apply_marking(&marking);

        let xml = doc.to_xml().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>"));
        assert!(xml.contains("&lt;em&gt;evidence&lt;/em&gt; &amp; cite"));

        let reparsed = FhiDocument::parse(&xml).unwrap();
        assert_eq!(reparsed.score(), Some(68));
        assert_eq!(
            reparsed.marking().unwrap().feedback,
            "Use <em>evidence</em> & cite sources"
        );
        // Nested question data is carried through untouched.
        let question = reparsed
            .root()
            .child("question_details")
            .and_then(|q| q.child("question"))
            .unwrap();
        assert_eq!(question.attributes, vec![("number".to_string(), "1".to_string())]);
        assert_eq!(question.child("score").unwrap().text, "10");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(check_well_formed("").is_err());
        assert!(check_well_formed("<a><b></a>").is_err());
        assert!(check_well_formed("<a>").is_err());
        assert!(check_well_formed("<a/><b/>").is_err());
        assert!(check_well_formed("<!DOCTYPE a><a/>").is_err());
        assert!(check_well_formed("<a><forenames<surname>x</surname></a>").is_err());
        assert!(FhiDocument::parse("<other/>").is_err());
    }

    #[test]
    fn test_is_valid_fhi_roots() {
        assert!(is_valid_fhi("<student_submission/>"));
        assert!(is_valid_fhi("<tutor_sample></tutor_sample>"));
        assert!(!is_valid_fhi("<student/>"));
        assert!(!is_valid_fhi("<student_submission>"));
    }

    #[test]
    fn test_repair_dropped_angle_bracket() {
        let corrupted = "<student_submission><student_details<forenames>Ann</forenames\
                         </student_details></student_submission>";
        assert!(check_well_formed(corrupted).is_err());
        let repaired = attempt_repair(corrupted).unwrap();
        assert_eq!(
            repaired,
            "<student_submission><student_details><forenames>Ann</forenames>\
             </student_details></student_submission>"
        );
    }

    #[test]
    fn test_repair_gives_up_on_other_damage() {
        assert_eq!(attempt_repair("<a><b></a>"), None);
    }

    #[test]
    fn test_from_submission_layout() {
        let mut submission = Submission::new(
            Student::new("B7654321", "Alan", "Turing"),
            Course::parse("TM129-24J"),
            "02",
        );
        submission.start_marking().unwrap();
        submission.complete_mark(81, 100, "Excellent").unwrap();

        let doc = FhiDocument::from_submission(&submission, Some(&Tutor::new("Ada", "Byron")));
        assert_eq!(doc.field("submission_details", "course_code"), Some("TM129"));
        assert_eq!(doc.field("submission_details", "pres_code"), Some("24J"));
        assert_eq!(doc.field("tutor_details", "staff_initials"), Some("AB"));
        assert_eq!(doc.field("submission_details", "overall_grade_score"), Some("81"));
        assert_eq!(doc.field("student_details", "postcode"), Some(""));

        let back = FhiDocument::parse(&doc.to_xml().unwrap()).unwrap();
        assert_eq!(back.course().code, "TM129-24J");
        assert_eq!(back.to_submission(None).status.marking().unwrap().grade(), "Pass 2");
    }
}
