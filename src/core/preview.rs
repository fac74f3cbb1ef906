//! Live "= result" preview beside a mark input, so a tutor can type
//! `12+7.5+9` and see the total before committing it.

use crate::core::hooks::ClassList;
use crate::utils::error::{EtmaError, Result};
use regex::Regex;
use std::sync::OnceLock;

pub const SUCCESS_TONE: &[&str] = &["text-green-700", "bg-green-50"];
pub const ERROR_TONE: &[&str] = &["text-red-700", "bg-red-50"];

fn input_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\d+\-*/().\s]+$").unwrap())
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+\.?\d*|[-+*/()]").unwrap())
}

fn number_or_zero(token: Option<&str>) -> f64 {
    token.and_then(|t| t.parse::<f64>().ok()).unwrap_or(0.0)
}

/// Folds `number (op number)*` strictly left to right: `2+3*4` is 20.
/// Parentheses are tokenised but carry no grouping, and anything that isn't
/// a number where one is expected counts as 0. Division by zero gives 0.
/// The result is rounded half-up to two decimals.
pub fn evaluate(expr: &str) -> Result<f64> {
    let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
    let tokens: Vec<&str> = token_pattern()
        .find_iter(&compact)
        .map(|m| m.as_str())
        .collect();
    if tokens.is_empty() {
        return Ok(0.0);
    }

    let mut result = number_or_zero(tokens.first().copied());
    let mut i = 1;
    while i < tokens.len() {
        let operand = number_or_zero(tokens.get(i + 1).copied());
        match tokens[i] {
            "+" => result += operand,
            "-" => result -= operand,
            "*" => result *= operand,
            "/" => result = if operand != 0.0 { result / operand } else { 0.0 },
            _ => {}
        }
        i += 2;
    }

    let rounded = (result * 100.0 + 0.5).floor() / 100.0;
    if !rounded.is_finite() {
        return Err(EtmaError::ExpressionError {
            message: format!("'{}' does not evaluate to a finite number", expr),
        });
    }
    // normalises -0
    Ok(rounded + 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Success,
    Error,
}

impl Tone {
    pub fn classes(self) -> &'static [&'static str] {
        match self {
            Tone::Success => SUCCESS_TONE,
            Tone::Error => ERROR_TONE,
        }
    }

    fn opposite(self) -> Tone {
        match self {
            Tone::Success => Tone::Error,
            Tone::Error => Tone::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreviewUpdate {
    /// Input contains something other than arithmetic; leave the preview be.
    Unchanged,
    Show { text: String, tone: Tone },
}

/// The preview element's text and classes.
#[derive(Debug, Default)]
pub struct CalculatorHook {
    text: String,
    classes: ClassList,
}

impl CalculatorHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn classes(&self) -> &ClassList {
        &self.classes
    }

    pub fn on_input(&mut self, input: &str) -> PreviewUpdate {
        if !input_pattern().is_match(input) {
            return PreviewUpdate::Unchanged;
        }
        let (text, tone) = match evaluate(input) {
            Ok(value) => (format!("= {}", value), Tone::Success),
            Err(e) => {
                tracing::debug!("Preview failed: {}", e);
                ("Error".to_string(), Tone::Error)
            }
        };
        self.text = text.clone();
        self.classes.remove(tone.opposite().classes());
        self.classes.add(tone.classes());
        PreviewUpdate::Show { text, tone }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_to_right_without_precedence() {
        assert_eq!(evaluate("2+3*4").unwrap(), 20.0);
        assert_eq!(evaluate("10 - 4 / 2").unwrap(), 3.0);
    }

    #[test]
    fn test_division_by_zero_is_zero() {
        assert_eq!(evaluate("5/0").unwrap(), 0.0);
        assert_eq!(evaluate("0/0").unwrap(), 0.0);
    }

    #[test]
    fn test_rounds_half_up_to_two_places() {
        assert_eq!(evaluate("10/3").unwrap(), 3.33);
        assert_eq!(evaluate("2/3").unwrap(), 0.67);
        assert_eq!(evaluate("1/8").unwrap(), 0.13);
        assert_eq!(evaluate("0-1/8").unwrap(), -0.12);
    }

    #[test]
    fn test_degenerate_input() {
        assert_eq!(evaluate("").unwrap(), 0.0);
        assert_eq!(evaluate("   ").unwrap(), 0.0);
        assert_eq!(evaluate("+5").unwrap(), 0.0);
        assert_eq!(evaluate("7+").unwrap(), 7.0);
        assert_eq!(evaluate("(2+3)*4").unwrap(), 0.0);
        assert_eq!(evaluate("5.").unwrap(), 5.0);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let huge = "9".repeat(400);
        assert!(evaluate(&huge).is_err());
    }

    #[test]
    fn test_hook_shows_success_then_error() {
        let mut hook = CalculatorHook::new();

        let update = hook.on_input("12 + 7.5");
        assert_eq!(
            update,
            PreviewUpdate::Show {
                text: "= 19.5".to_string(),
                tone: Tone::Success
            }
        );
        assert!(hook.classes().contains("text-green-700"));

        hook.on_input(&"9".repeat(400));
        assert_eq!(hook.text(), "Error");
        assert!(hook.classes().contains("bg-red-50"));
        assert!(!hook.classes().contains("bg-green-50"));
    }

    #[test]
    fn test_hook_ignores_non_arithmetic() {
        let mut hook = CalculatorHook::new();
        hook.on_input("40");
        assert_eq!(hook.on_input("40 marks"), PreviewUpdate::Unchanged);
        assert_eq!(hook.text(), "= 40");
    }
}
