use super::{ParseError, Span};
use ariadne::{Config, Label, Report, ReportKind, Source};
use std::fmt;
use std::ops::Range;

/// One located problem found while lexing, parsing or resolving a formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub span: Range<usize>,
    pub message: String,
    pub label: String,
}

impl Diagnostic {
    pub fn new(span: Span, message: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            span: span.into_range(),
            message: message.into(),
            label: label.into(),
        }
    }

    pub(crate) fn from_error<T: fmt::Display>(error: &ParseError<'_, T>, offset: usize) -> Self {
        let span = error.span().into_range();
        Self {
            span: (span.start + offset)..(span.end + offset),
            message: error.to_string(),
            label: error.reason().to_string(),
        }
    }
}

/// A formula that cannot run: it does not parse or it names something that
/// is not in scope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.summary())]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self { diagnostics }
    }

    pub fn summary(&self) -> String {
        match self.diagnostics.as_slice() {
            [] => "invalid formula".to_owned(),
            [only] => only.message.clone(),
            [first, rest @ ..] => format!("{} (and {} more)", first.message, rest.len()),
        }
    }

    /// Renders every diagnostic as a plain-text report pointing into `source`.
    pub fn report(&self, filename: &str, source: &str) -> String {
        let mut report = String::new();
        for diagnostic in &self.diagnostics {
            let mut bytes = Vec::new();
            let span = clamp(&diagnostic.span, source.len());
            let written = Report::build(ReportKind::Error, (filename, span.clone()))
                .with_config(Config::default().with_color(false))
                .with_message(&diagnostic.message)
                .with_label(Label::new((filename, span)).with_message(&diagnostic.label))
                .finish()
                .write((filename, Source::from(source)), &mut bytes);
            match written {
                Ok(()) => report.push_str(&String::from_utf8_lossy(&bytes)),
                Err(error) => {
                    log::debug!("failed to render formula report: {error}");
                    report.push_str(&diagnostic.message);
                    report.push('\n');
                }
            }
        }
        report
    }
}

fn clamp(span: &Range<usize>, len: usize) -> Range<usize> {
    let start = span.start.min(len);
    start..span.end.clamp(start, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parser::parse;

    #[test]
    fn report_points_at_the_offending_token() {
        let source = "module.exports = 1 +* 2";
        let error = CompileError::new(parse(source).unwrap_err());
        let report = error.report("label", source);
        assert!(report.contains("label"), "{report}");
        assert!(report.contains("module.exports = 1 +* 2"), "{report}");
    }

    #[test]
    fn summary_counts_extra_diagnostics() {
        let span = Span::from(0..1);
        let error = CompileError::new(vec![
            Diagnostic::new(span, "first", "here"),
            Diagnostic::new(span, "second", "there"),
        ]);
        assert_eq!(error.summary(), "first (and 1 more)");
        assert_eq!(error.to_string(), "first (and 1 more)");
    }
}
