//! The `utils` object formulas get: ids, emptiness, dates, strings and
//! numbers.
//!
//! Dates travel as ISO-8601 strings. A date-only input (`2024-03-01`) stays
//! date-only through [`add_days`]; anything with a time is treated as UTC.

use crate::formula::builtins::{arg, string_length, to_fixed};
use crate::formula::{EvalError, Function, Interpreter, Value};
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use ulid::Ulid;

const DEFAULT_DATE_FORMAT: &str = "YYYY-MM-DD";

fn native(
    name: &str,
    call: impl Fn(&mut Interpreter, &[Value]) -> Result<Value, EvalError> + 'static,
) -> (&str, Value) {
    (name, Value::Function(Function::native(name, call)))
}

pub fn utils() -> Value {
    Value::object([
        native("guid", |_, _| Ok(Value::from(Ulid::new().to_string()))),
        native("isEmpty", |_, args| Ok(Value::Bool(is_empty(&arg(args, 0))))),
        native("now", |_, _| {
            Ok(Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)))
        }),
        native("today", |_, _| {
            Ok(Value::from(Utc::now().date_naive().format("%Y-%m-%d").to_string()))
        }),
        native("formatDate", |_, args| {
            let date = parse_date(&arg(args, 0).to_display())?;
            let format = match arg(args, 1) {
                Value::String(format) => format.to_string(),
                _ => DEFAULT_DATE_FORMAT.to_owned(),
            };
            Ok(Value::from(format_date(&date.at, &format)))
        }),
        native("addDays", |_, args| {
            let date = parse_date(&arg(args, 0).to_display())?;
            Ok(Value::from(add_days(&date, arg(args, 1).to_number())?))
        }),
        native("diffDays", |_, args| {
            let from = parse_date(&arg(args, 0).to_display())?;
            let to = parse_date(&arg(args, 1).to_display())?;
            Ok(Value::from((to.at - from.at).num_days() as f64))
        }),
        native("capitalize", |_, args| {
            Ok(Value::from(capitalize(&arg(args, 0).to_display())))
        }),
        native("truncate", |_, args| {
            let suffix = match arg(args, 2) {
                Value::Undefined => "...".to_owned(),
                suffix => suffix.to_display(),
            };
            let length = arg(args, 1).to_number().max(0.0) as usize;
            Ok(Value::from(truncate(&arg(args, 0).to_display(), length, &suffix)))
        }),
        native("slugify", |_, args| Ok(Value::from(slugify(&arg(args, 0).to_display())))),
        native("padStart", |_, args| {
            let fill = match arg(args, 2) {
                Value::Undefined => " ".to_owned(),
                fill => fill.to_display(),
            };
            let length = string_length(arg(args, 1).to_number())?;
            Ok(Value::from(pad_start(&arg(args, 0).to_display(), length, &fill)))
        }),
        native("round", |_, args| {
            let digits = arg(args, 1).to_number();
            let digits = if digits.is_nan() { 0 } else { digits.clamp(0.0, 15.0) as i32 };
            Ok(Value::from(round(arg(args, 0).to_number(), digits)))
        }),
        native("clamp", |_, args| {
            let (number, low, high) = (
                arg(args, 0).to_number(),
                arg(args, 1).to_number(),
                arg(args, 2).to_number(),
            );
            Ok(Value::from(number.max(low).min(high)))
        }),
        native("formatNumber", |_, args| {
            let digits = arg(args, 1).to_number();
            let digits = if digits.is_nan() { 0 } else { digits.clamp(0.0, 20.0) as usize };
            Ok(Value::from(format_grouped(arg(args, 0).to_number(), digits)))
        }),
    ])
}

pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Undefined | Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.borrow().is_empty(),
        Value::Object(map) => map.borrow().is_empty(),
        _ => false,
    }
}

pub struct ParsedDate {
    pub at: NaiveDateTime,
    pub date_only: bool,
}

pub fn parse_date(text: &str) -> Result<ParsedDate, EvalError> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(ParsedDate {
            at: date.and_time(chrono::NaiveTime::MIN),
            date_only: true,
        });
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(ParsedDate {
            at: at.with_timezone(&Utc).naive_utc(),
            date_only: false,
        });
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|at| ParsedDate {
            at,
            date_only: false,
        })
        .ok_or_else(|| EvalError::Range(format!("Invalid time value: {text}")))
}

/// Formats with `YYYY MM DD HH mm ss` tokens; everything else is literal.
pub fn format_date(at: &NaiveDateTime, format: &str) -> String {
    const TOKENS: [(&str, &str); 6] = [
        ("YYYY", "%Y"),
        ("MM", "%m"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
    ];
    let mut pattern = String::new();
    let mut rest = format;
    'scan: while !rest.is_empty() {
        for (token, spec) in TOKENS {
            if let Some(after) = rest.strip_prefix(token) {
                pattern.push_str(spec);
                rest = after;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                pattern.push_str("%%");
            } else {
                pattern.push(c);
            }
        }
        rest = chars.as_str();
    }
    at.format(&pattern).to_string()
}

pub fn add_days(date: &ParsedDate, days: f64) -> Result<String, EvalError> {
    if !days.is_finite() {
        return Err(EvalError::Range("Invalid day count".to_owned()));
    }
    let days = days.trunc();
    let magnitude = Days::new(days.abs() as u64);
    let shifted = if days < 0.0 {
        date.at.checked_sub_days(magnitude)
    } else {
        date.at.checked_add_days(magnitude)
    }
    .ok_or_else(|| EvalError::Range("Date out of range".to_owned()))?;
    Ok(if date.date_only {
        shifted.format("%Y-%m-%d").to_string()
    } else {
        shifted
            .and_utc()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    })
}

pub fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn truncate(text: &str, length: usize, suffix: &str) -> String {
    if text.chars().count() <= length {
        return text.to_owned();
    }
    let keep = length.saturating_sub(suffix.chars().count());
    text.chars().take(keep).chain(suffix.chars()).collect()
}

pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_owned()
}

pub fn pad_start(text: &str, length: usize, fill: &str) -> String {
    let missing = length.saturating_sub(text.chars().count());
    if missing == 0 || fill.is_empty() {
        return text.to_owned();
    }
    fill.chars().cycle().take(missing).chain(text.chars()).collect()
}

/// Half away from zero.
pub fn round(number: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (number * factor).round() / factor
}

/// `1234.5` with 2 digits -> `1,234.50`.
pub fn format_grouped(number: f64, digits: usize) -> String {
    if !number.is_finite() {
        return crate::formula::value::format_number(number);
    }
    let fixed = to_fixed(number.abs(), digits);
    let (whole, fraction) = match fixed.split_once('.') {
        Some((whole, fraction)) => (whole.to_owned(), Some(fraction.to_owned())),
        None => (fixed, None),
    };
    let mut grouped = String::new();
    for (index, c) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let sign = if number < 0.0 && fixed_is_nonzero(&grouped, fraction.as_deref()) {
        "-"
    } else {
        ""
    };
    match fraction {
        Some(fraction) => format!("{sign}{grouped}.{fraction}"),
        None => format!("{sign}{grouped}"),
    }
}

fn fixed_is_nonzero(whole: &str, fraction: Option<&str>) -> bool {
    whole.chars().chain(fraction.unwrap_or_default().chars()).any(|c| c.is_ascii_digit() && c != '0')
}
