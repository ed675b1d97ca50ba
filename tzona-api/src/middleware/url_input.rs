//! URL input sanitising.
//!
//! Normalises every path parameter and query value, rejects values that are
//! too long or carry symbols outside the allowed set, and hands the cleaned
//! values to handlers as [`SanitizedInput`]. Must be installed with
//! `route_layer` so path parameters are known.

use std::collections::BTreeMap;

use axum::{
    extract::{Query, RawPathParams, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::error::ApiError;

pub const MAX_PARAM_LENGTH: usize = 512;
pub const MAX_QUERY_VALUE_LENGTH: usize = 2048;

static SAFE_PARAM: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N}\-._~:@$!*',();/]+$"));
static SAFE_QUERY: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N}\s\-._~:@$!*',();/?&=+%#\[\]]+$"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputContext {
    Param,
    Query,
}

impl InputContext {
    fn max_length(self) -> usize {
        match self {
            InputContext::Param => MAX_PARAM_LENGTH,
            InputContext::Query => MAX_QUERY_VALUE_LENGTH,
        }
    }

    fn pattern(self) -> &'static Lazy<Result<Regex, regex::Error>> {
        match self {
            InputContext::Param => &SAFE_PARAM,
            InputContext::Query => &SAFE_QUERY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRejection {
    TooLong,
    ForbiddenSymbols,
}

impl InputRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            InputRejection::TooLong => "value_too_long",
            InputRejection::ForbiddenSymbols => "value_contains_forbidden_symbols",
        }
    }
}

fn is_stripped(c: char) -> bool {
    matches!(
        c,
        '\u{0000}'..='\u{0008}'
            | '\u{000B}'
            | '\u{000C}'
            | '\u{000E}'..='\u{001F}'
            | '\u{007F}'
            | '\u{200B}'..='\u{200D}'
            | '\u{2060}'
            | '\u{FEFF}'
    )
}

/// NFKC, `\r\n?` to `\n`, strip control and zero-width characters, trim.
pub fn sanitize_value(raw: &str) -> String {
    let normalized: String = raw.nfkc().collect();
    let unified = normalized.replace("\r\n", "\n").replace('\r', "\n");
    unified
        .chars()
        .filter(|c| !is_stripped(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Sanitise and check one value.
pub fn validate_value(raw: &str, context: InputContext) -> Result<String, InputRejection> {
    let sanitized = sanitize_value(raw);
    if sanitized.chars().count() > context.max_length() {
        return Err(InputRejection::TooLong);
    }
    match context.pattern().as_ref() {
        Ok(pattern) if pattern.is_match(&sanitized) => Ok(sanitized),
        _ => Err(InputRejection::ForbiddenSymbols),
    }
}

/// Cleaned path parameters and query values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedInput {
    pub params: BTreeMap<String, String>,
    /// Values per key, in request order.
    pub query: BTreeMap<String, Vec<String>>,
}

impl SanitizedInput {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// Field path and reason for the first rejected value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidInput {
    pub path: String,
    pub reason: InputRejection,
}

impl From<InvalidInput> for ApiError {
    fn from(invalid: InvalidInput) -> Self {
        ApiError::invalid_url_input(&invalid.path, invalid.reason.as_str())
    }
}

/// Sanitise raw path parameters and query pairs.
pub fn sanitize_input<'a>(
    params: impl IntoIterator<Item = (&'a str, &'a str)>,
    query: impl IntoIterator<Item = (String, String)>,
) -> Result<SanitizedInput, InvalidInput> {
    let mut input = SanitizedInput::default();

    for (name, value) in params {
        let path = format!("params.{name}");
        let clean = validate_value(value, InputContext::Param)
            .map_err(|reason| InvalidInput { path, reason })?;
        input.params.insert(name.to_string(), clean);
    }

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in query {
        grouped.entry(key).or_default().push(value);
    }
    for (key, values) in grouped {
        let repeated = values.len() > 1;
        let mut clean = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            let path = if repeated {
                format!("query.{key}[{index}]")
            } else {
                format!("query.{key}")
            };
            clean.push(
                validate_value(value, InputContext::Query)
                    .map_err(|reason| InvalidInput { path, reason })?,
            );
        }
        input.query.insert(key, clean);
    }

    Ok(input)
}

pub async fn url_input_middleware(
    params: Option<RawPathParams>,
    mut request: Request,
    next: Next,
) -> Response {
    let query = if request.uri().query().is_some() {
        match Query::<Vec<(String, String)>>::try_from_uri(request.uri()) {
            Ok(Query(pairs)) => pairs,
            Err(_) => {
                return ApiError::invalid_url_input(
                    "query",
                    InputRejection::ForbiddenSymbols.as_str(),
                )
                .into_response();
            }
        }
    } else {
        Vec::new()
    };

    let raw_params = params
        .as_ref()
        .map(|p| p.iter().collect::<Vec<_>>())
        .unwrap_or_default();

    match sanitize_input(raw_params, query) {
        Ok(input) => {
            request.extensions_mut().insert(input);
            next.run(request).await
        }
        Err(invalid) => {
            warn!(
                field = %invalid.path,
                code = invalid.reason.as_str(),
                method = %request.method(),
                uri = %request.uri(),
                "Blocked request due to invalid URL input"
            );
            ApiError::from(invalid).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sanitize_strips_controls_and_zero_width() {
        assert_eq!(sanitize_value("  Тест\u{0008} "), "Тест");
        assert_eq!(sanitize_value("a\u{200B}b\u{FEFF}"), "ab");
        assert_eq!(sanitize_value("line\r\nnext\rend"), "line\nnext\nend");
        // Fullwidth letters fold under NFKC.
        assert_eq!(sanitize_value("ＡＢＣ"), "ABC");
    }

    #[test]
    fn test_validate_value_rules() {
        assert_eq!(
            validate_value("leg-day_2024", InputContext::Param),
            Ok("leg-day_2024".to_string())
        );
        assert_eq!(
            validate_value("bad<value>", InputContext::Param),
            Err(InputRejection::ForbiddenSymbols)
        );
        assert_eq!(
            validate_value("a b", InputContext::Param),
            Err(InputRejection::ForbiddenSymbols)
        );
        assert_eq!(
            validate_value("a b", InputContext::Query),
            Ok("a b".to_string())
        );
        assert_eq!(
            validate_value("\u{0007}", InputContext::Param),
            Err(InputRejection::ForbiddenSymbols)
        );
        let long = "a".repeat(MAX_PARAM_LENGTH + 1);
        assert_eq!(
            validate_value(&long, InputContext::Param),
            Err(InputRejection::TooLong)
        );
        assert!(validate_value(&long, InputContext::Query).is_ok());
    }

    #[test]
    fn test_sanitize_input_paths() {
        let err = sanitize_input([("slug", "ok")], vec![("q".to_string(), "<x>".to_string())])
            .unwrap_err();
        assert_eq!(err.path, "query.q");

        let err = sanitize_input(
            Vec::<(&str, &str)>::new(),
            vec![
                ("tag".to_string(), "ok".to_string()),
                ("tag".to_string(), "<x>".to_string()),
            ],
        )
        .unwrap_err();
        assert_eq!(err.path, "query.tag[1]");
        assert_eq!(err.reason, InputRejection::ForbiddenSymbols);

        let input = sanitize_input([("slug", " run ")], vec![("page".to_string(), "2".to_string())])
            .unwrap();
        assert_eq!(input.param("slug"), Some("run"));
        assert_eq!(input.query_value("page"), Some("2"));
    }

    proptest! {
        #[test]
        fn test_sanitized_values_carry_no_stripped_chars(raw in any::<String>()) {
            let clean = sanitize_value(&raw);
            prop_assert!(!clean.chars().any(is_stripped));
            prop_assert_eq!(clean.trim(), clean.as_str());
        }
    }
}
