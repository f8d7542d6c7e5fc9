//! Rule-driven extraction of named values from message bodies.
//!
//! An [`Extractor`] compiles an ordered list of [`PatternRule`]s once per watch
//! cycle and applies them to decoded body text.
//!
//! ```
//! use email_dispatch::extractor::{Extraction, Extractor};
//! use email_dispatch::PatternRule;
//!
//! let extractor = Extractor::new(&[PatternRule::required("code", "[0-9]{6}")]);
//!
//! match extractor.extract("your code is 482913") {
//!     Extraction::Extracted(result) => {
//!         assert_eq!(result.params()[0].values, vec!["482913"]);
//!     }
//!     Extraction::Vetoed { .. } => unreachable!(),
//! }
//!
//! assert!(extractor.extract("no code here").is_vetoed());
//! ```

use crate::config::PatternRule;
use crate::error::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// All matches of one rule against one body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedParam {
    /// The rule's parameter name.
    pub name: String,
    /// Whole-match texts in match order, duplicates kept.
    #[serde(rename = "value")]
    pub values: Vec<String>,
}

/// One [`ExtractedParam`] per rule, in rule declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractionResult(Vec<ExtractedParam>);

impl ExtractionResult {
    /// The extracted params in rule order.
    #[must_use]
    pub fn params(&self) -> &[ExtractedParam] {
        &self.0
    }

    /// Consumes the result, returning the params.
    #[must_use]
    pub fn into_params(self) -> Vec<ExtractedParam> {
        self.0
    }

    /// Values extracted for `name`, if such a rule exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|param| param.name == name)
            .map(|param| param.values.as_slice())
    }
}

impl From<Vec<ExtractedParam>> for ExtractionResult {
    fn from(params: Vec<ExtractedParam>) -> Self {
        Self(params)
    }
}

impl std::fmt::Display for ExtractionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, param) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", param.name, param.values)?;
        }
        Ok(())
    }
}

/// Outcome of applying the rules to one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Every required rule matched.
    Extracted(ExtractionResult),
    /// A required rule matched nothing; nothing is delivered for this body.
    Vetoed {
        /// The first required rule without a match.
        rule: String,
    },
}

impl Extraction {
    /// Returns `true` for [`Extraction::Vetoed`].
    #[must_use]
    pub fn is_vetoed(&self) -> bool {
        matches!(self, Extraction::Vetoed { .. })
    }
}

/// A rule with its compiled pattern.
///
/// A pattern that failed to compile is kept as `None` and matches nothing.
#[derive(Debug)]
struct CompiledRule {
    name: String,
    required: bool,
    regex: Option<Regex>,
}

impl CompiledRule {
    fn find_all(&self, text: &str) -> Vec<String> {
        self.regex
            .as_ref()
            .map(|regex| {
                regex
                    .find_iter(text)
                    .map(|m| m.as_str().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Applies an ordered set of pattern rules to message bodies.
#[derive(Debug)]
pub struct Extractor {
    rules: Vec<CompiledRule>,
    invalid: Vec<Error>,
}

impl Extractor {
    /// Compiles `rules`.
    ///
    /// Rules whose pattern does not compile are kept and contribute empty value
    /// lists; the compile errors are available from [`Extractor::invalid_rules`].
    #[must_use]
    pub fn new(rules: &[PatternRule]) -> Self {
        let mut invalid = Vec::new();
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = match Regex::new(&rule.regex) {
                    Ok(regex) => Some(regex),
                    Err(source) => {
                        invalid.push(Error::InvalidPattern {
                            rule: rule.param_name.clone(),
                            source,
                        });
                        None
                    }
                };
                CompiledRule {
                    name: rule.param_name.clone(),
                    required: rule.required,
                    regex,
                }
            })
            .collect();

        Self { rules, invalid }
    }

    /// Compile errors of rules that will never match.
    #[must_use]
    pub fn invalid_rules(&self) -> &[Error] {
        &self.invalid
    }

    /// Number of configured rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if no rules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule, in order, to `body`.
    ///
    /// The first required rule without a match vetoes the whole body.
    #[must_use]
    pub fn extract(&self, body: &str) -> Extraction {
        let mut params = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            let values = rule.find_all(body);
            if rule.required && values.is_empty() {
                debug!(rule = %rule.name, "Required rule has no match, body vetoed");
                return Extraction::Vetoed {
                    rule: rule.name.clone(),
                };
            }
            params.push(ExtractedParam {
                name: rule.name.clone(),
                values,
            });
        }

        Extraction::Extracted(ExtractionResult(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extracted(extraction: Extraction) -> ExtractionResult {
        match extraction {
            Extraction::Extracted(result) => result,
            Extraction::Vetoed { rule } => panic!("unexpected veto by {rule}"),
        }
    }

    #[test]
    fn test_required_code_found() {
        let extractor = Extractor::new(&[PatternRule::required("code", "[0-9]{6}")]);

        let result = extracted(extractor.extract("your code is 482913"));
        assert_eq!(
            result.into_params(),
            vec![ExtractedParam {
                name: "code".into(),
                values: vec!["482913".into()],
            }]
        );
    }

    #[test]
    fn test_required_code_missing_vetoes() {
        let extractor = Extractor::new(&[PatternRule::required("code", "[0-9]{6}")]);

        assert_eq!(
            extractor.extract("no code here"),
            Extraction::Vetoed {
                rule: "code".into()
            }
        );
    }

    #[test]
    fn test_whole_match_not_capture_group() {
        let extractor = Extractor::new(&[PatternRule::optional("code", r"code: (\d+)")]);

        let result = extracted(extractor.extract("code: 42"));
        assert_eq!(result.get("code"), Some(&["code: 42".to_string()][..]));
    }

    #[test]
    fn test_all_matches_in_order_with_duplicates() {
        let extractor = Extractor::new(&[PatternRule::optional("n", r"\d+")]);

        let result = extracted(extractor.extract("7 then 12 then 7"));
        assert_eq!(result.get("n").unwrap(), ["7", "12", "7"]);
    }

    #[test]
    fn test_rule_order_preserved_and_optional_empty() {
        let extractor = Extractor::new(&[
            PatternRule::optional("url", r"https://\S+"),
            PatternRule::required("code", r"\b\d{4}\b"),
            PatternRule::optional("ref", r"REF-\w+"),
        ]);

        let result = extracted(extractor.extract("PIN 1234"));
        let names: Vec<_> = result.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["url", "code", "ref"]);
        assert!(result.get("url").unwrap().is_empty());
        assert!(result.get("ref").unwrap().is_empty());
    }

    #[test]
    fn test_veto_anywhere_in_order_short_circuits() {
        let extractor = Extractor::new(&[
            PatternRule::optional("greeting", "hello"),
            PatternRule::required("code", r"\d{6}"),
        ]);

        assert!(extractor.extract("hello there").is_vetoed());
    }

    #[test]
    fn test_invalid_pattern_contributes_empty_values() {
        let extractor = Extractor::new(&[
            PatternRule::optional("broken", "(unclosed"),
            PatternRule::optional("word", "ok"),
        ]);

        assert_eq!(extractor.invalid_rules().len(), 1);
        assert!(matches!(
            &extractor.invalid_rules()[0],
            Error::InvalidPattern { rule, .. } if rule == "broken"
        ));

        let result = extracted(extractor.extract("ok"));
        assert_eq!(result.params().len(), 2);
        assert!(result.get("broken").unwrap().is_empty());
        assert_eq!(result.get("word").unwrap(), ["ok"]);
    }

    #[test]
    fn test_invalid_required_pattern_vetoes() {
        let extractor = Extractor::new(&[PatternRule::required("broken", "[")]);
        assert!(extractor.extract("anything").is_vetoed());
    }

    #[test]
    fn test_no_rules_extracts_empty_result() {
        let extractor = Extractor::new(&[]);
        assert!(extractor.is_empty());
        assert!(extracted(extractor.extract("body")).params().is_empty());
    }

    #[test]
    fn test_result_display() {
        let result = ExtractionResult::from(vec![ExtractedParam {
            name: "code".into(),
            values: vec!["1".into(), "2".into()],
        }]);
        assert_eq!(result.to_string(), r#"code=["1", "2"]"#);
    }
}
