//! Boundary to the YARA-X pattern engine.
//!
//! The engine is used as an opaque capability: named sources go in, an
//! immutable compiled ruleset comes out, and a compiled ruleset can scan a
//! file within a timeout. Rule-language semantics live entirely on the other
//! side of this module.

use crate::error::{ErrorKind, Result};
use std::path::Path;
use std::time::Duration;
use yara_x::MetaValue;

/// One matched rule from one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Rule identifier as written in the rule source.
    pub rule: String,
    /// Namespace the rule was compiled into (the source file's stem).
    pub namespace: String,
    /// Value of the rule's `score` metadata entry; 0 when absent.
    pub score: i64,
    /// Rule tags, in declaration order.
    pub tags: Vec<String>,
}

/// Compile named rule sources into one immutable ruleset.
///
/// Each source is compiled into its own namespace (named after the source)
/// so identically-named rules in different files never collide, and matches
/// report which file they came from. Any source failing to compile fails
/// the whole build; partial rulesets are never returned.
pub(crate) fn build_ruleset<'a>(
    sources: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<yara_x::Rules> {
    let mut compiler = yara_x::Compiler::new();
    for (name, source) in sources {
        compiler.new_namespace(namespace_for(name));
        compiler
            .add_source(source)
            .map_err(|err| exn::Exn::from(ErrorKind::Compile(format!("{name}: {err}"))))?;
    }
    Ok(compiler.build())
}

/// Scan one file against a compiled ruleset within `timeout`.
///
/// A timeout surfaces as [`ErrorKind::Scan`] like any other engine failure;
/// the caller treats both as a per-artifact condition, not a fatal one.
pub(crate) fn scan_artifact(
    rules: &yara_x::Rules,
    path: &Path,
    timeout: Duration,
) -> Result<Vec<RuleMatch>> {
    let mut scanner = yara_x::Scanner::new(rules);
    scanner.set_timeout(timeout);
    let results = scanner
        .scan_file(path)
        .map_err(|err| exn::Exn::from(ErrorKind::Scan(format!("{}: {err}", path.display()))))?;
    Ok(results
        .matching_rules()
        .map(|rule| RuleMatch {
            rule: rule.identifier().to_string(),
            namespace: rule.namespace().to_string(),
            score: rule
                .metadata()
                .find_map(|(name, value)| match (name, value) {
                    ("score", MetaValue::Integer(score)) => Some(score),
                    ("score", MetaValue::Float(score)) => Some(score as i64),
                    _ => None,
                })
                .unwrap_or(0),
            tags: rule.tags().map(|tag| tag.identifier().to_string()).collect(),
        })
        .collect())
}

/// Namespace for a rule source: file stem, so `eicar.yar` matches report
/// namespace `eicar`.
fn namespace_for(name: &str) -> &str {
    Path::new(name).file_stem().and_then(|stem| stem.to_str()).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EICAR_RULE: &str = r#"
rule eicar_test : test_suite {
    meta:
        score = 100
    strings:
        $marker = "EICAR"
    condition:
        $marker
}
"#;

    fn temp_artifact(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_build_and_scan_match() {
        let rules = build_ruleset([("eicar.yar", EICAR_RULE)]).unwrap();
        let artifact = temp_artifact(b"prefix EICAR suffix");
        let matches = scan_artifact(&rules, artifact.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule, "eicar_test");
        assert_eq!(matches[0].namespace, "eicar");
        assert_eq!(matches[0].score, 100);
        assert_eq!(matches[0].tags, ["test_suite"]);
    }

    #[test]
    fn test_scan_no_match_is_empty_not_error() {
        let rules = build_ruleset([("eicar.yar", EICAR_RULE)]).unwrap();
        let artifact = temp_artifact(b"nothing interesting");
        let matches = scan_artifact(&rules, artifact.path(), Duration::from_secs(5)).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_score_defaults_to_zero_without_metadata() {
        let rules = build_ruleset([(
            "plain.yar",
            r#"rule plain { strings: $a = "MARK" condition: $a }"#,
        )])
        .unwrap();
        let artifact = temp_artifact(b"MARK");
        let matches = scan_artifact(&rules, artifact.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(matches[0].score, 0);
        assert!(matches[0].tags.is_empty());
    }

    #[test]
    fn test_bad_source_fails_whole_build() {
        let err = build_ruleset([
            ("good.yar", r#"rule good { condition: true }"#),
            ("bad.yar", "rule broken {"),
        ])
        .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Compile(_)));
    }

    #[test]
    fn test_scan_missing_file_is_per_item_error() {
        let rules = build_ruleset([("eicar.yar", EICAR_RULE)]).unwrap();
        let err = scan_artifact(&rules, Path::new("/nonexistent/sample.bin"), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Scan(_)));
    }

    #[test]
    fn test_same_rule_name_in_two_sources_is_fine() {
        // Per-source namespaces keep identically-named rules apart.
        let source = r#"rule dup { strings: $a = "MARK" condition: $a }"#;
        let rules = build_ruleset([("first.yar", source), ("second.yar", source)]).unwrap();
        let artifact = temp_artifact(b"MARK");
        let matches = scan_artifact(&rules, artifact.path(), Duration::from_secs(5)).unwrap();
        assert_eq!(matches.len(), 2);
        let namespaces: Vec<_> = matches.iter().map(|found| found.namespace.as_str()).collect();
        assert!(namespaces.contains(&"first"));
        assert!(namespaces.contains(&"second"));
    }
}
