//! JSON parsing with path context for upstream payloads.

use anyhow::Result;

/// Parse JSON and, on failure, report the serde path where deserialization
/// stopped along with the line/column, so shape mismatches in large upstream
/// payloads are diagnosable from logs alone.
pub fn parse_json_with_path<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    let jd = &mut serde_json::Deserializer::from_str(body);
    match serde_path_to_error::deserialize(jd) {
        Ok(value) => Ok(value),
        Err(err) => {
            let inner = err.inner();
            let path = err.path().to_string();
            let (line, column) = (inner.line(), inner.column());
            if path.is_empty() || path == "." {
                Err(anyhow::anyhow!("{inner} (line {line} col {column})"))
            } else {
                Err(anyhow::anyhow!(
                    "at path '{path}': {inner} (line {line} col {column})"
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Reading {
        #[allow(dead_code)]
        value: f64,
    }

    #[derive(Debug, Deserialize)]
    struct Results {
        #[allow(dead_code)]
        results: Vec<Reading>,
    }

    #[test]
    fn error_includes_path() {
        let json = r#"{"results": [{"value": 3.1}, {"value": null}]}"#;
        let result: Result<Results> = parse_json_with_path(json);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("results[1].value"), "got: {msg}");
    }

    #[test]
    fn valid_payload_parses() {
        let json = r#"{"results": [{"value": 12.5}]}"#;
        let parsed: Results = parse_json_with_path(json).unwrap();
        assert_eq!(parsed.results.len(), 1);
    }
}
