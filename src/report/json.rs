use super::types::TestResults;
use anyhow::Result;
use std::path::Path;

/// Generate JSON report
pub async fn generate(results: &TestResults, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;

    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            println!(
                "JSON report saved to: {} ({} files, {} steps)",
                path.display(),
                results.summary.total_files,
                results.summary.total_steps
            );
        }
        None => println!("{}", json),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::types::TestResults;
    use crate::runner::state::TestResult;

    #[test]
    fn test_results_round_trip_through_json() {
        let mut result = TestResult::new("flows/a.yaml", "a.yaml");
        result.finalize(false);
        let results = TestResults::from_results(vec![result]);

        let json = serde_json::to_string(&results).unwrap();
        let parsed: TestResults = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].file_name, "a.yaml");
        assert!(json.contains("\"fileName\""));
    }
}
