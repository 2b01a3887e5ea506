use super::types::TestResults;
use crate::runner::state::{StepStatus, TestResult};
use anyhow::Result;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;
use std::path::Path;

/// Generate JUnit XML report string from test results
pub fn generate_junit_xml(results: &TestResults) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let total_steps: usize = results.results.iter().map(|r| r.steps.len()).sum();
    let failures: usize = results.results.iter().map(|r| r.failed as usize).sum();
    let skipped: usize = results
        .results
        .iter()
        .flat_map(|r| r.steps.iter())
        .filter(|s| matches!(s.status, StepStatus::Skipped | StepStatus::Cancelled))
        .count();

    let mut suites_start = BytesStart::new("testsuites");
    suites_start.push_attribute(("name", "flowtest-run"));
    suites_start.push_attribute(("tests", total_steps.to_string().as_str()));
    suites_start.push_attribute(("failures", failures.to_string().as_str()));
    suites_start.push_attribute(("skipped", skipped.to_string().as_str()));
    suites_start.push_attribute((
        "time",
        (results.summary.total_duration_ms as f64 / 1000.0)
            .to_string()
            .as_str(),
    ));
    writer.write_event(Event::Start(suites_start))?;

    for result in &results.results {
        write_test_suite(&mut writer, result, &results.generated_at)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let bytes = writer.into_inner().into_inner();
    let xml = String::from_utf8(bytes)?;
    Ok(xml)
}

/// One testsuite per file, one testcase per step
fn write_test_suite<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &TestResult,
    timestamp: &str,
) -> Result<()> {
    let mut suite_start = BytesStart::new("testsuite");
    suite_start.push_attribute(("name", result.file_name.as_str()));
    suite_start.push_attribute(("tests", result.steps.len().to_string().as_str()));
    suite_start.push_attribute(("failures", result.failed.to_string().as_str()));
    suite_start.push_attribute(("id", result.id.as_str()));
    suite_start.push_attribute((
        "time",
        (result.total_duration_ms as f64 / 1000.0).to_string().as_str(),
    ));
    suite_start.push_attribute(("timestamp", timestamp));
    writer.write_event(Event::Start(suite_start))?;

    let classname = result.file_id.replace('/', ".");
    for step in &result.steps {
        let mut case_start = BytesStart::new("testcase");
        case_start.push_attribute(("name", step.name.as_str()));
        case_start.push_attribute(("classname", classname.as_str()));
        case_start.push_attribute((
            "time",
            (step.duration_ms.unwrap_or(0) as f64 / 1000.0)
                .to_string()
                .as_str(),
        ));
        writer.write_event(Event::Start(case_start))?;

        match step.status {
            StepStatus::Failed => {
                let message = step.error.as_deref().unwrap_or("Unknown error");
                let mut fail_start = BytesStart::new("failure");
                fail_start.push_attribute(("message", message));
                fail_start.push_attribute(("type", "AssertionError"));
                writer.write_event(Event::Start(fail_start))?;
                writer.write_event(Event::Text(BytesText::new(message)))?;
                writer.write_event(Event::End(BytesEnd::new("failure")))?;
            }
            StepStatus::Skipped | StepStatus::Cancelled => {
                writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
            }
            _ => {}
        }

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

/// Write report to file
pub fn write_report(results: &TestResults, output_dir: &Path) -> Result<()> {
    let xml = generate_junit_xml(results)?;
    let path = output_dir.join("junit.xml");
    std::fs::write(&path, xml)?;
    println!("JUnit report saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::state::StepResult;

    #[test]
    fn test_generate_junit_xml() {
        let mut passing = TestResult::new("flows/login.yaml", "login.yaml");
        let mut ok = StepResult::new("Fetch token", 0, "flows/login.yaml", 0);
        ok.start();
        ok.pass();
        passing.record_step(ok);
        passing.finalize(false);

        let mut failing = TestResult::new("flows/checkout.yaml", "checkout.yaml");
        let mut bad = StepResult::new("Pay", 0, "flows/checkout.yaml", 0);
        bad.start();
        bad.fail("expected status 200, got 404".to_string());
        failing.record_step(bad);
        failing.finalize(false);

        let results = TestResults::from_results(vec![passing, failing]);
        let xml = generate_junit_xml(&results).expect("failed to generate XML");

        assert!(xml.contains(r#"<testsuites name="flowtest-run""#));
        assert!(xml.contains(r#"tests="2""#));
        assert!(xml.contains(r#"failures="1""#));
        assert!(xml.contains(r#"<testsuite name="login.yaml""#));
        assert!(xml.contains(r#"<testcase name="Fetch token""#));
        assert!(xml.contains("expected status 200, got 404"));
    }
}
