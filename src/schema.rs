//! JSON wire shapes for collaborators.
//!
//! The CLI front-end prints exactly one of these objects to stdout when
//! asked for JSON; tracing logs go to stderr. A network collaborator
//! translating requests for the core uses the same payload shapes.

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;
use crate::manager::JobReport;

pub const SCHEMA_VERSION: &str = "0.1";

fn print_json_to_stdout(value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("JSON serialization failed: {e}"),
    }
}

/// Top-level envelope used for every successful response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T: Serialize> {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            schema_version: SCHEMA_VERSION,
            ok: true,
            kind,
            data,
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Top-level envelope for error responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    /// Whether the caller may retry the same request and expect a
    /// different outcome.
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        ErrorResponse {
            schema_version: SCHEMA_VERSION,
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                retryable,
            },
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

// ---------- Payloads ----------

/// Final report of a `run` invocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunData {
    pub job_id: String,
    /// running | exited | signaled | failed
    pub state: String,
    pub exit_code: i32,
    pub exited: bool,
    /// Total bytes the job wrote to stdout and stderr combined.
    pub output_bytes: u64,
}

/// Status query payload. `exit_code` is -1 while running; a terminating
/// signal is reported as its negated number.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryData {
    pub job_id: String,
    pub pid: i32,
    pub exit_code: i32,
    pub exited: bool,
}

impl QueryData {
    pub fn from_report(report: &JobReport) -> Self {
        let (exit_code, exited) = wire_status(&report.status);
        QueryData {
            job_id: report.id.clone(),
            pid: report.pid as i32,
            exit_code,
            exited,
        }
    }
}

/// Map a status onto the wire `(exit_code, exited)` pair: `(-1, false)`
/// while running, the exit code on a clean exit, the negated signal
/// number on a signal death, and `(-1, true)` for a job that never ran.
pub fn wire_status(status: &JobStatus) -> (i32, bool) {
    match status {
        JobStatus::Running => (-1, false),
        JobStatus::Exited(code) => (*code, true),
        JobStatus::Signaled(signal) => (-signal, true),
        JobStatus::Failed(_) => (-1, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_mapping() {
        assert_eq!(wire_status(&JobStatus::Running), (-1, false));
        assert_eq!(wire_status(&JobStatus::Exited(0)), (0, true));
        assert_eq!(wire_status(&JobStatus::Exited(42)), (42, true));
        assert_eq!(wire_status(&JobStatus::Signaled(15)), (-15, true));
        assert_eq!(wire_status(&JobStatus::Signaled(9)), (-9, true));
        assert_eq!(wire_status(&JobStatus::Failed("x".into())), (-1, true));
    }

    #[test]
    fn response_envelope_flattens_payload() {
        let resp = Response::new(
            "run",
            RunData {
                job_id: "j1".into(),
                state: "exited".into(),
                exit_code: 0,
                exited: true,
                output_bytes: 12,
            },
        );
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(value["schema_version"], SCHEMA_VERSION);
        assert_eq!(value["ok"], true);
        assert_eq!(value["type"], "run");
        assert_eq!(value["job_id"], "j1");
        assert_eq!(value["output_bytes"], 12);
    }

    #[test]
    fn error_envelope_carries_code_and_retryable() {
        let resp = ErrorResponse::new("job_not_found", "job not found: x", false);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["code"], "job_not_found");
        assert_eq!(value["error"]["retryable"], false);
    }

    #[test]
    fn query_data_from_report() {
        let report = JobReport {
            id: "j2".into(),
            pid: 321,
            status: JobStatus::Signaled(15),
        };
        let data = QueryData::from_report(&report);
        assert_eq!(data.pid, 321);
        assert_eq!(data.exit_code, -15);
        assert!(data.exited);
    }
}
