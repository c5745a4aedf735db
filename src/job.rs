//! Wire types shared by the job service and the job client
//!
//! Field names are part of the HTTP protocol and must not change.

use serde::{Deserialize, Serialize};

/// A file to be written into the job workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    /// Path relative to the workspace root
    pub filename: String,
    /// Literal text content
    pub content: String,
}

impl FilePayload {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// A job submission: files to stage plus a shell command to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub files: Vec<FilePayload>,
    pub command: String,
}

impl JobRequest {
    pub fn new(command: impl Into<String>, files: Vec<FilePayload>) -> Self {
        Self {
            files,
            command: command.into(),
        }
    }

    /// Check the request is well-formed before any resource is allocated.
    ///
    /// Path containment is checked again by the workspace manager, which owns
    /// the root; this only rejects what is malformed on its face.
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".to_string());
        }
        if self.command.contains('\0') {
            return Err("command must not contain NUL bytes".to_string());
        }

        for file in &self.files {
            if file.filename.trim().is_empty() {
                return Err("filename must not be empty".to_string());
            }
            if file.filename.contains('\0') {
                return Err(format!("filename contains NUL byte: {:?}", file.filename));
            }
        }

        Ok(())
    }

    /// Total size of submitted content in bytes
    pub fn content_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.content.len() as u64).sum()
    }
}

/// Outcome of a job as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Whether the job *ran* correctly (see `sandbox::runner::classify_exit`)
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl JobResult {
    /// A failed job that never produced a real exit code
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// OAuth2-style token response from `POST /token`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    /// Token lifetime in seconds; absent from older servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// Form body for `POST /token`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_command() {
        let job = JobRequest::new("", vec![]);
        assert!(job.validate().is_err());

        let job = JobRequest::new("   ", vec![]);
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_validate_no_files_is_legal() {
        let job = JobRequest::new("python -c 'print(1)'", vec![]);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_filename() {
        let job = JobRequest::new("ls", vec![FilePayload::new("", "x")]);
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_missing_files_field_defaults_to_empty() {
        let job: JobRequest = serde_json::from_str(r#"{"command": "ls"}"#).unwrap();
        assert!(job.files.is_empty());
    }

    #[test]
    fn test_job_result_wire_format() {
        let value = serde_json::to_value(JobResult::failure("boom")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "success": false,
                "exit_code": -1,
                "stdout": "",
                "stderr": "boom",
            })
        );
    }

    #[test]
    fn test_token_response_without_expiry() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token": "abc", "token_type": "bearer"}"#).unwrap();
        assert_eq!(token.expires_in, None);
    }
}
