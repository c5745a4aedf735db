//! Submit one job to a running Secure Agent Runtime and print the result
//!
//! ```text
//! sandbox-submit -f a.py -f tests/test_a.py=test_a.py -- pytest -q
//! ```

use std::borrow::Cow;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use sandbox_runtime::config::LogFormat;
use sandbox_runtime::{logging, ClientConfig, FilePayload, JobClient, JobRequest};

#[derive(Debug, Parser)]
#[command(name = "sandbox-submit", about = "Submit a job to the Secure Agent Runtime")]
struct Args {
    /// Base URL of the runtime service
    #[arg(long, env = "RUNTIME_URL", default_value = "http://localhost:8001")]
    url: String,

    #[arg(long, env = "OAUTH_USERNAME", default_value = "agent_user")]
    username: String,

    #[arg(long, env = "OAUTH_PASSWORD", hide_env_values = true)]
    password: String,

    /// File to upload, as `PATH` or `PATH=NAME` to pick its name in the workspace
    #[arg(short = 'f', long = "file")]
    files: Vec<String>,

    /// Command to run in the workspace. Several words are quoted for the shell;
    /// a single word is sent as a shell script unchanged
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    logging::init(
        LogFormat::from_env(),
        &["sandbox_runtime=info", "sandbox_submit=info"],
    )?;

    let files = args
        .files
        .iter()
        .map(|spec| read_payload(spec))
        .collect::<Result<Vec<_>>>()?;
    let job = JobRequest::new(job_command(&args.command), files);

    let client = JobClient::new(ClientConfig::new(args.url, args.username, args.password))?;
    let result = client.submit(&job).await;
    info!("success={} exit_code={}", result.success, result.exit_code);

    println!("{}", serde_json::to_string_pretty(&result)?);

    let code = if (0..=255).contains(&result.exit_code) {
        result.exit_code
    } else {
        1
    };
    std::process::exit(code);
}

fn read_payload(spec: &str) -> Result<FilePayload> {
    let (path, name) = match spec.split_once('=') {
        Some((path, name)) => (path, name.to_string()),
        None => (spec, default_name(spec)?),
    };

    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    Ok(FilePayload::new(name, content))
}

/// Relative paths keep their layout; absolute ones are flattened to the file name
fn default_name(path: &str) -> Result<String> {
    let p = Path::new(path);
    if p.is_relative() {
        return Ok(path.to_string());
    }
    match p.file_name() {
        Some(name) => Ok(name.to_string_lossy().into_owned()),
        None => bail!("Cannot derive a file name from {}", path),
    }
}

/// Rebuild the command line the local shell split into words
fn job_command(words: &[String]) -> String {
    match words {
        [script] => script.clone(),
        _ => words
            .iter()
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn shell_quote(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', "'\\''")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn command_of(argv: &[&str]) -> String {
        let args = Args::try_parse_from(argv).unwrap();
        job_command(&args.command)
    }

    #[test]
    fn test_command_words_are_quoted() {
        assert_eq!(
            command_of(&["sandbox-submit", "--password", "p", "--", "python", "-c", "print(1)"]),
            "python -c 'print(1)'"
        );
        assert_eq!(
            command_of(&["sandbox-submit", "--password", "p", "pytest", "-q", "tests/test_a.py"]),
            "pytest -q tests/test_a.py"
        );
    }

    #[test]
    fn test_single_word_is_sent_as_script() {
        assert_eq!(
            command_of(&["sandbox-submit", "--password", "p", "--", "pytest -q && flake8 ."]),
            "pytest -q && flake8 ."
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a.py"), "a.py");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("$HOME;rm"), "'$HOME;rm'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_default_name() {
        assert_eq!(default_name("tests/test_a.py").unwrap(), "tests/test_a.py");
        assert_eq!(default_name("/tmp/work/a.py").unwrap(), "a.py");
        assert!(default_name("/").is_err());
    }

    #[test]
    fn test_read_payload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "print(1)").unwrap();
        let path = file.path().to_str().unwrap();

        let payload = read_payload(&format!("{}=pkg/main.py", path)).unwrap();
        assert_eq!(payload.filename, "pkg/main.py");
        assert_eq!(payload.content, "print(1)");

        let payload = read_payload(path).unwrap();
        assert_eq!(payload.filename, file.path().file_name().unwrap().to_str().unwrap());

        assert!(read_payload("/definitely/missing.py").is_err());
    }
}
