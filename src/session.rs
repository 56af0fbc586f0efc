//! Session configuration: what to profile, for how long, and where outputs go.

use serde::{Deserialize, Serialize};

use std::path::PathBuf;

use crate::{ProfError, ProfResult};

pub const DEFAULT_BINARY: &str = "./ARM1";
pub const DEFAULT_DURATION_SECS: u64 = 30;
pub const DEFAULT_OUTDIR: &str = "profiling_out";

/// Immutable for the lifetime of a run.
///
/// Deserializing goes through [`SessionConfig::new`], so a loaded session is
/// validated and its target arguments are split again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", try_from = "RawSession")]
pub struct SessionConfig {
    pub binary: PathBuf,
    pub args: String,
    pub duration_secs: u64,
    pub outdir: PathBuf,
    #[serde(skip)]
    target_args: Vec<String>,
}

impl SessionConfig {
    pub fn new(
        binary: PathBuf,
        args: String,
        duration_secs: u64,
        outdir: PathBuf,
    ) -> ProfResult<Self> {
        if binary.as_os_str().is_empty() {
            return Err(ProfError::InvalidArgument("--binary must not be empty".to_string()));
        }
        if duration_secs == 0 {
            return Err(ProfError::InvalidArgument(
                "--duration must be a positive number of seconds".to_string(),
            ));
        }
        if outdir.as_os_str().is_empty() {
            return Err(ProfError::InvalidArgument("--outdir must not be empty".to_string()));
        }
        let target_args = split_args(&args)?;
        Ok(Self {
            binary,
            args,
            duration_secs,
            outdir,
            target_args,
        })
    }

    /// Arguments handed to the target, after word splitting.
    pub fn target_args(&self) -> &[String] {
        &self.target_args
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSession {
    binary: PathBuf,
    #[serde(default)]
    args: String,
    duration_secs: u64,
    outdir: PathBuf,
}

impl TryFrom<RawSession> for SessionConfig {
    type Error = ProfError;

    fn try_from(raw: RawSession) -> ProfResult<Self> {
        Self::new(raw.binary, raw.args, raw.duration_secs, raw.outdir)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            args: String::new(),
            duration_secs: DEFAULT_DURATION_SECS,
            outdir: PathBuf::from(DEFAULT_OUTDIR),
            target_args: Vec::new(),
        }
    }
}

/// Shell-style word splitting without expansion. An unterminated quote or a
/// trailing backslash is rejected.
pub fn split_args(input: &str) -> ProfResult<Vec<String>> {
    shlex::split(input).ok_or_else(|| {
        ProfError::InvalidArgument(format!("unbalanced quoting in --args {input:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_handles_plain_words() {
        assert_eq!(
            split_args("--threads 4").expect("split"),
            vec!["--threads".to_string(), "4".to_string()]
        );
        assert!(split_args("").expect("split").is_empty());
        assert!(split_args("   ").expect("split").is_empty());
    }

    #[test]
    fn split_args_groups_quoted_words() {
        assert_eq!(
            split_args(r#"--name "two words" --path '/tmp/a b' x"y"z"#).expect("split"),
            vec!["--name", "two words", "--path", "/tmp/a b", "xyz"]
        );
    }

    #[test]
    fn split_args_rejects_unterminated_quote() {
        let err = split_args("--name \"oops").expect_err("must fail");
        assert!(matches!(err, ProfError::InvalidArgument(_)), "{err:?}");
    }

    #[test]
    fn session_rejects_zero_duration() {
        let err = SessionConfig::new(
            PathBuf::from(DEFAULT_BINARY),
            String::new(),
            0,
            PathBuf::from(DEFAULT_OUTDIR),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("--duration"));
    }

    #[test]
    fn session_keeps_raw_args_and_split_words() {
        let s = SessionConfig::new(
            PathBuf::from("./ARM1"),
            "--threads 4".to_string(),
            10,
            PathBuf::from("out1"),
        )
        .expect("session");
        assert_eq!(s.args, "--threads 4");
        assert_eq!(s.target_args(), ["--threads", "4"]);
    }

    #[test]
    fn deserialized_session_splits_args_again() {
        let s = SessionConfig::new(
            PathBuf::from("./ARM1"),
            "--threads 4 --name 'a b'".to_string(),
            10,
            PathBuf::from("out1"),
        )
        .expect("session");
        let json = serde_json::to_string(&s).expect("json");
        let back: SessionConfig = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, s);
        assert_eq!(back.target_args(), ["--threads", "4", "--name", "a b"]);
    }

    #[test]
    fn deserializing_an_invalid_session_fails() {
        let json = r#"{"binary":"./ARM1","args":"","durationSecs":0,"outdir":"out1"}"#;
        let err = serde_json::from_str::<SessionConfig>(json).expect_err("must fail");
        assert!(err.to_string().contains("--duration"), "{err}");
    }
}
