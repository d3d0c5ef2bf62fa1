//! Credentials (`.creds`) file parsing.
//!
//! A creds file carries two PEM-like blocks in any order: the user JWT
//! (`-----BEGIN NATS USER JWT-----`) and the NKey seed
//! (`-----BEGIN USER NKEY SEED-----`). Real files often pad the END
//! markers with extra dashes, so markers are matched loosely.

use std::path::Path;

use thiserror::Error;

/// Errors raised while loading or parsing a credentials file.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// Required blocks are missing or malformed.
    #[error("invalid credentials format: {reason}")]
    InvalidFormat { reason: String },

    /// The file does not exist.
    #[error("credentials file not found: {path}")]
    FileNotFound { path: String },

    /// The file exists but could not be read.
    #[error("failed to read credentials file: {reason}")]
    ReadError { reason: String },
}

/// Decoded contents of a credentials file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creds {
    pub jwt: String,
    pub seed: String,
}

fn is_marker(line: &str) -> bool {
    line.trim_start().starts_with("---")
}

fn extract_block(contents: &str, begin_tag: &str) -> Option<String> {
    let mut lines = contents.lines();
    for line in lines.by_ref() {
        if is_marker(line) && line.contains("BEGIN") && line.contains(begin_tag) {
            break;
        }
    }
    let mut body = String::new();
    for line in lines {
        if is_marker(line) {
            if line.contains("END") {
                let body = body.trim().to_owned();
                return (!body.is_empty()).then_some(body);
            }
            return None;
        }
        body.push_str(line.trim());
    }
    None
}

/// Parse creds file contents.
pub fn parse_creds(contents: &str) -> Result<Creds, CredentialsError> {
    let jwt = extract_block(contents, "NATS USER JWT").ok_or_else(|| {
        CredentialsError::InvalidFormat {
            reason: "missing NATS USER JWT block".into(),
        }
    })?;
    let seed = extract_block(contents, "USER NKEY SEED").ok_or_else(|| {
        CredentialsError::InvalidFormat {
            reason: "missing USER NKEY SEED block".into(),
        }
    })?;
    Ok(Creds { jwt, seed })
}

/// Read and parse a credentials file from disk.
pub fn load_creds(path: &Path) -> Result<Creds, CredentialsError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CredentialsError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            CredentialsError::ReadError {
                reason: e.to_string(),
            }
        }
    })?;
    parse_creds(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
-----BEGIN NATS USER JWT-----
eyJ0eXAiOiJKV1QiLCJhbGciOiJlZDI1NTE5LW5rZXkifQ.payload.sig
------END NATS USER JWT------

************************* IMPORTANT *************************
NKEY Seed printed below can be used to sign and prove identity.

-----BEGIN USER NKEY SEED-----
SUAIBDPBAUTWCWBKIO6XHQNINK5FWJW4OHLXC3HQ2KFE4PEJUA44CNHTC4
------END USER NKEY SEED------
";

    #[test]
    fn parses_both_blocks() {
        let creds = parse_creds(SAMPLE).unwrap();
        assert!(creds.jwt.starts_with("eyJ0eXAi"));
        assert!(creds.seed.starts_with("SUAI"));
    }

    #[test]
    fn order_does_not_matter() {
        let reversed = "-----BEGIN USER NKEY SEED-----\nSUABC\n------END USER NKEY SEED------\n\
             -----BEGIN NATS USER JWT-----\neyJx\n------END NATS USER JWT------\n";
        let creds = parse_creds(reversed).unwrap();
        assert_eq!(creds.jwt, "eyJx");
        assert_eq!(creds.seed, "SUABC");
    }

    #[test]
    fn multiline_jwt_is_joined_and_trimmed() {
        let wrapped = "\
-----BEGIN NATS USER JWT-----
eyJpart1
part2
-----END NATS USER JWT-----
-----BEGIN USER NKEY SEED-----
  SUXYZ
-----END USER NKEY SEED-----
";
        let creds = parse_creds(wrapped).unwrap();
        assert_eq!(creds.jwt, "eyJpart1part2");
        assert_eq!(creds.seed, "SUXYZ");
    }

    #[test]
    fn missing_seed_block() {
        let only_jwt =
            "-----BEGIN NATS USER JWT-----\neyJx\n------END NATS USER JWT------\n";
        let err = parse_creds(only_jwt).unwrap_err();
        assert!(
            matches!(&err, CredentialsError::InvalidFormat { reason } if reason.contains("SEED")),
            "{err}"
        );
    }

    #[test]
    fn missing_jwt_block() {
        let err = parse_creds("just some text").unwrap_err();
        assert!(matches!(err, CredentialsError::InvalidFormat { .. }));
    }

    #[test]
    fn empty_block_is_invalid() {
        let empty =
            "-----BEGIN NATS USER JWT-----\n------END NATS USER JWT------\n\
             -----BEGIN USER NKEY SEED-----\nSUA\n------END USER NKEY SEED------\n";
        assert!(parse_creds(empty).is_err());
    }

    #[test]
    fn file_not_found() {
        let err = load_creds(Path::new("/nonexistent/user.creds")).unwrap_err();
        assert!(matches!(err, CredentialsError::FileNotFound { .. }));
    }

    #[test]
    fn load_from_disk() {
        let dir = std::env::temp_dir().join("corvus-nkeys-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("user.creds");
        std::fs::write(&path, SAMPLE).unwrap();
        let creds = load_creds(&path).unwrap();
        assert!(creds.seed.starts_with("SUAI"));
        std::fs::remove_file(&path).ok();
    }
}
