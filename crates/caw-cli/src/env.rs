//! Environment-variable parsing for daemon init.
//!
//! All daemon configuration arrives through `CAW_*` variables, consulted
//! once at startup. The error messages are part of the CLI contract.

use std::path::PathBuf;

use caw_db::pool::DbMode;

/// Which RPC transport the foreground serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

pub const DEFAULT_PORT: u16 = 3100;

/// Parse a port number. Accepts 1..=65535.
pub fn parse_port(value: &str) -> Result<u16, String> {
    let invalid =
        || format!("Invalid port: '{value}'. Must be an integer between 1 and 65535.");
    let port: i64 = value.trim().parse().map_err(|_| invalid())?;
    if !(1..=65535).contains(&port) {
        return Err(invalid());
    }
    Ok(port as u16)
}

/// Parse the transport selector.
pub fn parse_transport(value: &str) -> Result<Transport, String> {
    match value {
        "stdio" => Ok(Transport::Stdio),
        "http" => Ok(Transport::Http),
        other => Err(format!(
            "Invalid transport: '{other}'. Must be one of: stdio, http."
        )),
    }
}

/// Parse the database mode selector.
pub fn parse_db_mode(value: &str) -> Result<DbMode, String> {
    match value {
        "global" => Ok(DbMode::Global),
        "repository" => Ok(DbMode::Repository),
        other => Err(format!(
            "Invalid db mode: '{other}'. Must be one of: global, repository."
        )),
    }
}

/// Fully resolved daemon environment.
#[derive(Debug, Clone)]
pub struct DaemonEnv {
    pub transport: Transport,
    pub port: u16,
    pub db_mode: DbMode,
    pub repo_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
}

/// Read and validate every `CAW_*` variable.
pub fn from_env() -> Result<DaemonEnv, String> {
    let transport = match std::env::var("CAW_TRANSPORT") {
        Ok(value) => parse_transport(&value)?,
        Err(_) => Transport::Stdio,
    };
    let port = match std::env::var("CAW_PORT") {
        Ok(value) => parse_port(&value)?,
        Err(_) => DEFAULT_PORT,
    };
    let db_mode = match std::env::var("CAW_DB_MODE") {
        Ok(value) => parse_db_mode(&value)?,
        Err(_) => DbMode::Repository,
    };
    let repo_path = std::env::var("CAW_REPO_PATH").ok().map(PathBuf::from);
    let db_path = std::env::var("CAW_DB_PATH").ok().map(PathBuf::from);

    Ok(DaemonEnv {
        transport,
        port,
        db_mode,
        repo_path,
        db_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_accepts_the_range() {
        assert_eq!(parse_port("1"), Ok(1));
        assert_eq!(parse_port("3100"), Ok(3100));
        assert_eq!(parse_port("65535"), Ok(65535));
    }

    #[test]
    fn parse_port_rejects_zero() {
        assert_eq!(
            parse_port("0"),
            Err("Invalid port: '0'. Must be an integer between 1 and 65535.".to_string())
        );
    }

    #[test]
    fn parse_port_rejects_negative() {
        assert_eq!(
            parse_port("-1"),
            Err("Invalid port: '-1'. Must be an integer between 1 and 65535.".to_string())
        );
    }

    #[test]
    fn parse_port_rejects_overflow() {
        assert_eq!(
            parse_port("65536"),
            Err("Invalid port: '65536'. Must be an integer between 1 and 65535.".to_string())
        );
    }

    #[test]
    fn parse_port_rejects_non_integer() {
        assert_eq!(
            parse_port("3.5"),
            Err("Invalid port: '3.5'. Must be an integer between 1 and 65535.".to_string())
        );
        assert_eq!(
            parse_port("abc"),
            Err("Invalid port: 'abc'. Must be an integer between 1 and 65535.".to_string())
        );
    }

    #[test]
    fn parse_transport_values() {
        assert_eq!(parse_transport("stdio"), Ok(Transport::Stdio));
        assert_eq!(parse_transport("http"), Ok(Transport::Http));
        assert_eq!(
            parse_transport("grpc"),
            Err("Invalid transport: 'grpc'. Must be one of: stdio, http.".to_string())
        );
    }

    #[test]
    fn parse_db_mode_values() {
        assert_eq!(parse_db_mode("global"), Ok(DbMode::Global));
        assert_eq!(parse_db_mode("repository"), Ok(DbMode::Repository));
        assert_eq!(
            parse_db_mode("shared"),
            Err("Invalid db mode: 'shared'. Must be one of: global, repository.".to_string())
        );
    }
}
