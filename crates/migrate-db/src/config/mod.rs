//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::error::{MigrateError, Result};
use crate::target::tls::SslMode;

const TEMPLATE: &str = r#"# migrate-db configuration
#
# Copies every table of the PostgreSQL `public` schema from SQL Server.
# Tables must already exist on the target.

source:
  # ADO.NET connection string for SQL Server
  connection_string: "Server=tcp:localhost,1433;Database=app;User Id=sa;Password=changeme;TrustServerCertificate=true"
  schema: dbo

target:
  # libpq key/value, postgres:// URL, or Host=...;Port=...; form
  connection_string: "host=localhost port=5432 user=postgres password=changeme dbname=app"
  # disable | prefer | require | verify-ca | verify-full
  ssl_mode: disable

migration:
  # Maximum open connections per engine
  max_connections: 100
  # Tables that are never truncated or copied
  ignore_tables: []
  read_timeout_secs: 900
  write_timeout_secs: 900
  statement_timeout_secs: 900

state:
  # Tables completed by an interrupted run
  checkpoint_file: tables.txt
  # Foreign keys waiting to be restored
  restore_script_file: after_script.txt
"#;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Commented starter configuration written by `migrate-db init`.
    pub fn template() -> &'static str {
        TEMPLATE
    }
}

impl TargetConfig {
    /// Effective TLS mode: the explicit `ssl_mode` field, then the
    /// connection string's own `sslmode`, then disabled.
    pub fn ssl_mode(&self) -> Result<SslMode> {
        if let Some(ref mode) = self.ssl_mode {
            return mode.parse();
        }
        let (_, embedded) = split_ssl_mode(&self.connection_string);
        match embedded {
            Some(mode) => mode.parse(),
            None => Ok(SslMode::Disable),
        }
    }

    /// Build a tokio-postgres config from any supported connection string form.
    pub fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let (stripped, _) = split_ssl_mode(&self.connection_string);
        let mut config = if is_semicolon_form(&stripped) {
            parse_semicolon_form(&stripped)?
        } else {
            stripped.parse::<tokio_postgres::Config>().map_err(|e| {
                MigrateError::Config(format!("invalid target.connection_string: {}", e))
            })?
        };
        config.ssl_mode(self.ssl_mode()?.to_postgres());
        Ok(config)
    }
}

fn is_semicolon_form(s: &str) -> bool {
    !s.contains("://") && s.contains(';')
}

/// Remove any `sslmode` setting from a connection string, returning it separately.
///
/// tokio-postgres only understands disable/prefer/require, so verification
/// modes are handled here instead.
fn split_ssl_mode(conn: &str) -> (String, Option<String>) {
    let is_ssl_key = |key: &str| {
        let key: String = key.chars().filter(|c| !c.is_whitespace()).collect();
        key.eq_ignore_ascii_case("sslmode")
    };

    if let Some((base, query)) = conn.split_once('?').filter(|_| conn.contains("://")) {
        let mut mode = None;
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| match pair.split_once('=') {
                Some((k, v)) if is_ssl_key(k) => {
                    mode = Some(v.to_string());
                    false
                }
                _ => true,
            })
            .collect();
        let rebuilt = if kept.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, kept.join("&"))
        };
        return (rebuilt, mode);
    }

    if is_semicolon_form(conn) {
        let mut mode = None;
        let kept: Vec<&str> = conn
            .split(';')
            .filter(|part| match part.split_once('=') {
                Some((k, v)) if is_ssl_key(k) => {
                    mode = Some(v.trim().to_string());
                    false
                }
                _ => true,
            })
            .collect();
        return (kept.join(";"), mode);
    }

    let mut mode = None;
    let kept: Vec<&str> = keyword_pairs(conn)
        .into_iter()
        .filter(|pair| {
            if is_ssl_key(&pair.key) {
                mode = Some(pair.value.clone());
                false
            } else {
                true
            }
        })
        .map(|pair| pair.raw)
        .collect();
    (kept.join(" "), mode)
}

/// One setting of a libpq keyword/value string.
#[derive(Debug)]
struct KeywordPair<'a> {
    key: String,
    /// Unquoted and unescaped.
    value: String,
    /// The setting as written, quotes included.
    raw: &'a str,
}

/// Split `key = value` settings the way libpq does: whitespace separates
/// settings, may surround `=`, and single-quoted values may contain spaces
/// and `\'` or `\\` escapes.
fn keyword_pairs(conn: &str) -> Vec<KeywordPair<'_>> {
    let chars: Vec<(usize, char)> = conn.char_indices().collect();
    let offset = |i: usize| chars.get(i).map_or(conn.len(), |(b, _)| *b);
    let skip_ws = |mut i: usize| {
        while chars.get(i).is_some_and(|(_, c)| c.is_whitespace()) {
            i += 1;
        }
        i
    };

    let mut pairs = Vec::new();
    let mut i = skip_ws(0);
    while i < chars.len() {
        let start = i;
        let mut key = String::new();
        while let Some(&(_, c)) = chars.get(i) {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            i += 1;
        }

        i = skip_ws(i);
        if chars.get(i).map(|(_, c)| *c) == Some('=') {
            i = skip_ws(i + 1);
        }

        let mut value = String::new();
        let quoted = chars.get(i).map(|(_, c)| *c) == Some('\'');
        if quoted {
            i += 1;
        }
        while let Some(&(_, c)) = chars.get(i) {
            i += 1;
            match c {
                '\\' => {
                    if let Some(&(_, escaped)) = chars.get(i) {
                        value.push(escaped);
                        i += 1;
                    }
                }
                '\'' if quoted => break,
                c if !quoted && c.is_whitespace() => {
                    i -= 1;
                    break;
                }
                c => value.push(c),
            }
        }

        pairs.push(KeywordPair {
            key,
            value,
            raw: &conn[offset(start)..offset(i)],
        });
        i = skip_ws(i);
    }
    pairs
}

/// Parse the `Host=...;Port=...;Username=...` form used by .NET tooling.
fn parse_semicolon_form(conn: &str) -> Result<tokio_postgres::Config> {
    let mut config = tokio_postgres::Config::new();
    for part in conn.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            MigrateError::Config(format!(
                "invalid target.connection_string segment '{}'",
                part
            ))
        })?;
        let key: String = key
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let value = value.trim();
        match key.as_str() {
            "host" | "server" => {
                config.host(value);
            }
            "port" => {
                let port = value.parse::<u16>().map_err(|_| {
                    MigrateError::Config(format!("invalid port '{}' in target.connection_string", value))
                })?;
                config.port(port);
            }
            "username" | "userid" | "user" | "uid" => {
                config.user(value);
            }
            "password" | "pwd" => {
                config.password(value);
            }
            "database" | "dbname" => {
                config.dbname(value);
            }
            "timeout" => {
                let secs = value.parse::<u64>().map_err(|_| {
                    MigrateError::Config(format!(
                        "invalid timeout '{}' in target.connection_string",
                        value
                    ))
                })?;
                config.connect_timeout(Duration::from_secs(secs));
            }
            "applicationname" => {
                config.application_name(value);
            }
            other => warn!("Ignoring unknown target connection string key '{}'", other),
        }
    }
    Ok(config)
}
