//! Spawn request types and wire-level validation.
//!
//! A request arrives as one field tuple with a fixed field order:
//! `app_root`, `lower_privilege`, `lowest_user`, `environment`,
//! `spawn_method`, `app_type`, `framework_spawner_timeout`,
//! `app_spawner_timeout`. Timeouts are integer seconds; `0` selects the
//! built-in default for that stage.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SpawnError;

/// Number of fields in a spawn request tuple.
pub const SPAWN_REQUEST_FIELDS: usize = 8;

/// Default budget for the framework preparation stage.
pub const DEFAULT_FRAMEWORK_SPAWNER_TIMEOUT: Duration = Duration::from_secs(300);

/// Default budget for the launch-to-readiness stage.
pub const DEFAULT_APP_SPAWNER_TIMEOUT: Duration = Duration::from_secs(120);

/// Strategy controlling how much framework state is pre-warmed before a
/// worker launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpawnMethod {
    /// Prepare the framework once per app root and reuse it.
    Smart,
    /// Prepare the framework fresh for every worker.
    Conservative,
    /// Launch without any framework preparation.
    Direct,
}

impl SpawnMethod {
    pub fn parse(token: &str) -> Result<Self, SpawnError> {
        match token {
            "smart" => Ok(Self::Smart),
            "conservative" => Ok(Self::Conservative),
            "direct" => Ok(Self::Direct),
            _ => Err(SpawnError::UnknownSpawnMethod {
                token: token.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Conservative => "conservative",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for SpawnMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of application the worker hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppType {
    Rails,
    Rack,
    Wsgi,
}

impl AppType {
    pub fn parse(token: &str) -> Result<Self, SpawnError> {
        match token {
            "rails" => Ok(Self::Rails),
            "rack" => Ok(Self::Rack),
            "wsgi" => Ok(Self::Wsgi),
            _ => Err(SpawnError::UnknownAppType {
                token: token.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rails => "rails",
            Self::Rack => "rack",
            Self::Wsgi => "wsgi",
        }
    }

    /// Entry file that marks a well-formed app root for this type.
    pub fn entry_file(&self) -> &'static str {
        match self {
            Self::Rails => "config/environment.rb",
            Self::Rack => "config.ru",
            Self::Wsgi => "passenger_wsgi.py",
        }
    }

    /// Variable the environment token is applied through in the child.
    pub fn environment_variable(&self) -> &'static str {
        match self {
            Self::Rails => "RAILS_ENV",
            Self::Rack => "RACK_ENV",
            Self::Wsgi => "WSGI_ENV",
        }
    }

    /// Loader shim that boots this app type's entry point.
    pub fn loader_program(&self) -> &'static str {
        match self {
            Self::Rails => "rails-loader",
            Self::Rack => "rack-loader",
            Self::Wsgi => "wsgi-loader",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated spawn request. Immutable once decoded; owned by the
/// processing lifecycle of a single request.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub app_root: PathBuf,
    pub lower_privilege: bool,
    pub lowest_user: String,
    pub environment: String,
    pub spawn_method: SpawnMethod,
    pub app_type: AppType,
    pub framework_spawner_timeout: Duration,
    pub app_spawner_timeout: Duration,
}

impl SpawnRequest {
    /// Validate a raw field tuple into a request.
    pub fn decode(fields: &[String]) -> Result<Self, SpawnError> {
        if fields.len() != SPAWN_REQUEST_FIELDS {
            return Err(SpawnError::MalformedRequest {
                reason: format!(
                    "expected {} fields, got {}",
                    SPAWN_REQUEST_FIELDS,
                    fields.len()
                ),
            });
        }

        if fields[0].is_empty() {
            return Err(SpawnError::MalformedRequest {
                reason: "app_root may not be empty".to_string(),
            });
        }
        let app_root = PathBuf::from(&fields[0]);

        let lower_privilege = parse_bool("lower_privilege", &fields[1])?;
        let lowest_user = fields[2].clone();

        if fields[3].is_empty() {
            return Err(SpawnError::MalformedRequest {
                reason: "environment may not be empty".to_string(),
            });
        }
        let environment = fields[3].clone();

        let spawn_method = SpawnMethod::parse(&fields[4])?;
        let app_type = AppType::parse(&fields[5])?;

        let framework_spawner_timeout = parse_timeout(
            "framework_spawner_timeout",
            &fields[6],
            DEFAULT_FRAMEWORK_SPAWNER_TIMEOUT,
        )?;
        let app_spawner_timeout =
            parse_timeout("app_spawner_timeout", &fields[7], DEFAULT_APP_SPAWNER_TIMEOUT)?;

        Ok(Self {
            app_root,
            lower_privilege,
            lowest_user,
            environment,
            spawn_method,
            app_type,
            framework_spawner_timeout,
            app_spawner_timeout,
        })
    }
}

fn parse_bool(name: &str, token: &str) -> Result<bool, SpawnError> {
    match token {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SpawnError::MalformedRequest {
            reason: format!("{name} must be 'true' or 'false', got '{token}'"),
        }),
    }
}

fn parse_timeout(name: &str, token: &str, default: Duration) -> Result<Duration, SpawnError> {
    let seconds: u64 = token.parse().map_err(|_| SpawnError::MalformedRequest {
        reason: format!("{name} must be an integer number of seconds, got '{token}'"),
    })?;
    if seconds == 0 {
        Ok(default)
    } else {
        Ok(Duration::from_secs(seconds))
    }
}
