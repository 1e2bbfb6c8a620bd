//! Operator commands, as text verbs or JSON messages, mapped onto
//! [`Handlers`].
//!
//! | Text | JSON `type` | Handler |
//! |------|-------------|---------|
//! | `get status <target>`, `status <target>` | `get_app` | [`Handlers::status`] |
//! | `update <target>` | `update` | [`Handlers::update_all`] / [`Handlers::update_one`] |
//! | `upgrade <app>.<name>` | `upgrade` | [`Handlers::upgrade`] |
//! | | `set_app` | [`Handlers::set_deployment`] |
//! | `hold <app>.<name>` | `hold` | [`Handlers::hold`] |
//! | `release <app>.<name>` | `release` | [`Handlers::release`] |
//! | `remove <app>.<name>` | `remove` | [`Handlers::remove`] |
//!
//! `<target>` is `all` or `<app>.<name>`. JSON messages look like
//! `{"type": "upgrade", "message": "immich.server"}`, optionally wrapped in
//! `{"data": {...}}`.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;

use crate::handlers::Handlers;
use crate::models::Deployment;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownVerb(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(String),

    #[error("expected 'all' or '<app>.<name>', got '{0}'")]
    InvalidTarget(String),

    #[error("expected '<app>.<name>', got '{0}'")]
    InvalidIdentity(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// One deployment or all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    One { app: String, name: String },
}

impl FromStr for Target {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Target::All);
        }
        let (app, name) =
            parse_identity(s).map_err(|_| CommandError::InvalidTarget(s.to_string()))?;
        Ok(Target::One { app, name })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("all"),
            Target::One { app, name } => write!(f, "{}.{}", app, name),
        }
    }
}

/// Split `app.name` at the first dot.
pub fn parse_identity(s: &str) -> Result<(String, String), CommandError> {
    match s.trim().split_once('.') {
        Some((app, name)) if !app.is_empty() && !name.is_empty() => {
            Ok((app.to_string(), name.to_string()))
        }
        _ => Err(CommandError::InvalidIdentity(s.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status(Target),
    Update(Target),
    Upgrade { app: String, name: String },
    SetDeployment(Box<Deployment>),
    Hold { app: String, name: String },
    Release { app: String, name: String },
    Remove { app: String, name: String },
}

impl Command {
    /// Parse a text command such as `upgrade immich.server`.
    pub fn parse_text(text: &str) -> Result<Self, CommandError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let (verb, rest) = words.split_first().ok_or(CommandError::Empty)?;
        let verb = verb.to_ascii_lowercase();

        let (verb, args) = match (verb.as_str(), rest) {
            ("get", [sub, args @ ..]) if sub.eq_ignore_ascii_case("status") => ("status", args),
            (verb, args) => (verb, args),
        };
        let arg = || {
            args.first()
                .copied()
                .ok_or_else(|| CommandError::MissingArgument(verb.to_string()))
        };

        match verb {
            "status" => Ok(Command::Status(arg()?.parse()?)),
            "update" => Ok(Command::Update(arg()?.parse()?)),
            "upgrade" | "hold" | "release" | "remove" => {
                let (app, name) = parse_identity(arg()?)?;
                Ok(Self::single(verb, app, name))
            }
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }

    /// Parse a JSON message, with or without a `data` envelope.
    pub fn from_json(value: &Value) -> Result<Self, CommandError> {
        let value = value.get("data").unwrap_or(value);
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandError::InvalidMessage("missing 'type'".into()))?;
        let message = value
            .get("message")
            .ok_or_else(|| CommandError::InvalidMessage("missing 'message'".into()))?;
        let text = || {
            message
                .as_str()
                .ok_or_else(|| CommandError::InvalidMessage(format!("'{}' expects a string", kind)))
        };

        match kind {
            "get_app" => Ok(Command::Status(text()?.parse()?)),
            "update" => Ok(Command::Update(text()?.parse()?)),
            "upgrade" | "hold" | "release" | "remove" => {
                let (app, name) = parse_identity(text()?)?;
                Ok(Self::single(kind, app, name))
            }
            "set_app" => {
                let record = match message {
                    Value::String(s) => serde_json::from_str::<Deployment>(s),
                    other => serde_json::from_value::<Deployment>(other.clone()),
                }
                .map_err(|e| CommandError::InvalidMessage(e.to_string()))?;
                Ok(Command::SetDeployment(Box::new(record)))
            }
            other => Err(CommandError::UnknownType(other.to_string())),
        }
    }

    fn single(verb: &str, app: String, name: String) -> Self {
        match verb {
            "hold" => Command::Hold { app, name },
            "release" => Command::Release { app, name },
            "remove" => Command::Remove { app, name },
            _ => Command::Upgrade { app, name },
        }
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse_text(s)
    }
}

/// Run a command and describe the result in one line (or the status table).
pub async fn dispatch(handlers: &Handlers, command: Command) -> Result<String> {
    tracing::info!(command = ?command, "dispatching");
    match command {
        Command::Status(target) => handlers.status(&target).await,
        Command::Update(Target::All) => Ok(handlers.update_all().await?.summary()),
        Command::Update(Target::One { app, name }) => {
            Ok(match handlers.update_one(&app, &name).await? {
                Some(d) => format!("{} updated to {}", d.identity(), d.latest_version),
                None => format!("{}.{}: no new version", app, name),
            })
        }
        Command::Upgrade { app, name } => {
            Ok(handlers.upgrade(&app, &name).await?.describe(&app, &name))
        }
        Command::SetDeployment(d) => {
            handlers.set_deployment(&d).await?;
            Ok(format!("{} saved", d.identity()))
        }
        Command::Hold { app, name } => Ok(found(
            handlers.hold(&app, &name).await?,
            &app,
            &name,
            "is on hold",
        )),
        Command::Release { app, name } => Ok(found(
            handlers.release(&app, &name).await?,
            &app,
            &name,
            "released",
        )),
        Command::Remove { app, name } => Ok(found(
            handlers.remove(&app, &name).await?,
            &app,
            &name,
            "removed",
        )),
    }
}

fn found(ok: bool, app: &str, name: &str, done: &str) -> String {
    if ok {
        format!("{}.{} {}", app, name, done)
    } else {
        format!("{}.{} not found", app, name)
    }
}
