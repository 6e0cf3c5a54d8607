//! `apply`: read a task, resolve the connection, run one invocation.

use std::io::Read;
use std::path::Path;

use secrecy::SecretString;
use serde_json::{Map, Value};
use tracing::debug;

use ontap_config::{self as config, PASSWORD_ENV};
use ontap_core::params::split_connection;
use ontap_core::{ConnectionArgs, ResourceKind, Session};

use crate::cli::{ApplyArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

/// A parsed task file.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub resource: Option<String>,
    pub check_mode: bool,
    pub params: Map<String, Value>,
}

impl Task {
    /// Accept `{resource, check_mode, params}` or a bare parameter mapping.
    pub fn from_value(value: Value, path: &str) -> Result<Self, CliError> {
        let invalid = |reason: &str| CliError::Task {
            path: path.to_owned(),
            reason: reason.to_owned(),
        };
        let Value::Object(mut map) = value else {
            return Err(invalid("expected a mapping at the top level"));
        };
        let Some(params) = map.remove("params") else {
            return Ok(Self {
                resource: None,
                check_mode: false,
                params: map,
            });
        };
        let Value::Object(params) = params else {
            return Err(invalid("`params` must be a mapping"));
        };
        let resource = match map.remove("resource") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(invalid("`resource` must be a string")),
        };
        let check_mode = match map.remove("check_mode") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => b,
            Some(_) => return Err(invalid("`check_mode` must be a boolean")),
        };
        if let Some(extra) = map.keys().next() {
            return Err(invalid(&format!("unexpected top-level key `{extra}`")));
        }
        Ok(Self {
            resource,
            check_mode,
            params,
        })
    }
}

/// Read and parse a task file; `-` is stdin. `.json` files parse as
/// JSON, anything else as YAML.
pub fn read_task(path: &Path) -> Result<Task, CliError> {
    let shown = path.display().to_string();
    let raw = if shown == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CliError::FileNotFound { path: shown.clone() },
            _ => CliError::Io(e),
        })?
    };
    let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let value: Value = if is_json {
        serde_json::from_str(&raw).map_err(|e| CliError::Task {
            path: shown.clone(),
            reason: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&raw).map_err(|e| CliError::Task {
            path: shown.clone(),
            reason: e.to_string(),
        })?
    };
    Task::from_value(value, &shown)
}

/// Connection options given as global flags.
fn flag_layer(global: &GlobalOpts) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(hostname) = &global.hostname {
        map.insert("hostname".into(), Value::String(hostname.clone()));
    }
    if let Some(username) = &global.username {
        map.insert("username".into(), Value::String(username.clone()));
    }
    if let Some(use_rest) = global.use_rest {
        map.insert("use_rest".into(), Value::String(use_rest.as_str().to_owned()));
    }
    if global.insecure {
        map.insert("validate_certs".into(), Value::Bool(false));
    }
    if let Some(timeout) = global.timeout {
        map.insert("timeout".into(), Value::from(timeout));
    }
    map
}

/// Task values, then flags, then profile, then defaults.
fn resolve_connection(
    global: &GlobalOpts,
    task_connection: Map<String, Value>,
) -> Result<ConnectionArgs, CliError> {
    let cfg = config::load_config()?;
    let profile = cfg.profile(global.profile.as_deref())?;

    let layer = config::connection_layer(&cfg.defaults, profile.as_ref().map(|(_, p)| *p));
    let layer = config::overlay(layer, flag_layer(global));
    let layer = config::overlay(layer, task_connection);

    let password = if layer.contains_key("password") {
        None
    } else if let Some((name, profile)) = &profile {
        Some(config::resolve_password(profile, name)?)
    } else {
        std::env::var(PASSWORD_ENV).ok().map(SecretString::from)
    };
    Ok(config::connection_args(layer, password.as_ref())?)
}

pub async fn handle(args: ApplyArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let task = read_task(&args.file)?;
    let resource = args
        .resource
        .or(task.resource)
        .ok_or(CliError::NoResource)?;
    let kind = ResourceKind::parse(&resource)?;
    let check_mode = args.check || task.check_mode;

    let (connection, params) = split_connection(task.params);
    let connection = resolve_connection(global, connection)?;
    debug!(resource = %kind, hostname = %connection.hostname, check_mode, "applying task");

    let session = Session::connect(connection)?;
    let outcome = kind.apply(&session, params, check_mode).await?;

    let color = output::should_color(global.color);
    let rendered =
        output::render_single(global.output, &outcome, |o| output::outcome_summary(o, color));
    output::print_output(&rendered, global.quiet);
    Ok(())
}
