//! Action types and execution
//!
//! Actions run strictly in order over one shared mutable variable map, so a
//! `variable` action is visible to every action after it. Side effects that
//! leave the engine go through the [`ServiceCaller`] and [`NotificationSink`]
//! collaborators held by [`ActionEnv`].

use async_trait::async_trait;
use dashmap::DashMap;
use ha_core::parse_duration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::condition::{Condition, ConditionError};
use crate::template::{render_string, render_value};
use crate::trigger::default_enabled;
use crate::Variables;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);
const SERVICE_ESTIMATE: Duration = Duration::from_millis(500);
const DEFAULT_ESTIMATE: Duration = Duration::from_millis(100);

/// Action errors
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    Invalid(String),

    #[error("invalid delay duration: {0}")]
    InvalidDuration(String),

    #[error("action cancelled")]
    Cancelled,

    #[error("service call {service} failed: {reason}")]
    ServiceCall { service: String, reason: String },

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("script timed out after {timeout:?}")]
    ScriptTimeout { timeout: Duration },

    #[error("script exited with {status}: {output}")]
    ScriptFailed { status: String, output: String },

    #[error("failed to start script {command}: {source}")]
    ScriptSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("condition evaluation failed: {0}")]
    Condition(#[from] ConditionError),
}

/// Result type for action operations
pub type ActionResult<T> = Result<T, ActionError>;

/// Future returned by [`Action::execute`]
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = ActionResult<()>> + Send + 'a>>;

// --- Collaborators ---

/// A service call handed to the [`ServiceCaller`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,

    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

/// Executes service calls outside the engine
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    async fn call_service(&self, call: ServiceCall) -> Result<(), String>;
}

/// Default service caller that only logs
#[derive(Debug, Default, Clone)]
pub struct LoggingServiceCaller;

#[async_trait]
impl ServiceCaller for LoggingServiceCaller {
    async fn call_service(&self, call: ServiceCall) -> Result<(), String> {
        let data = Value::Object(call.data.clone());
        info!(
            service = %call.service,
            entity_id = ?call.entity_id,
            data = %data,
            "Service call"
        );
        Ok(())
    }
}

/// Where a notification is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationChannel {
    WebSocket,
    Email,
    Other(String),
}

impl NotificationChannel {
    /// Route a `target` string; empty means websocket
    pub fn from_target(target: &str) -> Self {
        match target {
            "" | "websocket" => NotificationChannel::WebSocket,
            "email" => NotificationChannel::Email,
            other => NotificationChannel::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NotificationChannel::WebSocket => "websocket",
            NotificationChannel::Email => "email",
            NotificationChannel::Other(s) => s,
        }
    }
}

/// A rendered notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub target: String,

    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Delivers notifications outside the engine
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(
        &self,
        channel: NotificationChannel,
        notification: Notification,
    ) -> Result<(), String>;
}

/// Default notification sink that only logs
#[derive(Debug, Default, Clone)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn send(
        &self,
        channel: NotificationChannel,
        notification: Notification,
    ) -> Result<(), String> {
        info!(
            channel = channel.as_str(),
            title = %notification.title,
            message = %notification.message,
            "Notification"
        );
        Ok(())
    }
}

/// Everything an action needs from the engine
#[derive(Clone)]
pub struct ActionEnv {
    pub service_caller: Arc<dyn ServiceCaller>,
    pub notifier: Arc<dyn NotificationSink>,
    pub http: reqwest::Client,
    pub globals: Arc<DashMap<String, Value>>,
}

impl ActionEnv {
    pub fn new(
        service_caller: Arc<dyn ServiceCaller>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            service_caller,
            notifier,
            http: reqwest::Client::new(),
            globals: Arc::new(DashMap::new()),
        }
    }
}

impl Default for ActionEnv {
    fn default() -> Self {
        Self::new(Arc::new(LoggingServiceCaller), Arc::new(LoggingNotificationSink))
    }
}

impl std::fmt::Debug for ActionEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionEnv")
            .field("globals", &self.globals.len())
            .finish_non_exhaustive()
    }
}

// --- Action definitions ---

/// Action definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Call a service
    Service(ServiceAction),

    /// Send a notification
    Notification(NotificationAction),

    /// Wait for a duration
    Delay(DelayAction),

    /// Set a rule or global variable
    Variable(VariableAction),

    /// Make an HTTP request
    #[serde(rename = "http")]
    Http(HttpAction),

    /// Run an external command
    Script(ScriptAction),

    /// Branch on conditions
    Conditional(ConditionalAction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAction {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub service: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

impl ServiceAction {
    pub fn new(id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            service: service.into(),
            entity_id: None,
            data: Map::new(),
            target: None,
        }
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub message: String,

    /// `websocket` (default), `email` or any other channel name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl NotificationAction {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            title: title.into(),
            message: message.into(),
            target: String::new(),
            data: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayAction {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub duration: String,
}

impl DelayAction {
    pub fn new(id: impl Into<String>, duration: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            duration: duration.into(),
        }
    }
}

/// Where a variable action writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    #[default]
    Rule,
    Global,
}

impl VariableScope {
    fn is_rule(&self) -> bool {
        *self == VariableScope::Rule
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableAction {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub variable: String,

    #[serde(default)]
    pub value: Value,

    #[serde(default, skip_serializing_if = "VariableScope::is_rule")]
    pub scope: VariableScope,
}

impl VariableAction {
    pub fn new(id: impl Into<String>, variable: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            variable: variable.into(),
            value: value.into(),
            scope: VariableScope::Rule,
        }
    }

    pub fn global(mut self) -> Self {
        self.scope = VariableScope::Global;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpAction {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub url: String,

    /// Defaults to GET
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl HttpAction {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            url: url.into(),
            method: String::new(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Unset or unparseable timeouts fall back to 30s
    fn effective_timeout(&self) -> Duration {
        self.timeout
            .as_deref()
            .and_then(|t| parse_duration(t).ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT)
    }

    async fn run(
        &self,
        env: &ActionEnv,
        cancel: &CancellationToken,
        data: &Variables,
    ) -> ActionResult<()> {
        let method = if self.method.is_empty() {
            reqwest::Method::GET
        } else {
            reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes())
                .map_err(|_| ActionError::InvalidMethod(self.method.clone()))?
        };
        let url = render_string(&self.url, data);

        let mut request = env
            .http
            .request(method.clone(), &url)
            .timeout(self.effective_timeout());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), render_string(value, data));
        }
        if let Some(body) = &self.body {
            request = request.json(&render_value(body, data));
        }

        debug!(method = %method, url = %url, "Sending HTTP request");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ActionError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ActionError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        debug!(status = status.as_u16(), url = %url, "HTTP request completed");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptAction {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl ScriptAction {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            command: command.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn effective_timeout(&self) -> Duration {
        self.timeout
            .as_deref()
            .and_then(|t| parse_duration(t).ok())
            .unwrap_or(DEFAULT_SCRIPT_TIMEOUT)
    }

    async fn run(&self, cancel: &CancellationToken, data: &Variables) -> ActionResult<()> {
        let command = render_string(&self.command, data);
        let args: Vec<String> = self.args.iter().map(|a| render_string(a, data)).collect();
        let timeout = self.effective_timeout();

        let child = Command::new(&command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ActionError::ScriptSpawn {
                command: command.clone(),
                source,
            })?;

        // Dropping the output future kills the child
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ActionError::Cancelled),
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(output) => output.map_err(|source| ActionError::ScriptSpawn {
                    command: command.clone(),
                    source,
                })?,
                Err(_) => return Err(ActionError::ScriptTimeout { timeout }),
            },
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ActionError::ScriptFailed {
                status: output.status.to_string(),
                output: combined,
            });
        }
        debug!(command = %command, output = %combined.trim(), "Script completed");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalAction {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub then_actions: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub else_actions: Vec<Action>,
}

impl ConditionalAction {
    pub fn new(
        id: impl Into<String>,
        conditions: Vec<Condition>,
        then_actions: Vec<Action>,
    ) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            enabled: true,
            conditions,
            then_actions,
            else_actions: Vec::new(),
        }
    }

    pub fn with_else(mut self, else_actions: Vec<Action>) -> Self {
        self.else_actions = else_actions;
        self
    }
}

impl Action {
    pub fn id(&self) -> &str {
        match self {
            Action::Service(a) => &a.id,
            Action::Notification(a) => &a.id,
            Action::Delay(a) => &a.id,
            Action::Variable(a) => &a.id,
            Action::Http(a) => &a.id,
            Action::Script(a) => &a.id,
            Action::Conditional(a) => &a.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: String) {
        match self {
            Action::Service(a) => a.id = id,
            Action::Notification(a) => a.id = id,
            Action::Delay(a) => a.id = id,
            Action::Variable(a) => a.id = id,
            Action::Http(a) => a.id = id,
            Action::Script(a) => a.id = id,
            Action::Conditional(a) => a.id = id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Service(_) => "service",
            Action::Notification(_) => "notification",
            Action::Delay(_) => "delay",
            Action::Variable(_) => "variable",
            Action::Http(_) => "http",
            Action::Script(_) => "script",
            Action::Conditional(_) => "conditional",
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Action::Service(a) => a.enabled,
            Action::Notification(a) => a.enabled,
            Action::Delay(a) => a.enabled,
            Action::Variable(a) => a.enabled,
            Action::Http(a) => a.enabled,
            Action::Script(a) => a.enabled,
            Action::Conditional(a) => a.enabled,
        }
    }

    /// Execute the action
    ///
    /// Disabled actions return immediately. `data` is shared with every
    /// later action of the same run.
    pub fn execute<'a>(
        &'a self,
        env: &'a ActionEnv,
        cancel: &'a CancellationToken,
        data: &'a mut Variables,
    ) -> ActionFuture<'a> {
        Box::pin(async move {
            if !self.enabled() {
                debug!(action_id = %self.id(), "Action disabled, skipping");
                return Ok(());
            }

            match self {
                Action::Service(a) => {
                    let call = ServiceCall {
                        service: a.service.clone(),
                        data: render_map(&a.data, data),
                        entity_id: a.entity_id.as_ref().map(|e| render_string(e, data)),
                        target: a.target.as_ref().map(|t| render_value(t, data)),
                    };
                    env.service_caller
                        .call_service(call)
                        .await
                        .map_err(|reason| ActionError::ServiceCall {
                            service: a.service.clone(),
                            reason,
                        })
                }
                Action::Notification(a) => {
                    let channel = NotificationChannel::from_target(&a.target);
                    let notification = Notification {
                        title: render_string(&a.title, data),
                        message: render_string(&a.message, data),
                        target: channel.as_str().to_string(),
                        data: render_map(&a.data, data),
                    };
                    env.notifier
                        .send(channel, notification)
                        .await
                        .map_err(ActionError::Notification)
                }
                Action::Delay(a) => {
                    let duration = parse_duration(&a.duration)
                        .map_err(|e| ActionError::InvalidDuration(e.to_string()))?;
                    debug!(action_id = %a.id, ?duration, "Delaying");
                    tokio::select! {
                        _ = cancel.cancelled() => Err(ActionError::Cancelled),
                        _ = tokio::time::sleep(duration) => Ok(()),
                    }
                }
                Action::Variable(a) => {
                    let value = render_value(&a.value, data);
                    match a.scope {
                        VariableScope::Rule => {
                            data.insert(a.variable.clone(), value);
                        }
                        VariableScope::Global => {
                            env.globals.insert(a.variable.clone(), value);
                        }
                    }
                    Ok(())
                }
                Action::Http(a) => a.run(env, cancel, data).await,
                Action::Script(a) => a.run(cancel, data).await,
                Action::Conditional(a) => {
                    let mut holds = true;
                    for condition in &a.conditions {
                        if !condition.evaluate(data)? {
                            holds = false;
                            break;
                        }
                    }
                    let branch = if holds { &a.then_actions } else { &a.else_actions };
                    for action in branch {
                        action.execute(env, cancel, data).await?;
                    }
                    Ok(())
                }
            }
        })
    }

    /// Rough duration of one run of this action
    pub fn estimate_execution_time(&self) -> Duration {
        match self {
            Action::Service(_) => SERVICE_ESTIMATE,
            Action::Delay(a) => parse_duration(&a.duration).unwrap_or(DEFAULT_ESTIMATE),
            Action::Http(a) => a.effective_timeout(),
            Action::Script(a) => a.effective_timeout(),
            Action::Conditional(a) => {
                let sum = |actions: &[Action]| -> Duration {
                    actions.iter().map(Action::estimate_execution_time).sum()
                };
                sum(&a.then_actions).max(sum(&a.else_actions))
            }
            Action::Notification(_) | Action::Variable(_) => DEFAULT_ESTIMATE,
        }
    }

    /// Validate the action configuration
    pub fn validate(&self) -> ActionResult<()> {
        if self.id().is_empty() {
            return Err(invalid("action ID is required"));
        }

        match self {
            Action::Service(a) if a.service.is_empty() => {
                Err(invalid("service is required for service action"))
            }
            Action::Notification(a) if a.title.is_empty() && a.message.is_empty() => Err(
                invalid("title or message is required for notification action"),
            ),
            Action::Delay(a) => {
                if a.duration.is_empty() {
                    return Err(invalid("duration is required for delay action"));
                }
                parse_duration(&a.duration)
                    .map(|_| ())
                    .map_err(|e| invalid(format!("invalid duration format: {}", e)))
            }
            Action::Variable(a) if a.variable.is_empty() => {
                Err(invalid("variable name is required for variable action"))
            }
            Action::Http(a) if a.url.is_empty() => Err(invalid("URL is required for HTTP action")),
            Action::Script(a) if a.command.is_empty() => {
                Err(invalid("command is required for script action"))
            }
            Action::Conditional(a) => {
                if a.conditions.is_empty() {
                    return Err(invalid(
                        "at least one condition is required for conditional action",
                    ));
                }
                if a.then_actions.is_empty() {
                    return Err(invalid(
                        "at least one then action is required for conditional action",
                    ));
                }
                for (i, condition) in a.conditions.iter().enumerate() {
                    condition
                        .validate()
                        .map_err(|e| invalid(format!("condition {}: {}", i, e)))?;
                }
                for (i, action) in a.then_actions.iter().enumerate() {
                    action
                        .validate()
                        .map_err(|e| invalid(format!("then action {}: {}", i, e)))?;
                }
                for (i, action) in a.else_actions.iter().enumerate() {
                    action
                        .validate()
                        .map_err(|e| invalid(format!("else action {}: {}", i, e)))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl From<ServiceAction> for Action {
    fn from(a: ServiceAction) -> Self {
        Action::Service(a)
    }
}

impl From<NotificationAction> for Action {
    fn from(a: NotificationAction) -> Self {
        Action::Notification(a)
    }
}

impl From<DelayAction> for Action {
    fn from(a: DelayAction) -> Self {
        Action::Delay(a)
    }
}

impl From<VariableAction> for Action {
    fn from(a: VariableAction) -> Self {
        Action::Variable(a)
    }
}

impl From<HttpAction> for Action {
    fn from(a: HttpAction) -> Self {
        Action::Http(a)
    }
}

impl From<ScriptAction> for Action {
    fn from(a: ScriptAction) -> Self {
        Action::Script(a)
    }
}

impl From<ConditionalAction> for Action {
    fn from(a: ConditionalAction) -> Self {
        Action::Conditional(a)
    }
}

fn invalid(message: impl Into<String>) -> ActionError {
    ActionError::Invalid(message.into())
}

fn render_map(map: &Map<String, Value>, data: &Variables) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), render_value(v, data)))
        .collect()
}
