// ── User account handler ──
//
// Login accounts, cluster-wide or owned by a vserver. ZAPI keeps one
// record per (application, authentication method); REST keeps one
// account with a list of applications.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use ontap_api::NaElement;

use super::{put, rest_outcome, segment, strings, zapi_call, zapi_query, zapi_records};
use crate::capability::{self, AttrMap, Capability, attr, key, option};
use crate::classify::ErrorClass;
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{Op, Plan, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "security/accounts";
const FIELDS: &str = "name,owner.uuid,owner.name,role.name,locked,applications";
const DEFAULT_AUTH: &str = "password";
pub const LOCK_WITHOUT_PASSWORD: &str = "Error: cannot modify lock state if password is not set.";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("user-name"),
    attr("applications").rest("applications").zapi("application").set(),
    attr("role_name").rest("role.name").zapi("role-name"),
    attr("lock_user").rest("locked").zapi("is-locked").boolean(),
    option("authentication_method"),
    option("set_password"),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub vserver: Option<String>,
    pub applications: Option<Vec<String>>,
    pub authentication_method: Option<String>,
    pub role_name: Option<String>,
    pub lock_user: Option<bool>,
    pub set_password: Option<SecretString>,
}

/// Compound user steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserExtra {
    SetPassword,
}

impl fmt::Display for UserExtra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetPassword => f.write_str("set password"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    p: UserParams,
}

impl User {
    fn auth_method(&self) -> &str {
        self.p.authentication_method.as_deref().unwrap_or(DEFAULT_AUTH)
    }

    fn item_path(current: Option<&Current>, name: &str) -> Result<String, CoreError> {
        let owner = current
            .and_then(|c| c.aux.get("owner_uuid"))
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Internal(format!("user {name} has no owner uuid")))?;
        Ok(format!("{REST_PATH}/{owner}/{}", segment(name)))
    }

    async fn get_rest(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let mut query = vec![("name", name.to_owned()), ("fields", FIELDS.to_owned())];
        if let Some(vserver) = &self.p.vserver {
            query.push(("owner.name", vserver.clone()));
        }
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_rest(CAPABILITIES, &record);
        let applications: Vec<Value> = record
            .get("applications")
            .and_then(Value::as_array)
            .map(|apps| apps.iter().filter_map(|a| a.get("application").cloned()).collect())
            .unwrap_or_default();
        attrs.insert("applications".into(), Value::Array(applications));
        let aux = json!({
            "owner_uuid": capability::json_get(&record, "owner.uuid")
                .cloned()
                .unwrap_or(Value::Null),
        });
        Ok(Some(Current::new(attrs).with_aux(aux)))
    }

    async fn get_zapi(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let mut fields = vec![("user-name", name)];
        if let Some(vserver) = &self.p.vserver {
            fields.push(("vserver", vserver.as_str()));
        }
        let request = zapi_query("security-login-get-iter", "security-login-account-info", &fields);
        let records = zapi_records(ctx, &request).await?;
        let Some(first) = records.first() else {
            return Ok(None);
        };
        let mut attrs = capability::from_zapi(CAPABILITIES, first);
        let mut applications: Vec<String> = Vec::new();
        let mut logins = Vec::new();
        for record in &records {
            let Some(app) = record.child_str("application") else { continue };
            if !applications.iter().any(|a| a == app) {
                applications.push(app.to_owned());
            }
            let method = record.child_str("authentication-method").unwrap_or(DEFAULT_AUTH);
            logins.push(json!({
                "application": app,
                "authentication_method": method,
            }));
        }
        attrs.insert("applications".into(), json!(applications));
        Ok(Some(Current::new(attrs).with_aux(json!({ "logins": logins }))))
    }

    fn login(&self, api: &str, application: &str, auth: &str) -> NaElement {
        let mut request = NaElement::new(api)
            .with_child_content("user-name", &self.p.name)
            .with_child_content("application", application)
            .with_child_content("authentication-method", auth);
        if let Some(vserver) = &self.p.vserver {
            request.add_new_child("vserver", vserver);
        }
        request
    }

    fn account(&self, api: &str) -> NaElement {
        let mut request = NaElement::new(api).with_child_content("user-name", &self.p.name);
        if let Some(vserver) = &self.p.vserver {
            request.add_new_child("vserver", vserver);
        }
        request
    }

    fn rest_applications(&self, applications: &[String]) -> Value {
        Value::Array(
            applications
                .iter()
                .map(|app| {
                    json!({ "application": app, "authentication_methods": [self.auth_method()] })
                })
                .collect(),
        )
    }

    async fn create_zapi(&self, ctx: &Context, attrs: &AttrMap) -> Result<(), HandlerError> {
        let applications = strings(attrs.get("applications"));
        for app in &applications {
            let mut request = self.login("security-login-create", app, self.auth_method());
            if let Some(role) = attrs.get("role_name") {
                request.add_new_child("role-name", capability::zapi_text(role));
            }
            if let Some(password) = &self.p.set_password {
                request.add_new_child("password", password.expose_secret());
            }
            zapi_call(ctx, &request).await?;
        }
        if attrs.get("lock_user").and_then(Value::as_bool) == Some(true) {
            zapi_call(ctx, &self.account("security-login-lock")).await?;
        }
        Ok(())
    }

    async fn modify_zapi(
        &self,
        ctx: &Context,
        attrs: &AttrMap,
        current: Option<&Current>,
    ) -> Result<(), HandlerError> {
        let logins: Vec<(String, String)> = current
            .and_then(|c| c.aux.get("logins"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|l| {
                        Some((
                            l.get("application")?.as_str()?.to_owned(),
                            l.get("authentication_method")?.as_str()?.to_owned(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let role = attrs
            .get("role_name")
            .or_else(|| current.and_then(|c| c.attrs.get("role_name")))
            .map(capability::zapi_text);

        if let Some(wanted) = attrs.get("applications") {
            let wanted = strings(Some(wanted));
            for app in wanted.iter().filter(|w| !logins.iter().any(|(a, _)| a == *w)) {
                let mut request = self.login("security-login-create", app, self.auth_method());
                if let Some(role) = &role {
                    request.add_new_child("role-name", role.as_str());
                }
                zapi_call(ctx, &request).await?;
            }
            for (app, auth) in logins.iter().filter(|(a, _)| !wanted.contains(a)) {
                zapi_call(ctx, &self.login("security-login-delete", app, auth)).await?;
            }
        }
        if let Some(role) = attrs.get("role_name") {
            let wanted = strings(attrs.get("applications"));
            let selected = logins
                .iter()
                .filter(|(a, _)| wanted.is_empty() || wanted.contains(a));
            for (app, auth) in selected {
                let mut request = self.login("security-login-modify", app, auth);
                request.add_new_child("role-name", capability::zapi_text(role));
                zapi_call(ctx, &request).await?;
            }
        }
        match attrs.get("lock_user").and_then(Value::as_bool) {
            Some(true) => {
                zapi_call(ctx, &self.account("security-login-lock")).await?;
            }
            Some(false) => {
                zapi_call(ctx, &self.account("security-login-unlock")).await?;
            }
            None => {}
        }
        Ok(())
    }

    fn rest_body(&self, attrs: &AttrMap) -> Value {
        let mut attrs = attrs.clone();
        let applications = attrs.shift_remove("applications");
        let mut body = super::object(capability::to_rest(CAPABILITIES, &attrs));
        if let Some(apps) = applications {
            body.insert("applications".into(), self.rest_applications(&strings(Some(&apps))));
        }
        Value::Object(body)
    }
}

impl ResourceHandler for User {
    type Params = UserParams;
    type Extra = UserExtra;

    const KIND: &'static str = "user";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec::NAME;

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: UserParams) -> Result<Self, CoreError> {
        let no_apps = params.applications.as_ref().is_some_and(Vec::is_empty);
        if params.state == State::Present && no_apps {
            return Err(CoreError::invalid("Error: applications must not be empty."));
        }
        Ok(Self { p: params })
    }

    fn state(&self) -> State {
        self.p.state
    }

    fn name(&self) -> &str {
        &self.p.name
    }

    fn vserver(&self) -> Option<&str> {
        self.p.vserver.as_deref()
    }

    fn ignore_missing_vserver_on_delete(&self) -> bool {
        true
    }

    fn desired(&self, _protocol: Protocol) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(self.p.name.clone()));
        put(&mut attrs, "applications", self.p.applications.as_ref());
        put(&mut attrs, "role_name", self.p.role_name.as_ref());
        put(&mut attrs, "lock_user", self.p.lock_user.as_ref());
        attrs
    }

    async fn get_current(
        &self,
        ctx: &mut Context,
        name: &str,
    ) -> Result<Option<Current>, HandlerError> {
        if ctx.is_rest() {
            self.get_rest(ctx, name).await
        } else {
            self.get_zapi(ctx, name).await
        }
    }

    async fn plan_extra(
        &self,
        _ctx: &mut Context,
        current: Option<&Current>,
        _desired: &AttrMap,
        plan: &mut Plan<UserExtra>,
    ) -> Result<(), HandlerError> {
        let Some(current) = current else {
            return Ok(());
        };
        let creating = plan.position(|s| matches!(s.op, Op::Create(_))).is_some();
        if self.p.state == State::Absent || creating {
            return Ok(());
        }
        let locks = plan.modify_attrs_mut().is_some_and(|m| m.contains_key("lock_user"));
        if locks && !current.attrs.contains_key("lock_user") && self.p.set_password.is_none() {
            return Err(CoreError::validation(LOCK_WITHOUT_PASSWORD).into());
        }
        // The current password cannot be read back, so check mode always
        // plans this step and reports changed. A live run that hits
        // PasswordReused tolerates it and reports unchanged.
        if self.p.set_password.is_some() {
            let step = Step::new(Op::Extra(UserExtra::SetPassword))
                .tolerating(&[ErrorClass::PasswordReused]);
            let at = plan
                .position(|s| matches!(s.op, Op::Modify(_)))
                .unwrap_or(plan.len());
            plan.insert(at, step);
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<UserExtra>,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        let rest = ctx.is_rest();
        match &step.op {
            Op::Create(attrs) if rest => {
                let mut body = super::object(self.rest_body(attrs));
                if let Some(vserver) = &self.p.vserver {
                    body.insert("owner".into(), json!({ "name": vserver }));
                }
                if let Some(password) = &self.p.set_password {
                    body.insert("password".into(), json!(password.expose_secret()));
                }
                Ok(rest_outcome(ctx.rest.post(REST_PATH, &Value::Object(body), &[]).await?))
            }
            Op::Create(attrs) => {
                self.create_zapi(ctx, attrs).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Modify(attrs) if rest => {
                let path = Self::item_path(current, &self.p.name)?;
                Ok(rest_outcome(ctx.rest.patch(&path, &self.rest_body(attrs), &[]).await?))
            }
            Op::Modify(attrs) => {
                self.modify_zapi(ctx, attrs, current).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Extra(UserExtra::SetPassword) => {
                let Some(password) = &self.p.set_password else {
                    return Ok(StepOutcome::NOTHING);
                };
                if rest {
                    let path = Self::item_path(current, &self.p.name)?;
                    let body = json!({ "password": password.expose_secret() });
                    Ok(rest_outcome(ctx.rest.patch(&path, &body, &[]).await?))
                } else {
                    let mut request = self.account("security-login-modify-password");
                    request.add_new_child("new-password", password.expose_secret());
                    zapi_call(ctx, &request).await?;
                    Ok(StepOutcome::DONE)
                }
            }
            Op::Delete if rest => {
                let path = Self::item_path(current, &self.p.name)?;
                Ok(rest_outcome(ctx.rest.delete(&path, None, &[]).await?))
            }
            Op::Delete => {
                let logins = current
                    .and_then(|c| c.aux.get("logins"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for login in &logins {
                    let (Some(app), Some(auth)) = (
                        login.get("application").and_then(Value::as_str),
                        login.get("authentication_method").and_then(Value::as_str),
                    ) else {
                        continue;
                    };
                    zapi_call(ctx, &self.login("security-login-delete", app, auth)).await?;
                }
                Ok(StepOutcome::DONE)
            }
            Op::Rename { .. } | Op::Unmount | Op::Offline => Ok(StepOutcome::NOTHING),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::handlers::offline_context;
    use crate::params;

    fn user(v: Value) -> User {
        User::new(params::parse(&User::ARGS, v.as_object().unwrap()).unwrap()).unwrap()
    }

    fn unlocked_record() -> Current {
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), json!("bob"));
        attrs.insert("applications".into(), json!(["http"]));
        Current::new(attrs).with_aux(json!({"owner_uuid": "o-1"}))
    }

    fn lock_plan() -> Plan<UserExtra> {
        let mut modify = AttrMap::new();
        modify.insert("lock_user".into(), json!(true));
        let mut plan = Plan::default();
        plan.push(Step::new(Op::Modify(modify)));
        plan
    }

    #[tokio::test]
    async fn locking_needs_a_password() {
        let u = user(json!({"name": "bob", "lock_user": true}));
        let mut ctx = offline_context(Protocol::Rest);
        let mut plan = lock_plan();
        let err = u
            .plan_extra(&mut ctx, Some(&unlocked_record()), &AttrMap::new(), &mut plan)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), LOCK_WITHOUT_PASSWORD);
    }

    #[tokio::test]
    async fn password_is_set_before_locking() {
        let u = user(json!({"name": "bob", "lock_user": true, "set_password": "n3w-pass"}));
        let mut ctx = offline_context(Protocol::Rest);
        let mut plan = lock_plan();
        u.plan_extra(&mut ctx, Some(&unlocked_record()), &AttrMap::new(), &mut plan)
            .await
            .unwrap();
        assert_eq!(
            plan.describe("user", "bob"),
            vec!["set password (user bob)", "modify user bob: lock_user"]
        );
        assert!(plan.steps()[0].tolerate.contains(&ErrorClass::PasswordReused));
    }

    #[test]
    fn account_path_uses_owner_uuid() {
        let path = User::item_path(Some(&unlocked_record()), "bob smith").unwrap();
        assert_eq!(path, "security/accounts/o-1/bob%20smith");
        assert!(User::item_path(None, "bob").is_err());
    }

    #[test]
    fn rest_applications_carry_the_auth_method() {
        let u = user(json!({"name": "bob", "authentication_method": "publickey"}));
        let mut attrs = AttrMap::new();
        attrs.insert("applications".into(), json!(["ssh"]));
        assert_eq!(
            u.rest_body(&attrs),
            json!({
                "applications": [{"application": "ssh", "authentication_methods": ["publickey"]}]
            })
        );
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let u = user(json!({"name": "bob", "set_password": "s3cret"}));
        assert!(!format!("{u:?}").contains("s3cret"));
    }
}
