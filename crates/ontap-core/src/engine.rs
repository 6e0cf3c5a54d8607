// ── Reconciliation engine ──
//
// Drives one invocation end to end: validate parameters, probe the
// controller, pick a protocol, read current state, diff, plan, then
// either describe the plan (check mode) or execute it step by step,
// waiting on each job before issuing the next request.

use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use ontap_api::{ClusterEndpoint, Credentials, RestClient, TransportConfig, ZapiClient};

use crate::capability::AttrMap;
use crate::classify::{self, ErrorClass};
use crate::config::{ConnectionArgs, ValidateChanges};
use crate::diff::{self, DiffOutcome};
use crate::error::{ApiFailure, CoreError};
use crate::handler::{Context, Current, HandlerError, ResourceHandler};
use crate::job::{JobRef, JobResult, JobTracker};
use crate::params::{self, State};
use crate::planner::{self, CdAction, DeleteStages, Op, Plan, PlanInput, Step};
use crate::protocol;
use crate::result::Outcome;
use crate::version::{self, VersionInfo};

// ── Session ──────────────────────────────────────────────────────────

/// Clients and cached controller facts for one cluster.
///
/// The version probe runs at most once per session.
#[derive(Debug)]
pub struct Session {
    rest: RestClient,
    zapi: ZapiClient,
    args: ConnectionArgs,
    version: OnceCell<VersionInfo>,
    jobs: JobTracker,
}

impl Session {
    /// Build both adapters from the entry-point options. No I/O happens here.
    pub fn connect(args: ConnectionArgs) -> Result<Self, CoreError> {
        let transport = TransportConfig {
            timeout: args.request_timeout(),
            trace_apis: args.feature_flags.trace_apis,
            ..TransportConfig::default()
        }
        .with_validate_certs(args.validate_certs, args.ca_cert.clone());
        let endpoint = ClusterEndpoint {
            hostname: args.hostname.clone(),
            https: args.https,
            port: args.http_port,
        };
        let credentials = Credentials::new(args.username.clone(), args.password.clone());

        let rest = RestClient::new(&endpoint, credentials.clone(), &transport)?;
        let zapi = ZapiClient::new(&endpoint, credentials, &transport)?;
        debug!(hostname = %args.hostname, https = args.https, "session configured");
        Ok(Self::with_clients(rest, zapi, args))
    }

    /// Wrap pre-built adapters.
    pub fn with_clients(rest: RestClient, zapi: ZapiClient, args: ConnectionArgs) -> Self {
        let jobs = JobTracker::new(args.poll_interval());
        Self {
            rest,
            zapi,
            args,
            version: OnceCell::new(),
            jobs,
        }
    }

    #[must_use]
    pub fn with_job_tracker(mut self, jobs: JobTracker) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn args(&self) -> &ConnectionArgs {
        &self.args
    }

    /// Probe the controller on first use.
    pub async fn version(&self) -> Result<VersionInfo, CoreError> {
        self.version
            .get_or_try_init(|| version::probe(&self.rest, &self.zapi, self.args.use_rest))
            .await
            .copied()
    }
}

// ── Invocation ───────────────────────────────────────────────────────

/// Reconcile one object described by `params` (resource keys only).
pub async fn run<H: ResourceHandler>(
    session: &Session,
    mut params: Map<String, Value>,
    check_mode: bool,
) -> Result<Outcome, CoreError> {
    // Parameter errors surface before any I/O.
    let mut handler = H::new(params::parse(&H::ARGS, &params)?)?;

    let version = session.version().await?;
    let mut warnings = Vec::new();
    let mut stripped = false;
    for attr in H::ignorable(&version) {
        if params.remove(attr.name).is_some_and(|v| !v.is_null()) {
            warnings.push(attr.render());
            stripped = true;
        }
    }
    if stripped {
        handler = H::new(params::parse(&H::ARGS, &params)?)?;
    }

    let requested = params::requested(&params);
    let selection = protocol::select(
        H::KIND,
        session.args.use_rest,
        &version,
        H::SURFACES,
        H::capabilities(),
        &requested,
    )?;
    warnings.extend(selection.warnings);

    if !session.args.feature_flags.no_cserver_ems {
        info!(
            target: "ontap_core::telemetry",
            resource = H::KIND,
            protocol = %selection.protocol,
            version = %version.version,
            "invocation"
        );
    }

    let zapi = session.zapi.for_vserver(handler.vserver());
    let mut ctx = Context::new(
        session.rest.clone(),
        zapi,
        version,
        selection.protocol,
        session.jobs,
    );
    for message in warnings {
        ctx.warn(message);
    }

    let name = handler.name().to_owned();
    let current = fetch(&handler, &mut ctx, &name).await?;
    let mut source = None;
    if current.is_none() && handler.state() == State::Present {
        if let Some(from) = handler.from_name() {
            source = fetch(&handler, &mut ctx, from).await?;
            if source.is_none() {
                debug!(from, "rename source not found, creating instead");
            }
        }
    }

    let decision = planner::decide(current.is_some(), handler.state(), source.is_some());
    let observed = current.or(source);
    let desired = handler.desired(ctx.protocol);
    let diff = match (decision.cd_action, observed.as_ref()) {
        (CdAction::None, Some(cur)) if handler.state() == State::Present => {
            diff::diff(H::capabilities(), &cur.attrs, &desired, ctx.protocol)
        }
        _ => DiffOutcome::default(),
    };
    for message in &diff.warnings {
        ctx.warn(message.clone());
    }

    let stages = observed
        .as_ref()
        .map_or(DeleteStages::NONE, |c| handler.delete_stages(c, ctx.protocol));
    let mut plan: Plan<H::Extra> = planner::plan(&PlanInput {
        resource: H::KIND,
        name: &name,
        decision,
        from_name: handler.from_name(),
        diff: &diff,
        desired: &desired,
        caps: H::capabilities(),
        stages,
        recreate: handler.recreate_on_unmodifiable(),
        job_timeout: handler.job_timeout(),
    })?;
    if let Err(err) = handler.plan_extra(&mut ctx, observed.as_ref(), &desired, &mut plan).await {
        return Err(match err {
            HandlerError::Core(err) => err,
            HandlerError::Api(err) if err.is_auth() => CoreError::from(err),
            HandlerError::Api(err) => CoreError::Fetch {
                resource: H::KIND.to_owned(),
                name: name.clone(),
                failure: ApiFailure::from(&err),
            },
        });
    }
    debug!(resource = H::KIND, name = %name, steps = plan.len(), "plan ready");

    let modify = merged_modify(&plan, &diff);
    let mut outcome = Outcome {
        changed: !plan.is_empty(),
        resource: H::KIND.to_owned(),
        name: name.clone(),
        protocol: ctx.protocol,
        cd_action: decision.cd_action,
        rename: decision.rename,
        modify: None,
        current: observed.as_ref().map(|c| c.attrs.clone()),
        plan: None,
        warnings: Vec::new(),
        previous_errors: Vec::new(),
    };

    if check_mode {
        outcome.plan = Some(plan.describe(H::KIND, &name));
        outcome.modify = modify;
        outcome.warnings = ctx.take_warnings();
        return Ok(outcome);
    }

    let executed = execute_plan(&handler, &mut ctx, &plan, observed, &name).await?;
    outcome.changed = executed.changed;
    outcome.previous_errors = executed.previous_errors;

    if executed.changed && session.args.validate_changes != ValidateChanges::Ignore {
        verify(&handler, &mut ctx, &name, &desired, session.args.validate_changes).await?;
    }

    if session.args.feature_flags.show_modified {
        outcome.modify = modify;
    }
    outcome.warnings = ctx.take_warnings();
    info!(resource = H::KIND, name = %name, changed = outcome.changed, "invocation complete");
    Ok(outcome)
}

/// The diff's modifications plus every modify step's attributes.
fn merged_modify<X>(plan: &Plan<X>, diff: &DiffOutcome) -> Option<AttrMap> {
    if plan.is_empty() {
        return None;
    }
    let mut out = diff.modify.clone();
    for step in plan.steps() {
        if let Op::Modify(attrs) = &step.op {
            out.extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    (!out.is_empty()).then_some(out)
}

async fn fetch<H: ResourceHandler>(
    handler: &H,
    ctx: &mut Context,
    name: &str,
) -> Result<Option<Current>, CoreError> {
    match handler.get_current(ctx, name).await {
        Ok(current) => Ok(current),
        Err(HandlerError::Core(err)) => Err(err),
        Err(HandlerError::Api(err)) => {
            if handler.state() == State::Absent && missing_vserver(handler, &err) {
                info!(name, "vserver does not exist, object treated as absent");
                return Ok(None);
            }
            if err.is_auth() {
                return Err(CoreError::from(err));
            }
            Err(CoreError::Fetch {
                resource: H::KIND.to_owned(),
                name: name.to_owned(),
                failure: ApiFailure::from(&err),
            })
        }
    }
}

fn missing_vserver<H: ResourceHandler>(handler: &H, err: &ontap_api::Error) -> bool {
    handler.ignore_missing_vserver_on_delete()
        && handler
            .vserver()
            .is_some_and(|vserver| classify::vserver_missing(err, vserver))
}

// ── Execution ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Executed {
    changed: bool,
    previous_errors: Vec<String>,
}

async fn execute_plan<H: ResourceHandler>(
    handler: &H,
    ctx: &mut Context,
    plan: &Plan<H::Extra>,
    observed: Option<Current>,
    name: &str,
) -> Result<Executed, CoreError> {
    let mut done = Executed::default();
    let mut live = observed;
    let steps = plan.steps();

    for (index, step) in steps.iter().enumerate() {
        debug!(step = %step.describe(H::KIND, name), "executing");
        let outcome = match handler.execute(ctx, step, live.as_ref()).await {
            Ok(outcome) => outcome,
            Err(HandlerError::Core(err)) => return Err(err),
            Err(HandlerError::Api(err)) => {
                absorb(handler, step, err, name, &mut done)?;
                continue;
            }
        };
        done.changed |= outcome.changed;

        if let Some(job) = outcome.job {
            wait(handler, ctx, step, &job, name, &mut done).await?;
        }

        let more = index + 1 < steps.len();
        if more && matches!(step.op, Op::Create(_)) {
            live = fetch(handler, ctx, name).await?;
        }
    }
    Ok(done)
}

/// Tolerate or fail on a controller error raised by `step`.
fn absorb<H: ResourceHandler>(
    handler: &H,
    step: &Step<H::Extra>,
    err: ontap_api::Error,
    name: &str,
    done: &mut Executed,
) -> Result<(), CoreError> {
    let Some(class) = tolerated(handler, step, &err, name) else {
        return Err(op_error(&step.op, H::KIND, name, err));
    };
    info!(class = %class, error = %err, "error tolerated");
    if matches!(class, ErrorClass::Transient502 | ErrorClass::TransientTimeout60) {
        done.changed = true;
    }
    done.previous_errors.push(err.message());
    Ok(())
}

fn tolerated<H: ResourceHandler>(
    handler: &H,
    step: &Step<H::Extra>,
    err: &ontap_api::Error,
    name: &str,
) -> Option<ErrorClass> {
    step.tolerate.iter().copied().find(|class| match class {
        ErrorClass::VserverMissing => missing_vserver(handler, err),
        ErrorClass::AlreadyExists => classify::already_exists(err, name),
        other => classify::matches(err, *other),
    })
}

async fn wait<H: ResourceHandler>(
    handler: &H,
    ctx: &mut Context,
    step: &Step<H::Extra>,
    job: &JobRef,
    name: &str,
    done: &mut Executed,
) -> Result<(), CoreError> {
    let tracker = ctx.jobs;
    let result = tracker
        .wait_for_job(&ctx.rest, &ctx.zapi, job, step.job.timeout, step.job.not_found_ok)
        .await;
    match result {
        Ok(JobResult::Success(message)) => {
            debug!(job_id = job.id(), ?message, "job succeeded");
            Ok(())
        }
        Ok(JobResult::NotFoundTreatedAsSuccess) => Ok(()),
        Ok(JobResult::Failure(message)) => Err(CoreError::JobFailed {
            job_id: job.id().to_owned(),
            message,
        }),
        Ok(JobResult::Timeout { limit_secs }) if step.job.in_flight_ok => {
            ctx.warn(format!(
                "job {} still running after {limit_secs}s, assuming it completes",
                job.id()
            ));
            Ok(())
        }
        Ok(JobResult::Timeout { limit_secs }) => Err(CoreError::JobTimeout {
            job_id: job.id().to_owned(),
            timeout_secs: limit_secs,
        }),
        Err(err) => absorb(handler, step, err, name, done),
    }
}

/// Attach the failed operation to a controller error.
fn op_error<X>(op: &Op<X>, resource: &str, name: &str, err: ontap_api::Error) -> CoreError {
    if err.is_auth() {
        return CoreError::from(err);
    }
    let failure = ApiFailure::from(&err);
    let resource = resource.to_owned();
    let name = name.to_owned();
    match op {
        Op::Create(_) => CoreError::Create {
            resource,
            name,
            failure,
        },
        Op::Delete => CoreError::Delete {
            resource,
            name,
            failure,
        },
        Op::Rename { from } => CoreError::Rename {
            resource,
            from: from.clone(),
            name,
            failure,
        },
        Op::Modify(_) | Op::Unmount | Op::Offline | Op::Extra(_) => CoreError::Modify {
            resource,
            name,
            failure,
        },
    }
}

// ── Verification ─────────────────────────────────────────────────────

async fn verify<H: ResourceHandler>(
    handler: &H,
    ctx: &mut Context,
    name: &str,
    desired: &AttrMap,
    policy: ValidateChanges,
) -> Result<(), CoreError> {
    let after = fetch(handler, ctx, name).await?;
    let residual: Vec<String> = match (handler.state(), after) {
        (State::Absent, Some(_)) => vec![format!("{} {name} still exists", H::KIND)],
        (State::Absent, None) => Vec::new(),
        (State::Present, None) => vec![format!("{} {name} was not found", H::KIND)],
        (State::Present, Some(current)) => {
            let outcome = diff::diff(H::capabilities(), &current.attrs, desired, ctx.protocol);
            outcome
                .modify
                .keys()
                .chain(outcome.unmodifiable.iter())
                .cloned()
                .collect()
        }
    };
    if residual.is_empty() {
        return Ok(());
    }
    let message = residual.join(", ");
    match policy {
        ValidateChanges::Error => Err(CoreError::Verify { message }),
        ValidateChanges::Warn => {
            warn!(%message, "post-apply verification found differences");
            ctx.warn(format!("Error: post-apply verification found differences: {message}"));
            Ok(())
        }
        ValidateChanges::Ignore => Ok(()),
    }
}
