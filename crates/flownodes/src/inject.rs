use crate::de::{flex_bool, opt_f64, opt_text};
use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use flowcore::{Msg, Node, NodeContext, NodeDefinition, NodeError, PropPath, Property};
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

const DEFAULT_ONCE_DELAY_SECS: f64 = 0.1;
/// Longest accepted repeat interval or once delay, in seconds
const MAX_REPEAT_SECS: f64 = 2_147_483.0;

#[derive(Debug, Deserialize)]
struct InjectConfig {
    #[serde(default)]
    props: Option<Vec<PropConfig>>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(rename = "payloadType", default)]
    payload_type: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    topic: Option<String>,
    #[serde(default, deserialize_with = "flex_bool")]
    once: bool,
    #[serde(rename = "onceDelay", default, deserialize_with = "opt_f64")]
    once_delay: Option<f64>,
    #[serde(default, deserialize_with = "opt_f64")]
    repeat: Option<f64>,
    #[serde(default, deserialize_with = "opt_text")]
    crontab: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PropConfig {
    p: String,
    #[serde(default)]
    v: Option<serde_json::Value>,
    #[serde(default)]
    vt: Option<String>,
}

impl InjectConfig {
    /// Node-level payload with its type; a payload without a type is a
    /// timestamp when empty and a string otherwise.
    fn payload_property(&self) -> Result<Property, NodeError> {
        let raw = self.payload.clone().unwrap_or(serde_json::Value::String(String::new()));
        let ty = match self.payload_type.as_deref() {
            Some(ty) if !ty.is_empty() => ty,
            _ if raw.as_str().is_some_and(str::is_empty) => "date",
            _ => "str",
        };
        Property::compile(ty, &raw)
    }

    fn topic_property(&self) -> Result<Property, NodeError> {
        Property::compile("str", &serde_json::Value::String(self.topic.clone().unwrap_or_default()))
    }

    /// The message template: target path and value for every property
    fn properties(&self) -> Result<Vec<(PropPath, Property)>, NodeError> {
        let Some(props) = &self.props else {
            return Ok(vec![
                (PropPath::parse("payload")?, self.payload_property()?),
                (PropPath::parse("topic")?, self.topic_property()?),
            ]);
        };
        props
            .iter()
            .map(|prop| {
                let path = PropPath::parse(&prop.p)?;
                let property = match (&prop.v, prop.p.as_str()) {
                    (None, "payload") => self.payload_property()?,
                    (None, "topic") => self.topic_property()?,
                    (v, _) => Property::compile(
                        prop.vt.as_deref().unwrap_or("str"),
                        v.as_ref().unwrap_or(&serde_json::Value::String(String::new())),
                    )?,
                };
                Ok((path, property))
            })
            .collect()
    }
}

/// How and when the node fires on its own
#[derive(Debug)]
struct InjectPlan {
    properties: Vec<(PropPath, Property)>,
    once_delay: Option<Duration>,
    repeat: Option<Duration>,
    cron: Option<(String, Schedule)>,
}

impl InjectPlan {
    fn from_config(config: &InjectConfig) -> Result<Self, NodeError> {
        let properties = config.properties()?;

        let once_delay = if config.once {
            let secs = config.once_delay.unwrap_or(DEFAULT_ONCE_DELAY_SECS);
            if !secs.is_finite() || secs < 0.0 || secs > MAX_REPEAT_SECS {
                return Err(NodeError::config(format!("invalid onceDelay {secs}")));
            }
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        };

        let repeat = match config.repeat {
            None => None,
            Some(secs) if !secs.is_finite() || secs < 0.0 || secs > MAX_REPEAT_SECS => {
                return Err(NodeError::config(format!("invalid repeat interval {secs}")))
            }
            Some(secs) if secs == 0.0 => None,
            Some(secs) => Some(Duration::from_secs_f64(secs)),
        };

        let cron = match config.crontab.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(expr) => Some((expr.to_string(), parse_crontab(expr)?)),
        };

        Ok(Self {
            properties,
            once_delay,
            repeat,
            cron,
        })
    }

    /// Resolve every property into `msg`. A property that cannot be set is
    /// skipped and reported as a node warning.
    async fn fill(&self, ctx: &NodeContext, mut msg: Msg) -> Msg {
        let ectx = ctx.eval_context();
        for (path, property) in &self.properties {
            let value = property.evaluate(&ectx, Some(&msg)).await;
            if let Some(value) = value {
                if !msg.set_path(path, value) {
                    debug!(node = %ctx.id(), property = %path, "Could not set property");
                    ctx.events.warn(format!("cannot set msg.{path}"));
                }
            }
        }
        msg
    }
}

/// Five fields get a leading seconds field of `0`; six or seven are used
/// as written.
fn parse_crontab(expr: &str) -> Result<Schedule, NodeError> {
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_string(),
        n => return Err(NodeError::config(format!("crontab '{expr}' has {n} fields"))),
    };
    Schedule::from_str(&normalized).map_err(|e| NodeError::config(format!("invalid crontab '{expr}': {e}")))
}

/// Emits a message built from its properties once, on an interval, on a
/// cron schedule and whenever a message arrives.
pub struct InjectNode {
    plan: Arc<InjectPlan>,
}

impl InjectNode {
    pub fn from_definition(definition: &NodeDefinition) -> Result<Self, NodeError> {
        let config: InjectConfig = definition.config()?;
        Ok(Self {
            plan: Arc::new(InjectPlan::from_config(&config)?),
        })
    }
}

/// One timer-driven emission. Takes the node lock so it never overlaps
/// with message handling, and re-checks cancellation before sending.
async fn fire(ctx: &NodeContext, plan: &InjectPlan) {
    let _guard = tokio::select! {
        biased;
        _ = ctx.cancellation.cancelled() => return,
        guard = ctx.lock() => guard,
    };
    let msg = plan.fill(ctx, Msg::new()).await;
    if ctx.is_cancelled() {
        return;
    }
    ctx.send(0, msg);
}

async fn run_timers(ctx: NodeContext, plan: Arc<InjectPlan>) {
    if let Some(delay) = plan.once_delay {
        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return,
            _ = tokio::time::sleep(delay) => fire(&ctx, &plan).await,
        }
    }

    let Some(period) = plan.repeat else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return,
            _ = ticker.tick() => fire(&ctx, &plan).await,
        }
    }
}

async fn run_cron(ctx: NodeContext, plan: Arc<InjectPlan>) {
    let Some((expr, schedule)) = &plan.cron else {
        return;
    };
    let mut last = Utc::now();
    loop {
        let Some(next) = schedule.after(&last).next() else {
            info!(node = %ctx.id(), crontab = %expr, "Cron schedule has no upcoming occurrences");
            return;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return,
            _ = tokio::time::sleep(delay) => fire(&ctx, &plan).await,
        }
        last = next.max(Utc::now());
    }
}

#[async_trait]
impl Node for InjectNode {
    fn node_type(&self) -> &str {
        "inject"
    }

    async fn start(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        if let Some(delay) = self.plan.once_delay {
            ctx.events.info(format!("once after {}s", delay.as_secs_f64()));
        }
        if let Some(period) = self.plan.repeat {
            ctx.events.info(format!("every {}s", period.as_secs_f64()));
        }
        if self.plan.once_delay.is_some() || self.plan.repeat.is_some() {
            ctx.spawn(run_timers(ctx.clone(), self.plan.clone()));
        }
        if let Some((expr, _)) = &self.plan.cron {
            debug!(node = %ctx.id(), crontab = %expr, "Arming cron schedule");
            ctx.events.info(format!("crontab {expr}"));
            ctx.spawn(run_cron(ctx.clone(), self.plan.clone()));
        }
        Ok(())
    }

    /// An incoming message triggers one emission, built on top of it
    async fn receive(&self, ctx: &NodeContext, msg: Msg) -> Result<(), NodeError> {
        let msg = self.plan.fill(ctx, msg).await;
        ctx.send(0, msg);
        Ok(())
    }
}

pub struct InjectNodeFactory;

impl NodeFactory for InjectNodeFactory {
    fn create(&self, definition: &NodeDefinition) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(InjectNode::from_definition(definition)?))
    }

    fn node_type(&self) -> &str {
        "inject"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Emits a message once, on an interval or on a cron schedule".to_string(),
            category: "common".to_string(),
            inputs: 1,
            outputs: Some(1),
        }
    }
}
