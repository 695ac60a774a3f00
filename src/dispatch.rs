//! Event dispatcher: resolves an inbound chat event against the chat's
//! routing snapshot, runs the matched service(s) in the sandbox, applies
//! the returned state directive, and hands one response back to the caller.
//!
//! Per-(chat,user) serialization is the platform adapter's contract; the
//! dispatcher itself is safe to call concurrently across chats.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::{
    PayloadCtx, PayloadManifest, SDK_SCHEMA_VERSION, SandboxPayload, ServiceEvent, ServiceKind,
    ServiceResponse, StateDirective,
};
use crate::sandbox::{RunSpec, SandboxError, SandboxRunner};
use crate::snapshot::builder::SnapshotBuilder;
use crate::snapshot::{Route, RoutingSnapshot};
use crate::state::{FlowStateStore, StateKey};
use crate::store::Store;

// ── Inbound events (adapter → dispatcher) ───────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCtx {
    pub chat_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundEvent {
    Command { command: String, ctx: EventCtx },
    Callback { data: String, ctx: EventCtx },
    Message { message: Value, ctx: EventCtx },
}

impl InboundEvent {
    pub fn ctx(&self) -> &EventCtx {
        match self {
            InboundEvent::Command { ctx, .. }
            | InboundEvent::Callback { ctx, .. }
            | InboundEvent::Message { ctx, .. } => ctx,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            InboundEvent::Command { .. } => "command",
            InboundEvent::Callback { .. } => "callback",
            InboundEvent::Message { .. } => "message",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub response: Option<ServiceResponse>,
}

/// Observability record broadcast after each dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEvent {
    pub chat_id: String,
    pub user_id: String,
    pub event_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Strip the leading `/`, drop any `@bot` suffix, lowercase.
pub fn normalize_command(raw: &str) -> String {
    let token = raw.trim();
    let token = token.strip_prefix('/').unwrap_or(token);
    let token = token.split('@').next().unwrap_or(token);
    token.to_lowercase()
}

/// Callback data rides as `svc:<serviceId>|<service payload>`.
pub fn parse_callback_data(data: &str) -> Option<(&str, &str)> {
    data.strip_prefix("svc:")?.split_once('|')
}

fn route_timeout(route: &Route) -> Option<Duration> {
    route
        .config
        .as_ref()
        .and_then(|c| c.get("timeoutMs"))
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
}

// ── Dispatcher ──────────────────────────────────────────────────────

pub struct Dispatcher {
    store: Arc<Store>,
    builder: Arc<SnapshotBuilder>,
    state: Arc<FlowStateStore>,
    runner: Arc<dyn SandboxRunner>,
    default_timeout: Duration,
    flow_ttl_ms: i64,
    events_tx: Option<broadcast::Sender<DispatchEvent>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        builder: Arc<SnapshotBuilder>,
        state: Arc<FlowStateStore>,
        runner: Arc<dyn SandboxRunner>,
        default_timeout: Duration,
        flow_ttl_ms: i64,
    ) -> Self {
        Self {
            store,
            builder,
            state,
            runner,
            default_timeout,
            flow_ttl_ms,
            events_tx: None,
        }
    }

    pub fn with_events(mut self, events_tx: broadcast::Sender<DispatchEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    pub async fn dispatch(&self, event: InboundEvent) -> DispatchOutcome {
        let ctx = event.ctx().clone();

        let snapshot = match self.snapshot_for(&ctx.chat_id).await {
            Ok(snapshot) => snapshot,
            Err(response) => {
                self.emit(&ctx, event.kind_name(), None, "error");
                return DispatchOutcome { response: Some(response) };
            }
        };

        let (service_id, outcome) = match &event {
            InboundEvent::Command { command, .. } => {
                self.dispatch_command(&snapshot, command, &ctx).await
            }
            InboundEvent::Callback { data, .. } => {
                self.dispatch_callback(&snapshot, data, &ctx).await
            }
            InboundEvent::Message { message, .. } => {
                self.dispatch_message(&snapshot, message, &ctx).await
            }
        };

        let label = match &outcome {
            Some(resp) => resp.body.kind_name(),
            None => "null",
        };
        self.emit(&ctx, event.kind_name(), service_id, label);

        DispatchOutcome { response: outcome }
    }

    /// Build (or fetch) the chat's snapshot. On build failure the previous
    /// snapshot for the current configuration stays active; with nothing to
    /// fall back to, the caller gets one short error response.
    async fn snapshot_for(&self, chat_id: &str) -> Result<RoutingSnapshot, ServiceResponse> {
        match self.builder.build_snapshot(chat_id, false).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::error!(chat_id, error = %e, "snapshot build failed");
                if let Ok(Some(record)) = self.store.get_chat_config(chat_id) {
                    if let Ok(Some(json)) = self.store.load_snapshot(&record.config_hash) {
                        if let Ok(snapshot) = serde_json::from_str::<RoutingSnapshot>(&json) {
                            tracing::warn!(chat_id, "serving previously built snapshot");
                            return Ok(snapshot);
                        }
                    }
                }
                Err(ServiceResponse::error("configuration error"))
            }
        }
    }

    async fn dispatch_command(
        &self,
        snapshot: &RoutingSnapshot,
        command: &str,
        ctx: &EventCtx,
    ) -> (Option<String>, Option<ServiceResponse>) {
        let token = normalize_command(command);
        let Some(route) = snapshot.commands.get(&token) else {
            tracing::debug!(chat_id = %ctx.chat_id, token = %token, "no route for command");
            return (None, None);
        };

        let event = ServiceEvent::Command { token, state: None, state_version: None };
        let response = self.run_route(route, event, ctx, true).await;
        (Some(route.service_id.clone()), Some(response))
    }

    async fn dispatch_callback(
        &self,
        snapshot: &RoutingSnapshot,
        data: &str,
        ctx: &EventCtx,
    ) -> (Option<String>, Option<ServiceResponse>) {
        let Some((service_id, payload)) = parse_callback_data(data) else {
            tracing::debug!(chat_id = %ctx.chat_id, "callback data has no service prefix");
            return (None, None);
        };
        let Some(route) = snapshot.route_for_service(service_id) else {
            tracing::debug!(chat_id = %ctx.chat_id, service_id, "no route owns callback");
            return (None, None);
        };

        let event = ServiceEvent::Callback {
            data: payload.to_string(),
            state: None,
            state_version: None,
        };
        let response = self.run_route(route, event, ctx, false).await;
        (Some(route.service_id.clone()), Some(response))
    }

    /// Active-flow service first, then listeners in declaration order. All
    /// candidates run; the first non-`none` response wins.
    async fn dispatch_message(
        &self,
        snapshot: &RoutingSnapshot,
        message: &Value,
        ctx: &EventCtx,
    ) -> (Option<String>, Option<ServiceResponse>) {
        let active = self.state.get_active_flow(&ctx.chat_id, &ctx.user_id);

        let mut candidates: Vec<&Route> = Vec::new();
        if let Some(flow) = &active {
            if let Some(route) = snapshot.route_for_service(&flow.service_id) {
                candidates.push(route);
            }
        }
        for listener in &snapshot.listeners {
            let owns_flow = active
                .as_ref()
                .is_some_and(|f| f.service_id == listener.service_id);
            if !owns_flow {
                candidates.push(listener);
            }
        }

        let mut winner: Option<(String, ServiceResponse)> = None;
        for route in candidates {
            let event = ServiceEvent::Message {
                message: message.clone(),
                state: None,
                state_version: None,
            };
            let response = self.run_route(route, event, ctx, false).await;
            if winner.is_none() && !response.is_none() {
                winner = Some((route.service_id.clone(), response));
            }
        }

        match winner {
            Some((service_id, response)) => (Some(service_id), Some(response)),
            None => (None, None),
        }
    }

    async fn run_route(
        &self,
        route: &Route,
        mut event: ServiceEvent,
        ctx: &EventCtx,
        is_command: bool,
    ) -> ServiceResponse {
        let bundle = match self.store.get_service_bundle(&route.bundle_hash) {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                tracing::warn!(
                    service_id = %route.service_id,
                    bundle_hash = %route.bundle_hash,
                    "bundle missing, requesting background rebuild"
                );
                self.request_rebuild(&ctx.chat_id);
                return ServiceResponse::error("service temporarily unavailable");
            }
            Err(e) => {
                tracing::error!(service_id = %route.service_id, error = %e, "bundle lookup failed");
                return ServiceResponse::error("storage error");
            }
        };

        let key = StateKey::new(&ctx.chat_id, &ctx.user_id, &route.service_id);
        if let Some(state) = self.state.get_service_state(&key) {
            event.set_state(Some(state.value), Some(state.version));
        }

        let payload = SandboxPayload {
            event,
            ctx: PayloadCtx {
                chat_id: ctx.chat_id.clone(),
                user_id: ctx.user_id.clone(),
                service_config: route.config.clone(),
                route_meta: serde_json::to_value(&route.meta).ok(),
                datasets: route.datasets.clone(),
            },
            manifest: PayloadManifest { schema_version: SDK_SCHEMA_VERSION },
        };

        let spec = RunSpec {
            data_url: bundle.data_url,
            payload,
            net: route.net.clone(),
            timeout: route_timeout(route).unwrap_or(self.default_timeout),
        };

        let value = match self.runner.run(spec).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    service_id = %route.service_id,
                    chat_id = %ctx.chat_id,
                    error = %e,
                    "sandbox invocation failed"
                );
                let message = match e {
                    SandboxError::Timeout => "timeout",
                    SandboxError::BadResponse(_) => "bad_response",
                    _ => "service failed",
                };
                return ServiceResponse::error(message);
            }
        };

        let response: ServiceResponse = match serde_json::from_value(value) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(service_id = %route.service_id, error = %e, "response failed schema check");
                return ServiceResponse::error("bad_response");
            }
        };

        if let Some(directive) = &response.state {
            self.state.apply_state_directive(&key, directive);
        }
        match &response.state {
            Some(StateDirective::Clear) => self.clear_flow_if_owned(ctx, &route.service_id),
            Some(_) if is_command && route.kind == ServiceKind::CommandFlow => {
                self.state.set_active_flow(
                    &ctx.chat_id,
                    &ctx.user_id,
                    &route.service_id,
                    Some(self.flow_ttl_ms),
                );
            }
            _ => {}
        }
        if response.delete_trigger {
            self.clear_flow_if_owned(ctx, &route.service_id);
        }

        response
    }

    fn clear_flow_if_owned(&self, ctx: &EventCtx, service_id: &str) {
        let owned = self
            .state
            .get_active_flow(&ctx.chat_id, &ctx.user_id)
            .is_some_and(|f| f.service_id == service_id);
        if owned {
            self.state.clear_active_flow(&ctx.chat_id, &ctx.user_id);
        }
    }

    fn request_rebuild(&self, chat_id: &str) {
        let builder = self.builder.clone();
        let chat_id = chat_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = builder.build_snapshot(&chat_id, true).await {
                tracing::error!(chat_id = %chat_id, error = %e, "background rebuild failed");
            }
        });
    }

    fn emit(&self, ctx: &EventCtx, event_kind: &str, service_id: Option<String>, outcome: &str) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(DispatchEvent {
                chat_id: ctx.chat_id.clone(),
                user_id: ctx.user_id.clone(),
                event_kind: event_kind.to_string(),
                service_id,
                outcome: outcome.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ResponseBody, ShimInput};
    use crate::sandbox::runtime;
    use crate::snapshot::builder::canonical_config;
    use async_trait::async_trait;
    use serde_json::json;

    const HELLO: &str = r#"
        fn manifest() {
            #{ id: "hello", version: "1.0.0", kind: "single_command", command: "hello" }
        }
        fn handle_command(event, ctx) { reply("Hello from sandbox!") }
    "#;

    const FLOW: &str = r#"
        fn manifest() {
            #{ id: "flow", version: "1.0.0", kind: "command_flow", command: "flow" }
        }

        fn handle_command(event, ctx) {
            with_state(reply("Flow started. Send a message."), state_replace(#{ step: 1 }))
        }

        fn handle_message(event, ctx) {
            let state = event.state;
            if state.step == 1 {
                with_state(
                    reply("Got first message. Send another to finish."),
                    state_merge(#{ step: 2, first: event.message.text })
                )
            } else {
                with_state(
                    reply(`Done! First="${state.first}" Second="${event.message.text}"`),
                    state_clear()
                )
            }
        }
    "#;

    const KEYBOARD: &str = r#"
        fn manifest() {
            #{ id: "keyboard", version: "1.0.0", kind: "single_command", command: "keyboard" }
        }

        fn handle_command(event, ctx) {
            reply_with("Pick one:", #{ reply_markup: #{ inline_keyboard: [[
                #{ text: "First", callback_data: "svc:keyboard|btn:one" },
                #{ text: "Second", callback_data: "svc:keyboard|btn:two" },
            ]] } })
        }

        fn handle_callback(event, ctx) {
            let label = if event.data == "btn:one" { "First" } else { "Second" };
            edit_with(`You picked: ${label}`, #{ reply_markup: #{ inline_keyboard: [] } })
        }
    "#;

    const LISTENER: &str = r#"
        fn manifest() {
            #{ id: "echo_listener", version: "1.0.0", kind: "listener" }
        }
        fn handle_message(event, ctx) { reply(`heard: ${event.message.text}`) }
    "#;

    /// Runs the bundle in-process with the real Rhai shim, skipping the
    /// child process. Process isolation itself is covered by the host tests.
    struct InProcessRunner;

    #[async_trait]
    impl SandboxRunner for InProcessRunner {
        async fn run(&self, spec: RunSpec) -> Result<Value, SandboxError> {
            let input = ShimInput {
                data_url: spec.data_url,
                payload: spec.payload,
                net: spec.net,
            };
            runtime::execute(&input).map_err(|e| SandboxError::Crash(e.to_string()))
        }
    }

    struct TimeoutRunner;

    #[async_trait]
    impl SandboxRunner for TimeoutRunner {
        async fn run(&self, _spec: RunSpec) -> Result<Value, SandboxError> {
            Err(SandboxError::Timeout)
        }
    }

    struct Fixture {
        store: Arc<Store>,
        state: Arc<FlowStateStore>,
        builder: Arc<SnapshotBuilder>,
        dispatcher: Dispatcher,
        _dir: tempfile::TempDir,
    }

    fn fixture_with_runner(
        sources: &[(&str, &str)],
        services: serde_json::Value,
        runner: Arc<dyn SandboxRunner>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in sources {
            std::fs::write(dir.path().join(name), body).unwrap();
        }

        let store = Arc::new(Store::open(crate::store::MEMORY_DB).unwrap());
        let doc = json!({ "configId": "cfg-1", "services": services });
        let (config_json, config_hash) = canonical_config(&doc).unwrap();
        store.set_chat_config("1", "cfg-1", &config_json, &config_hash).unwrap();

        let builder = Arc::new(SnapshotBuilder::new(store.clone(), dir.path().to_path_buf()));
        let state = Arc::new(FlowStateStore::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            builder.clone(),
            state.clone(),
            runner,
            Duration::from_millis(2000),
            600_000,
        );
        Fixture { store, state, builder, dispatcher, _dir: dir }
    }

    fn fixture(sources: &[(&str, &str)], services: serde_json::Value) -> Fixture {
        fixture_with_runner(sources, services, Arc::new(InProcessRunner))
    }

    fn ctx() -> EventCtx {
        EventCtx { chat_id: "1".into(), user_id: "2".into() }
    }

    fn command(token: &str) -> InboundEvent {
        InboundEvent::Command { command: token.into(), ctx: ctx() }
    }

    fn message(text: &str) -> InboundEvent {
        InboundEvent::Message { message: json!({ "text": text }), ctx: ctx() }
    }

    fn reply_text(outcome: &DispatchOutcome) -> String {
        match &outcome.response.as_ref().unwrap().body {
            ResponseBody::Reply { text } => text.clone(),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_command_replies_from_sandbox() {
        let fx = fixture(
            &[("hello.rhai", HELLO)],
            json!([{ "serviceId": "hello", "kind": "single_command", "entry": "hello.rhai" }]),
        );
        let outcome = fx.dispatcher.dispatch(command("hello")).await;
        assert_eq!(reply_text(&outcome), "Hello from sandbox!");
    }

    #[tokio::test]
    async fn command_normalization_strips_slash_and_bot_suffix() {
        let fx = fixture(
            &[("hello.rhai", HELLO)],
            json!([{ "serviceId": "hello", "kind": "single_command", "entry": "hello.rhai" }]),
        );
        let outcome = fx.dispatcher.dispatch(command("/Hello@SwitchboardBot")).await;
        assert_eq!(reply_text(&outcome), "Hello from sandbox!");
    }

    #[tokio::test]
    async fn unknown_command_routes_null_and_leaves_state_alone() {
        let fx = fixture(
            &[("hello.rhai", HELLO)],
            json!([{ "serviceId": "hello", "kind": "single_command", "entry": "hello.rhai" }]),
        );
        let outcome = fx.dispatcher.dispatch(command("start")).await;
        assert!(outcome.response.is_none());

        let (states, flows) = fx.state.dump();
        assert!(states.is_empty());
        assert!(flows.is_empty());
    }

    #[tokio::test]
    async fn two_step_flow_tracks_state_and_session() {
        let fx = fixture(
            &[("flow.rhai", FLOW)],
            json!([{ "serviceId": "flow", "kind": "command_flow", "entry": "flow.rhai" }]),
        );

        // Step A: the command opens the flow.
        let a = fx.dispatcher.dispatch(command("flow")).await;
        assert_eq!(reply_text(&a), "Flow started. Send a message.");
        let flow = fx.state.get_active_flow("1", "2").unwrap();
        assert_eq!(flow.service_id, "flow");
        let key = StateKey::new("1", "2", "flow");
        let state = fx.state.get_service_state(&key).unwrap();
        assert_eq!(state.value["step"], json!(1));

        // Step B: free text goes to the active flow.
        let b = fx.dispatcher.dispatch(message("one")).await;
        assert_eq!(reply_text(&b), "Got first message. Send another to finish.");
        let state = fx.state.get_service_state(&key).unwrap();
        assert_eq!(state.value["step"], json!(2));
        assert_eq!(state.value["first"], json!("one"));
        assert!(state.version >= 2);

        // Step C: the flow finishes and cleans up after itself.
        let c = fx.dispatcher.dispatch(message("two")).await;
        assert_eq!(reply_text(&c), "Done! First=\"one\" Second=\"two\"");
        assert!(fx.state.get_service_state(&key).is_none());
        assert!(fx.state.get_active_flow("1", "2").is_none());
    }

    #[tokio::test]
    async fn callback_routes_by_service_prefix_and_edits() {
        let fx = fixture(
            &[("keyboard.rhai", KEYBOARD)],
            json!([{ "serviceId": "keyboard", "kind": "single_command", "entry": "keyboard.rhai" }]),
        );

        let outcome = fx
            .dispatcher
            .dispatch(InboundEvent::Callback { data: "svc:keyboard|btn:one".into(), ctx: ctx() })
            .await;
        let response = outcome.response.unwrap();
        match &response.body {
            ResponseBody::Edit { text } => assert_eq!(text, "You picked: First"),
            other => panic!("expected edit, got {other:?}"),
        }
        let options = response.options.unwrap();
        assert!(options["reply_markup"]["inline_keyboard"].is_array());
    }

    #[tokio::test]
    async fn callback_for_unknown_service_routes_null() {
        let fx = fixture(
            &[("hello.rhai", HELLO)],
            json!([{ "serviceId": "hello", "kind": "single_command", "entry": "hello.rhai" }]),
        );
        let outcome = fx
            .dispatcher
            .dispatch(InboundEvent::Callback { data: "svc:ghost|x".into(), ctx: ctx() })
            .await;
        assert!(outcome.response.is_none());
    }

    #[tokio::test]
    async fn listener_hears_messages_in_declaration_order() {
        let fx = fixture(
            &[("listener.rhai", LISTENER)],
            json!([{ "serviceId": "echo_listener", "kind": "listener", "entry": "listener.rhai" }]),
        );
        let outcome = fx.dispatcher.dispatch(message("ping")).await;
        assert_eq!(reply_text(&outcome), "heard: ping");
    }

    #[tokio::test]
    async fn active_flow_wins_over_listeners() {
        let fx = fixture(
            &[("flow.rhai", FLOW), ("listener.rhai", LISTENER)],
            json!([
                { "serviceId": "flow", "kind": "command_flow", "entry": "flow.rhai" },
                { "serviceId": "echo_listener", "kind": "listener", "entry": "listener.rhai" },
            ]),
        );

        fx.dispatcher.dispatch(command("flow")).await;
        let outcome = fx.dispatcher.dispatch(message("one")).await;
        // The flow's reply wins; the listener's is collected and dropped.
        assert_eq!(reply_text(&outcome), "Got first message. Send another to finish.");
    }

    #[tokio::test]
    async fn message_without_routes_is_null() {
        let fx = fixture(
            &[("hello.rhai", HELLO)],
            json!([{ "serviceId": "hello", "kind": "single_command", "entry": "hello.rhai" }]),
        );
        let outcome = fx.dispatcher.dispatch(message("anyone there?")).await;
        assert!(outcome.response.is_none());
    }

    #[tokio::test]
    async fn sandbox_timeout_yields_error_and_preserves_state() {
        let fx = fixture_with_runner(
            &[("flow.rhai", FLOW)],
            json!([{ "serviceId": "flow", "kind": "command_flow", "entry": "flow.rhai" }]),
            Arc::new(TimeoutRunner),
        );

        let key = StateKey::new("1", "2", "flow");
        fx.state.set_service_state(
            &key,
            [("step".to_string(), json!(1))].into_iter().collect(),
            None,
        );

        let outcome = fx.dispatcher.dispatch(command("flow")).await;
        match &outcome.response.unwrap().body {
            ResponseBody::Error { message } => assert_eq!(message, "timeout"),
            other => panic!("expected error, got {other:?}"),
        }

        // Flow state is untouched by the failed invocation.
        let state = fx.state.get_service_state(&key).unwrap();
        assert_eq!(state.value["step"], json!(1));
    }

    #[tokio::test]
    async fn missing_bundle_errors_and_triggers_rebuild() {
        let fx = fixture(
            &[("hello.rhai", HELLO)],
            json!([{ "serviceId": "hello", "kind": "single_command", "entry": "hello.rhai" }]),
        );

        // Prime the snapshot, then pull its bundles out from under it.
        let snapshot = fx.builder.build_snapshot("1", false).await.unwrap();
        let hashes: Vec<String> = snapshot.bundle_hashes().into_iter().collect();
        fx.store.delete_bundles(&hashes).unwrap();

        let outcome = fx.dispatcher.dispatch(command("hello")).await;
        match &outcome.response.unwrap().body {
            ResponseBody::Error { message } => {
                assert!(message.contains("unavailable"), "got: {message}")
            }
            other => panic!("expected error, got {other:?}"),
        }

        // The background rebuild restores the bundle.
        let mut restored = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if fx.store.get_service_bundle(&hashes[0]).unwrap().is_some() {
                restored = true;
                break;
            }
        }
        assert!(restored, "background rebuild never restored the bundle");
    }

    #[tokio::test]
    async fn chat_without_config_routes_null() {
        let fx = fixture(
            &[("hello.rhai", HELLO)],
            json!([{ "serviceId": "hello", "kind": "single_command", "entry": "hello.rhai" }]),
        );
        let outcome = fx
            .dispatcher
            .dispatch(InboundEvent::Command {
                command: "hello".into(),
                ctx: EventCtx { chat_id: "other-chat".into(), user_id: "9".into() },
            })
            .await;
        assert!(outcome.response.is_none());
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_command("/hello"), "hello");
        assert_eq!(normalize_command("/HELLO@MyBot"), "hello");
        assert_eq!(normalize_command("hello"), "hello");
        assert_eq!(normalize_command("  /hello  "), "hello");
    }

    #[test]
    fn callback_prefix_parsing() {
        assert_eq!(parse_callback_data("svc:kb|btn:one"), Some(("kb", "btn:one")));
        assert_eq!(parse_callback_data("svc:kb|a|b"), Some(("kb", "a|b")));
        assert_eq!(parse_callback_data("kb|x"), None);
        assert_eq!(parse_callback_data("svc:no-pipe"), None);
    }
}
