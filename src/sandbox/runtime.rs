//! Child-side sandbox runtime.
//!
//! The `sandbox-exec` subcommand lands here: read one JSON document from
//! stdin, evaluate the inlined bundle with a locked-down Rhai engine,
//! dispatch to the handler matching the event type, and print the response
//! JSON to stdout. The engine has no filesystem, environment, or process
//! access; `http_get` exists only when the route's `net` allow-list is
//! non-empty.

use std::io::Read;

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::{Value, json};

use crate::protocol::{ServiceManifest, ShimInput};
use crate::snapshot::bundle;

/// Operation budget per invocation. The host's wall-clock timeout is the
/// hard limit; this bounds busy loops that never yield.
const MAX_OPERATIONS: u64 = 10_000_000;
const MAX_CALL_LEVELS: usize = 64;
const MAX_STRING_SIZE: usize = 1 << 20;
const MAX_ARRAY_SIZE: usize = 16_384;
const MAX_MAP_SIZE: usize = 16_384;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FUNCTION_EXPR_DEPTH: usize = 32;

const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(thiserror::Error, Debug)]
pub enum ShimError {
    #[error("bundle: {0}")]
    Bundle(#[from] bundle::BundleError),

    #[error("compile: {0}")]
    Compile(String),

    #[error("eval: {0}")]
    Eval(String),

    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Build the restricted engine for one invocation.
pub fn build_engine(net: &[String]) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(MAX_CALL_LEVELS);
    engine.set_max_string_size(MAX_STRING_SIZE);
    engine.set_max_array_size(MAX_ARRAY_SIZE);
    engine.set_max_map_size(MAX_MAP_SIZE);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FUNCTION_EXPR_DEPTH);

    if !net.is_empty() {
        let allowed: Vec<String> = net.to_vec();
        engine.register_fn(
            "http_get",
            move |url: &str| -> Result<String, Box<EvalAltResult>> {
                http_get_allowlisted(url, &allowed).map_err(|e| e.to_string().into())
            },
        );
    }

    engine
}

/// Suffix-match a host against the allow-list. A bare `example.com` grants
/// the domain and its subdomains; `*.example.com` is accepted as an alias.
pub fn host_allowed(host: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        let domain = pattern.strip_prefix("*.").unwrap_or(pattern);
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}

fn http_get_allowlisted(url: &str, allowed: &[String]) -> Result<String, String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid url: {e}"))?;
    let host = parsed.host_str().ok_or_else(|| "url has no host".to_string())?;
    if !host_allowed(host, allowed) {
        return Err(format!("host '{host}' is not in the net allow-list"));
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| e.to_string())?;
    let body = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| e.to_string())?;
    Ok(body)
}

/// Compile a bundle text and read its `manifest()` declaration.
/// Used by the snapshot builder; no network is granted.
pub fn extract_manifest(bundle_text: &str) -> Result<ServiceManifest, ShimError> {
    let engine = build_engine(&[]);
    let ast = engine
        .compile(bundle_text)
        .map_err(|e| ShimError::Compile(e.to_string()))?;

    let mut scope = Scope::new();
    let result = engine
        .call_fn::<Dynamic>(&mut scope, &ast, "manifest", ())
        .map_err(|e| match *e {
            EvalAltResult::ErrorFunctionNotFound(ref name, _) if name.starts_with("manifest") => {
                ShimError::Eval("service declares no manifest()".into())
            }
            _ => ShimError::Eval(e.to_string()),
        })?;

    rhai::serde::from_dynamic(&result).map_err(|e| ShimError::Eval(e.to_string()))
}

/// Evaluate the bundle and dispatch the payload's event to its handler.
/// A service without a handler for this event type answers `none`.
pub fn execute(input: &ShimInput) -> Result<Value, ShimError> {
    let source = bundle::decode_data_url(&input.data_url)?;
    let engine = build_engine(&input.net);
    let ast = engine
        .compile(&source)
        .map_err(|e| ShimError::Compile(e.to_string()))?;

    let handler = input.payload.event.handler_name();
    let event = to_dynamic(serde_json::to_value(&input.payload.event)?)?;
    let ctx = to_dynamic(serde_json::to_value(&input.payload.ctx)?)?;

    let mut scope = Scope::new();
    match engine.call_fn::<Dynamic>(&mut scope, &ast, handler, (event, ctx)) {
        Ok(result) => {
            rhai::serde::from_dynamic(&result).map_err(|e| ShimError::Eval(e.to_string()))
        }
        Err(e) => match *e {
            EvalAltResult::ErrorFunctionNotFound(ref name, _) if name.starts_with(handler) => {
                Ok(json!({ "kind": "none" }))
            }
            _ => Err(ShimError::Eval(e.to_string())),
        },
    }
}

fn to_dynamic(value: Value) -> Result<Dynamic, ShimError> {
    rhai::serde::to_dynamic(value).map_err(|e| ShimError::Eval(e.to_string()))
}

/// Entry point for the `sandbox-exec` subcommand. Returns the process exit
/// code; the response JSON is the only thing written to stdout.
pub fn run_child() -> i32 {
    let mut input_text = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input_text) {
        eprintln!("failed to read payload: {e}");
        return 1;
    }

    let input: ShimInput = match serde_json::from_str(&input_text) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("invalid payload: {e}");
            return 1;
        }
    };

    match execute(&input) {
        Ok(value) => {
            println!("{value}");
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PayloadCtx, PayloadManifest, SDK_SCHEMA_VERSION, SandboxPayload, ServiceEvent};
    use serde_json::json;

    const HELLO: &str = r#"
        fn manifest() {
            #{ id: "hello", version: "1.0.0", kind: "single_command", command: "hello" }
        }
        fn handle_command(event, ctx) {
            reply("Hello from sandbox!")
        }
    "#;

    fn shim_input(source: &str, event: ServiceEvent) -> ShimInput {
        let (_, text) = bundle::bundle_source(source);
        ShimInput {
            data_url: bundle::encode_data_url(&text),
            payload: SandboxPayload {
                event,
                ctx: PayloadCtx {
                    chat_id: "1".into(),
                    user_id: "2".into(),
                    service_config: None,
                    route_meta: None,
                    datasets: None,
                },
                manifest: PayloadManifest { schema_version: SDK_SCHEMA_VERSION },
            },
            net: vec![],
        }
    }

    fn command_event(token: &str) -> ServiceEvent {
        ServiceEvent::Command { token: token.into(), state: None, state_version: None }
    }

    #[test]
    fn manifest_extraction() {
        let (_, text) = bundle::bundle_source(HELLO);
        let manifest = extract_manifest(&text).unwrap();
        assert_eq!(manifest.id, "hello");
        assert_eq!(manifest.command.as_deref(), Some("hello"));
        assert_eq!(manifest.schema_version, SDK_SCHEMA_VERSION);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let (_, text) = bundle::bundle_source("fn handle_command(event, ctx) { reply(\"x\") }");
        let err = extract_manifest(&text).unwrap_err();
        assert!(err.to_string().contains("manifest"));
    }

    #[test]
    fn compile_error_is_reported() {
        let (_, text) = bundle::bundle_source("fn manifest( {");
        assert!(matches!(extract_manifest(&text), Err(ShimError::Compile(_))));
    }

    #[test]
    fn executes_command_handler() {
        let input = shim_input(HELLO, command_event("hello"));
        let value = execute(&input).unwrap();
        assert_eq!(value["kind"], "reply");
        assert_eq!(value["text"], "Hello from sandbox!");
    }

    #[test]
    fn missing_handler_answers_none() {
        let input = shim_input(
            HELLO,
            ServiceEvent::Message { message: json!({"text": "hi"}), state: None, state_version: None },
        );
        let value = execute(&input).unwrap();
        assert_eq!(value["kind"], "none");
    }

    #[test]
    fn handler_sees_event_state_and_ctx() {
        let source = r#"
            fn manifest() {
                #{ id: "echo", version: "1.0.0", kind: "command_flow", command: "echo" }
            }
            fn handle_command(event, ctx) {
                with_state(
                    reply(`v=${event.stateVersion} chat=${ctx.chatId}`),
                    state_merge(#{ count: event.state.count + 1 })
                )
            }
        "#;
        let mut event = command_event("echo");
        let mut state = crate::protocol::JsonMap::new();
        state.insert("count".into(), json!(2));
        event.set_state(Some(state), Some(7));

        let value = execute(&shim_input(source, event)).unwrap();
        assert_eq!(value["text"], "v=7 chat=1");
        assert_eq!(value["state"]["op"], "merge");
        assert_eq!(value["state"]["value"]["count"], 3);
    }

    #[test]
    fn script_runtime_error_is_eval_error() {
        let source = r#"
            fn manifest() { #{ id: "boom", version: "1.0.0", kind: "single_command", command: "boom" } }
            fn handle_command(event, ctx) { this_function_does_not_exist() }
        "#;
        let err = execute(&shim_input(source, command_event("boom"))).unwrap_err();
        assert!(matches!(err, ShimError::Eval(_)));
    }

    #[test]
    fn http_get_is_absent_without_net_grant() {
        let source = r#"
            fn manifest() { #{ id: "net", version: "1.0.0", kind: "single_command", command: "net" } }
            fn handle_command(event, ctx) { reply(http_get("https://example.com/")) }
        "#;
        let err = execute(&shim_input(source, command_event("net"))).unwrap_err();
        assert!(err.to_string().contains("http_get"));
    }

    #[test]
    fn host_allowlist_matching() {
        let patterns = vec!["example.com".to_string(), "*.internal.net".to_string()];
        assert!(host_allowed("example.com", &patterns));
        assert!(host_allowed("api.example.com", &patterns));
        assert!(host_allowed("deep.internal.net", &patterns));
        assert!(!host_allowed("internal.net.evil.com", &patterns));
        assert!(!host_allowed("notexample.com", &patterns));
        assert!(!host_allowed("example.org", &patterns));
    }

    #[test]
    fn run_child_shape_via_execute_roundtrip() {
        // `run_child` is stdin/stdout plumbing over `execute`; exercise the
        // serialized form it consumes.
        let input = shim_input(HELLO, command_event("hello"));
        let as_text = serde_json::to_string(&input).unwrap();
        let parsed: ShimInput = serde_json::from_str(&as_text).unwrap();
        let value = execute(&parsed).unwrap();
        assert_eq!(value["kind"], "reply");
    }
}
