// crates/flownodes/tests/flows_test.rs

use flowcore::{
    ContextKey, ContextScope, ElementId, ExecutionEvent, FlowError, GraphError, Msg, NodeEvent, StoreKind, Value,
};
use flownodes::builtin_registry;
use flowruntime::{EngineState, FlowEngine, RuntimeConfig};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn engine_with(flows: serde_json::Value, config: RuntimeConfig) -> FlowEngine {
    init_tracing();
    let registry = builtin_registry();
    let mut engine = FlowEngine::from_json(flows, &registry, config)
        .await
        .expect("flow should build");
    engine.start().await.expect("engine should start");
    engine
}

/// Start the flow, feed it the injections and return what reached the sinks,
/// without message ids.
async fn run_flow(
    flows: serde_json::Value,
    injections: Vec<(u64, serde_json::Value)>,
    count: usize,
) -> Vec<serde_json::Value> {
    run_flow_with(flows, injections, count, RuntimeConfig::default()).await
}

async fn run_flow_with(
    flows: serde_json::Value,
    injections: Vec<(u64, serde_json::Value)>,
    count: usize,
    config: RuntimeConfig,
) -> Vec<serde_json::Value> {
    let mut engine = engine_with(flows, config).await;
    let mut outputs = engine.take_outputs().expect("outputs are available once");
    for (target, msg) in injections {
        let msg = Msg::from_json(msg).expect("injection must be an object");
        engine.inject(ElementId::new(target), msg).expect("injection target exists");
    }
    let msgs = outputs.collect(count, Duration::from_secs(3)).await;
    engine.stop().await;
    msgs.into_iter()
        .map(|mut msg| {
            msg.remove("_msgid");
            msg.to_json()
        })
        .collect()
}

#[tokio::test]
async fn test_inject_switch_sink_end_to_end() {
    let flows = json!([
        {"id": "100", "type": "tab", "label": "Flow 1"},
        {"id": "1", "type": "inject", "z": "100", "props": [{"p": "payload"}],
            "payload": "10", "payloadType": "num", "once": true, "wires": [["2"]]},
        {"id": "2", "type": "switch", "z": "100", "property": "payload", "propertyType": "msg",
            "rules": [{"t": "gt", "v": "5", "vt": "num"}], "checkall": "true", "outputs": 1, "wires": [["3"]]},
        {"id": "3", "type": "test-once", "z": "100"}
    ]);
    let msgs = run_flow(flows, vec![], 1).await;
    assert_eq!(msgs.len(), 1, "exactly one message should reach the sink");
    assert_eq!(msgs[0]["payload"], json!(10));
}

#[tokio::test]
async fn test_switch_check_all_sends_independent_copies() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "switch", "z": "100", "property": "payload.n",
            "rules": [{"t": "gt", "v": "1"}, {"t": "gt", "v": "2"}, {"t": "lt", "v": "0"}],
            "wires": [["2"], ["3"], ["4"]]},
        {"id": "2", "type": "change", "z": "100",
            "rules": [{"t": "set", "p": "payload.a", "to": "first"}], "wires": [["4"]]},
        {"id": "3", "type": "change", "z": "100",
            "rules": [{"t": "set", "p": "payload.b", "to": "second"}], "wires": [["4"]]},
        {"id": "4", "type": "test-once", "z": "100"}
    ]);
    let msgs = run_flow(flows, vec![(1, json!({"payload": {"n": 5}}))], 2).await;
    assert_eq!(msgs.len(), 2);
    let mut payloads: Vec<_> = msgs.iter().map(|m| m["payload"].clone()).collect();
    payloads.sort_by_key(|p| p.to_string());
    assert_eq!(payloads[0], json!({"a": "first", "n": 5}));
    assert_eq!(payloads[1], json!({"b": "second", "n": 5}));
}

#[tokio::test]
async fn test_switch_first_match_stops_after_one_port() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "switch", "z": "100", "property": "payload", "checkall": "false",
            "rules": [{"t": "btwn", "v": "10", "v2": "1"}, {"t": "gt", "v": "0"}],
            "wires": [["2"], ["3"]]},
        {"id": "2", "type": "change", "z": "100",
            "rules": [{"t": "set", "p": "topic", "to": "between"}], "wires": [["4"]]},
        {"id": "3", "type": "change", "z": "100",
            "rules": [{"t": "set", "p": "topic", "to": "positive"}], "wires": [["4"]]},
        {"id": "4", "type": "test-once", "z": "100"}
    ]);
    let msgs = run_flow(
        flows,
        vec![(1, json!({"payload": 5})), (1, json!({"payload": 50}))],
        3,
    )
    .await;
    // the two messages leave on different ports, so arrival order is free
    let mut topics: Vec<_> = msgs.iter().filter_map(|m| m["topic"].as_str()).collect();
    topics.sort_unstable();
    assert_eq!(topics, vec!["between", "positive"]);
}

#[tokio::test]
async fn test_junction_fans_out_in_wire_order() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "junction", "z": "100", "wires": [["2", "3", "2"]]},
        {"id": "2", "type": "test-once", "z": "100"},
        {"id": "3", "type": "change", "z": "100",
            "rules": [{"t": "set", "p": "topic", "to": "changed"}], "wires": [["2"]]}
    ]);
    let msgs = run_flow(flows, vec![(1, json!({"payload": "x", "topic": "t"}))], 3).await;
    // duplicate wires collapse: one direct delivery plus one through the change node
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0]["topic"], json!("t"));
    assert_eq!(msgs[1]["topic"], json!("changed"));
}

#[tokio::test]
async fn test_env_resolution_precedence() {
    std::env::set_var("FLOWNODES_TEST_PROCESS_ONLY", "from-process");
    std::env::set_var("FLOWNODES_TEST_SHADOWED", "from-process");
    let flows = json!([
        {"id": "100", "type": "tab", "label": "Main",
            "env": [{"name": "FLOWNODES_TEST_SHADOWED", "value": "from-flow", "type": "str"}]},
        {"id": "200", "type": "group", "z": "100", "name": "outer",
            "env": [{"name": "FLOWNODES_TEST_SHADOWED", "value": "from-group", "type": "str"}]},
        {"id": "1", "type": "change", "z": "100", "g": "200", "rules": [
            {"t": "set", "p": "grouped", "to": "FLOWNODES_TEST_SHADOWED", "tot": "env"},
            {"t": "set", "p": "process", "to": "FLOWNODES_TEST_PROCESS_ONLY", "tot": "env"},
            {"t": "set", "p": "path", "to": "NR_NODE_PATH", "tot": "env"},
            {"t": "set", "p": "group", "to": "${NR_GROUP_NAME}", "tot": "str"},
            {"t": "set", "p": "missing", "to": "FLOWNODES_TEST_NOT_SET", "tot": "env"}
        ], "wires": [["2"]]},
        {"id": "2", "type": "change", "z": "100", "rules": [
            {"t": "set", "p": "flat", "to": "FLOWNODES_TEST_SHADOWED", "tot": "env"},
            {"t": "set", "p": "flow", "to": "${NR_FLOW_NAME}", "tot": "str"}
        ], "wires": [["3"]]},
        {"id": "3", "type": "test-once", "z": "100"}
    ]);
    let msgs = run_flow(flows, vec![(1, json!({"missing": 1}))], 1).await;
    let msg = &msgs[0];
    assert_eq!(msg["grouped"], json!("from-group"));
    assert_eq!(msg["flat"], json!("from-flow"));
    assert_eq!(msg["process"], json!("from-process"));
    assert_eq!(msg["path"], json!("0000000000000100/0000000000000001"));
    assert_eq!(msg["group"], json!("outer"));
    assert_eq!(msg["flow"], json!("Main"));
    assert!(msg.get("missing").is_none(), "unresolved env deletes the target");
}

#[tokio::test]
async fn test_reserved_env_names_beat_process_variables() {
    std::env::set_var("NR_NODE_NAME", "decoy");
    let flows = json!([
        {"id": "100", "type": "tab", "label": "Main"},
        {"id": "1", "type": "change", "z": "100", "name": "real name", "rules": [
            {"t": "set", "p": "name", "to": "NR_NODE_NAME", "tot": "env"},
            {"t": "set", "p": "text", "to": "${NR_NODE_NAME}", "tot": "str"}
        ], "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let msgs = run_flow(flows, vec![(1, json!({}))], 1).await;
    assert_eq!(msgs[0]["name"], json!("real name"));
    assert_eq!(msgs[0]["text"], json!("real name"));
}

#[tokio::test]
async fn test_node_survives_out_of_range_dynamic_index() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "change", "z": "100", "rules": [
            {"t": "set", "p": "list[msg.i]", "to": "x", "tot": "str"}
        ], "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let injections = vec![
        (1, json!({"i": 1e20})),
        (1, json!({"i": 100000})),
        (1, json!({"i": 1})),
    ];
    let msgs = run_flow(flows, injections, 1).await;
    // the first two cannot be set and are dropped; the node keeps running
    assert_eq!(msgs[0]["list"], json!([null, "x"]));
}

#[tokio::test]
async fn test_context_round_trip_and_isolation() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "101", "type": "tab"},
        {"id": "1", "type": "change", "z": "100", "rules": [
            {"t": "set", "p": "shared", "pt": "flow", "to": "payload", "tot": "msg"},
            {"t": "set", "p": "#:(other)::shared", "pt": "global", "to": "elsewhere", "tot": "str"}
        ], "wires": [["2", "3"]]},
        {"id": "2", "type": "change", "z": "100", "rules": [
            {"t": "set", "p": "topic", "to": "shared", "tot": "flow"},
            {"t": "set", "p": "global_default", "to": "shared", "tot": "global"},
            {"t": "set", "p": "global_other", "to": "#:(other)::shared", "tot": "global"}
        ], "wires": [["9"]]},
        {"id": "3", "type": "link out", "z": "100"},
        {"id": "4", "type": "change", "z": "101", "rules": [
            {"t": "set", "p": "topic", "to": "shared", "tot": "flow"}
        ], "wires": [["9"]]},
        {"id": "9", "type": "test-once", "z": "100"}
    ]);
    init_tracing();
    let registry = builtin_registry();
    let result = FlowEngine::from_json(flows.clone(), &registry, RuntimeConfig::default()).await;
    assert!(
        matches!(result, Err(FlowError::Graph(GraphError::UnknownNodeType { .. }))),
        "unregistered types are rejected at build"
    );

    let mut flows = flows;
    if let Some(records) = flows.as_array_mut() {
        records.retain(|r| r["id"] != json!("3"));
        records[2]["wires"] = json!([["2"]]);
    }
    let mut engine = engine_with(flows, RuntimeConfig::default()).await;
    let mut outputs = engine.take_outputs().unwrap();
    engine.inject(ElementId::new(1), Msg::with_payload(42.0)).unwrap();
    let first = outputs.collect(1, Duration::from_secs(3)).await;
    engine.inject(ElementId::new(4), Msg::with_payload("other flow")).unwrap();
    let second = outputs.collect(1, Duration::from_secs(3)).await;
    engine.stop().await;

    let msg = first[0].to_json();
    assert_eq!(msg["topic"], json!(42));
    assert!(msg.get("global_default").is_none(), "flow scope is not global scope");
    assert_eq!(msg["global_other"], json!("elsewhere"));
    assert!(
        second[0].to_json().get("topic").is_none(),
        "flow context is private to its flow"
    );

    let key = ContextKey::parse("shared").unwrap();
    let value = engine.context().get(ContextScope::Flow(ElementId::new(0x100)), &key, None).await;
    assert_eq!(value, Some(Value::Number(42.0)));
}

#[tokio::test]
async fn test_file_context_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RuntimeConfig::default();
    config.context.stores.insert(
        "file".to_string(),
        StoreKind::Localfilesystem {
            dir: dir.path().to_path_buf(),
        },
    );

    let writer = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "change", "z": "100", "rules": [
            {"t": "set", "p": "#:(file)::counter", "pt": "global", "to": "7", "tot": "num"}
        ], "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let msgs = run_flow_with(writer, vec![(1, json!({}))], 1, config.clone()).await;
    assert_eq!(msgs.len(), 1);

    let reader = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "change", "z": "100", "rules": [
            {"t": "set", "p": "payload", "to": "#:(file)::counter", "tot": "global"},
            {"t": "set", "p": "memory", "to": "counter", "tot": "global"}
        ], "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let msgs = run_flow_with(reader, vec![(1, json!({"memory": true}))], 1, config).await;
    assert_eq!(msgs[0]["payload"], json!(7));
    assert!(msgs[0].get("memory").is_none(), "memory store starts empty");
}

#[tokio::test]
async fn test_inject_once_fires_exactly_once_after_delay() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "inject", "z": "100", "payload": "hello", "payloadType": "str",
            "topic": "greeting", "once": true, "onceDelay": "0.2", "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let started = Instant::now();
    let mut engine = engine_with(flows, RuntimeConfig::default()).await;
    let mut outputs = engine.take_outputs().unwrap();

    let msg = outputs.next(Duration::from_secs(3)).await.expect("once should fire");
    assert!(started.elapsed() >= Duration::from_millis(190), "once honours its delay");
    assert_eq!(msg.payload(), Some(&Value::from("hello")));
    assert_eq!(msg.topic(), Some(&Value::from("greeting")));

    assert!(outputs.next(Duration::from_millis(400)).await.is_none(), "once fires a single time");
    engine.stop().await;
}

#[tokio::test]
async fn test_inject_repeat_keeps_topic_and_stops_cleanly() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "inject", "z": "100", "props": [{"p": "payload"}, {"p": "topic", "vt": "str"}],
            "payload": "", "payloadType": "date", "topic": "tick", "repeat": "0.05", "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let mut engine = engine_with(flows, RuntimeConfig::default()).await;
    let mut outputs = engine.take_outputs().unwrap();

    let msgs = outputs.collect(3, Duration::from_secs(3)).await;
    assert_eq!(msgs.len(), 3);
    let mut last = 0.0;
    for msg in &msgs {
        assert_eq!(msg.topic(), Some(&Value::from("tick")));
        let stamp = msg.payload().and_then(Value::as_f64).expect("date payload is numeric");
        assert!(stamp >= last, "timestamps do not go backwards");
        last = stamp;
    }

    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Stopped);
    outputs.drain();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(outputs.drain().is_empty(), "nothing is emitted after stop");
}

#[tokio::test]
async fn test_inject_cron_schedule() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "inject", "z": "100", "payload": "cron", "payloadType": "str",
            "crontab": "* * * * * *", "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let mut engine = engine_with(flows, RuntimeConfig::default()).await;
    let mut outputs = engine.take_outputs().unwrap();
    let msgs = outputs.collect(2, Duration::from_secs(4)).await;
    engine.stop().await;
    assert_eq!(msgs.len(), 2, "an every-second schedule fires twice within four seconds");
}

#[tokio::test]
async fn test_inject_on_input_sets_properties_on_incoming_message() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "inject", "z": "100", "props": [
            {"p": "payload", "v": "from-props", "vt": "str"},
            {"p": "a.b[1]", "v": "{\"x\":1}", "vt": "json"},
            {"p": "topic"}
        ], "payload": "ignored", "topic": "legacy", "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let msgs = run_flow(flows, vec![(1, json!({"payload": "old", "keep": 1}))], 1).await;
    assert_eq!(
        msgs[0],
        json!({"payload": "from-props", "topic": "legacy", "keep": 1, "a": {"b": [null, {"x": 1}]}})
    );
}

#[tokio::test]
async fn test_inject_reports_status_and_unsettable_properties() {
    init_tracing();
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "1", "type": "inject", "z": "100", "repeat": "3600", "props": [
            {"p": "s.inner", "v": "1", "vt": "num"},
            {"p": "payload", "v": "kept", "vt": "str"}
        ], "wires": [["2"]]},
        {"id": "2", "type": "test-once", "z": "100"}
    ]);
    let registry = builtin_registry();
    let mut engine = FlowEngine::from_json(flows, &registry, RuntimeConfig::default())
        .await
        .expect("flow should build");
    let mut events = engine.subscribe_events();
    let mut outputs = engine.take_outputs().unwrap();
    engine.start().await.expect("engine should start");
    engine
        .inject(ElementId::new(1), Msg::from_json(json!({"s": "text"})).unwrap())
        .unwrap();
    let msgs = outputs.collect(1, Duration::from_secs(3)).await;
    engine.stop().await;

    assert_eq!(msgs[0].to_json()["payload"], json!("kept"));
    assert_eq!(msgs[0].to_json()["s"], json!("text"));

    let mut infos = Vec::new();
    let mut warnings = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ExecutionEvent::NodeEvent { node_id, event: NodeEvent::Info { message }, .. } => {
                assert_eq!(node_id, ElementId::new(1));
                infos.push(message);
            }
            ExecutionEvent::NodeEvent { node_id, event: NodeEvent::Warning { message }, .. } => {
                assert_eq!(node_id, ElementId::new(1));
                warnings.push(message);
            }
            _ => {}
        }
    }
    assert_eq!(infos, vec!["every 3600s".to_string()]);
    assert_eq!(warnings, vec!["cannot set msg.s.inner".to_string()]);
}

#[tokio::test]
async fn test_disabled_nodes_are_not_instantiated() {
    let flows = json!([
        {"id": "100", "type": "tab"},
        {"id": "101", "type": "tab", "disabled": true},
        {"id": "1", "type": "junction", "z": "100", "wires": [["2", "3"]]},
        {"id": "2", "type": "test-once", "z": "100", "d": true},
        {"id": "3", "type": "test-once", "z": "100"},
        {"id": "4", "type": "not-a-real-type", "z": "101"}
    ]);
    let mut engine = engine_with(flows, RuntimeConfig::default()).await;
    assert_eq!(engine.node_ids().len(), 2);
    assert!(engine.inject(ElementId::new(2), Msg::new()).is_err());

    let mut outputs = engine.take_outputs().unwrap();
    engine.inject(ElementId::new(1), Msg::with_payload(1.0)).unwrap();
    let msgs = outputs.collect(2, Duration::from_millis(500)).await;
    assert_eq!(msgs.len(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn test_configuration_errors_fail_the_build() {
    init_tracing();
    let registry = builtin_registry();
    let cases = [
        json!([{"id": "100", "type": "tab"}, {"id": "1", "type": "junction", "z": "100", "wires": [["9"]]}]),
        json!([{"id": "100", "type": "tab"}, {"id": "1", "type": "inject", "z": "100", "crontab": "nope"}]),
        json!([{"id": "100", "type": "tab"},
            {"id": "1", "type": "switch", "z": "100", "rules": [{"t": "jsonata_exp", "v": "x"}]}]),
        json!([{"id": "100", "type": "tab"},
            {"id": "1", "type": "inject", "z": "100", "payload": "ten", "payloadType": "num"}]),
        json!([{"id": "1", "type": "junction", "z": "100"}]),
        json!([{"id": "100", "type": "tab"}, {"id": "100", "type": "junction", "z": "100"}]),
    ];
    for flows in cases {
        let result = FlowEngine::from_json(flows.clone(), &registry, RuntimeConfig::default()).await;
        assert!(
            matches!(result, Err(FlowError::Graph(_))),
            "expected a configuration error for {flows}"
        );
    }
}
