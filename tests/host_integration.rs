//! End-to-end host scenarios: sign → resolve → chain → dispatch, thread
//! spawning with budget accounting, the full harness loop against the
//! real dispatcher, and continuation handoff under context pressure.

use ryeos_core::protocol::{Request, Response};
use ryeos_core::{ArtifactId, ArtifactKind, Space, ThreadStatus, Verb};
use ryeos_harness::{Harness, HarnessConfig, RunEnd, ScriptedProvider, Usage};
use ryeos_host::{Dispatcher, Host, HostConfig};
use ryeos_threads::NullProcessDriver;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct World {
    _dir: TempDir,
    host: Arc<Host>,
    dispatcher: Arc<Dispatcher>,
}

fn world() -> World {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(&project).unwrap();
    let config = HostConfig {
        project_dir: Some(project),
        user_dir: Some(dir.path().join("user")),
        runner: Some(vec!["rye-runner".into()]),
        ..HostConfig::default()
    };
    let host = Arc::new(Host::init_with_driver(config, Arc::new(NullProcessDriver::default())).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(host.clone()));
    World { _dir: dir, host, dispatcher }
}

fn write_artifact(world: &World, kind: ArtifactKind, id: &str, body: &str) {
    let id = ArtifactId::new(id).unwrap();
    let ext = world.host.resolver.extractors.get(kind).primary_extension();
    let path = world
        .host
        .resolver
        .path_for(&Space::Project, kind, &id, ext)
        .unwrap();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

async fn sign(world: &World, kind: ArtifactKind, pattern: &str) -> Response {
    let mut req = Request::new(Verb::Sign);
    req.kind = Some(kind);
    req.id = Some(pattern.to_string());
    world.dispatcher.handle(req).await
}

fn seed_tool_chain(world: &World) {
    write_artifact(world, ArtifactKind::Tool, "files/read",
        "name: read\ncategory: files\nversion: 1.0.0\nruntime_ref: runtimes/script\nconfig:\n  script: \"cat {path}\"\n");
    write_artifact(world, ArtifactKind::Tool, "runtimes/script",
        "name: script\ncategory: runtimes\nversion: 1.0.0\nruntime_ref: runtimes/subprocess\nexpects: [script]\nconfig:\n  command: \"{script}\"\n");
    write_artifact(world, ArtifactKind::Tool, "runtimes/subprocess",
        "name: subprocess\ncategory: runtimes\nversion: 1.0.0\nruntime_ref: \"«primitive»\"\nprimitive: subprocess\nconfig:\n  timeout_s: 30\n");
}

async fn execute_request(world: &World, id: &str, params: serde_json::Value, dry_run: bool) -> Response {
    let mut req = Request::new(Verb::Execute);
    req.kind = Some(ArtifactKind::Tool);
    req.id = Some(id.to_string());
    req.params = params.as_object().cloned().unwrap_or_default();
    req.options.dry_run = dry_run;
    world.dispatcher.handle(req).await
}

#[tokio::test]
async fn signed_chain_executes_and_pins_lockfile() {
    let world = world();
    seed_tool_chain(&world);
    assert!(sign(&world, ArtifactKind::Tool, "*").await.is_success());

    // Dry run reports the chain without dispatching.
    let resp = execute_request(&world, "files/read", json!({"path": "x.txt"}), true).await;
    assert!(resp.is_success(), "{:?}", resp.error);
    assert_eq!(resp.data["chain"].as_array().unwrap().len(), 3);
    assert_eq!(resp.data["validated_pairs"].as_array().unwrap().len(), 2);
    assert!(resp.data.get("result").is_none());

    // A real run dispatches the subprocess primitive and auto-pins.
    let target = world.host.resolver.tiers.project.clone().unwrap().join("hello.txt");
    std::fs::write(&target, "hello from rye\n").unwrap();
    let resp = execute_request(
        &world,
        "files/read",
        json!({"path": target.to_string_lossy()}),
        false,
    )
    .await;
    assert!(resp.is_success(), "{:?}", resp.error);
    let result = &resp.data["result"];
    assert_eq!(result["success"], true);
    assert!(result["stdout"].as_str().unwrap().contains("hello from rye"));
    let lock_path = resp.data["lockfile_written"].as_str().unwrap().to_string();
    assert!(std::path::Path::new(&lock_path).exists());

    // Tamper with the runtime: the pinned chain now fails closed.
    let runtime = world
        .host
        .resolver
        .path_for(&Space::Project, ArtifactKind::Tool, &ArtifactId::new("runtimes/script").unwrap(), "yaml")
        .unwrap();
    let content = std::fs::read_to_string(&runtime).unwrap();
    std::fs::write(&runtime, content.replace("expects", "eXpects")).unwrap();
    let resp = execute_request(&world, "files/read", json!({}), false).await;
    assert_eq!(resp.error.unwrap().kind, "IntegrityError");
}

#[tokio::test]
async fn unsigned_dependency_fails_with_integrity() {
    let world = world();
    write_artifact(&world, ArtifactKind::Tool, "files/read",
        "name: read\ncategory: files\nversion: 1.0.0\nruntime_ref: runtimes/subprocess\n");
    write_artifact(&world, ArtifactKind::Tool, "runtimes/subprocess",
        "name: subprocess\ncategory: runtimes\nversion: 1.0.0\nruntime_ref: \"«primitive»\"\nprimitive: subprocess\n");
    // Only the root gets signed; its dependency stays unsigned.
    assert!(sign(&world, ArtifactKind::Tool, "files/read").await.is_success());

    let resp = execute_request(&world, "files/read", json!({}), false).await;
    let error = resp.error.unwrap();
    assert_eq!(error.kind, "IntegrityError");
    assert!(error.message.contains("runtimes/subprocess"));
}

#[tokio::test]
async fn full_agent_loop_through_dispatcher() {
    let world = world();
    seed_tool_chain(&world);
    write_artifact(&world, ArtifactKind::Workflow, "ops/probe",
        "---\nname: probe\ncategory: ops\nlimits:\n  turns: 6\n  spend: 1.0\npermissions:\n  - execute.tool.files.*\n  - execute.tool.runtimes.*\n---\n\nProbe the workspace and report.\n");
    assert!(sign(&world, ArtifactKind::Tool, "*").await.is_success());
    assert!(sign(&world, ArtifactKind::Workflow, "*").await.is_success());

    let probe_target = world.host.resolver.tiers.project.clone().unwrap().join("status.txt");
    std::fs::write(&probe_target, "all systems nominal\n").unwrap();

    // Spawn through the protocol, as an external caller would.
    let mut req = Request::new(Verb::Execute);
    req.kind = Some(ArtifactKind::Workflow);
    req.id = Some("ops/probe".into());
    req.options.thread = true;
    req.options.detach = true;
    let resp = world.dispatcher.handle(req).await;
    assert!(resp.is_success(), "{:?}", resp.error);
    let thread_id = resp.data["thread_id"].as_str().unwrap().to_string();

    // Drive the harness in-process with a scripted model: one tool call
    // into the real executor chain, then a closing answer.
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_turn(
            "c1",
            "execute",
            json!({"kind": "tool", "id": "files/read", "params": {"path": probe_target.to_string_lossy()}}),
            Usage { input_tokens: 200, output_tokens: 40 },
        ),
        ScriptedProvider::text_turn("workspace is healthy", Usage { input_tokens: 260, output_tokens: 30 }),
    ]);
    let mut harness = Harness::new(
        world.host.orchestrator.clone(),
        Arc::new(provider),
        world.dispatcher.clone(),
        Some(world.host.signing_key.clone()),
        &thread_id,
        HarnessConfig::default(),
    )
    .unwrap();
    let end = harness.run(&[]).await.unwrap();
    assert!(matches!(end, RunEnd::Completed { .. }));

    let meta = world.host.orchestrator.registry.get(&thread_id).unwrap();
    assert_eq!(meta.status, ThreadStatus::Completed);
    assert_eq!(meta.result.unwrap()["output"], "workspace is healthy");
    assert_eq!(meta.cost.turns_used, 2);

    // The tool call went through the real chain: its lockfile exists.
    let lock = world.host.resolver.tiers.project.clone().unwrap()
        .join("lockfiles/files/read@1.0.0.lock.json");
    assert!(lock.exists());

    // Transcript is tamper-evident and wait() sees the result.
    let transcript = meta.transcript_path.clone().unwrap();
    assert!(ryeos_harness::transcript::verify_chain(&transcript).unwrap());
    let report = world
        .host
        .orchestrator
        .wait(&[thread_id.clone()], Duration::from_secs(5))
        .await
        .unwrap();
    assert!(report.all_succeeded);

    // Budget settled: ledger invariant holds everywhere.
    assert!(world.host.orchestrator.ledger.audit().unwrap().is_empty());
}

#[tokio::test]
async fn permission_denied_tool_call_keeps_thread_alive() {
    let world = world();
    seed_tool_chain(&world);
    write_artifact(&world, ArtifactKind::Workflow, "ops/limited",
        "---\nname: limited\ncategory: ops\npermissions:\n  - execute.tool.files.*\n---\n\nStay in your lane.\n");
    assert!(sign(&world, ArtifactKind::Tool, "*").await.is_success());
    assert!(sign(&world, ArtifactKind::Workflow, "*").await.is_success());

    let mut req = Request::new(Verb::Execute);
    req.kind = Some(ArtifactKind::Workflow);
    req.id = Some("ops/limited".into());
    req.options.thread = true;
    req.options.detach = true;
    let resp = world.dispatcher.handle(req).await;
    let thread_id = resp.data["thread_id"].as_str().unwrap().to_string();

    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_turn(
            "c1",
            "execute",
            json!({"kind": "tool", "id": "net/http", "params": {}}),
            Usage { input_tokens: 100, output_tokens: 20 },
        ),
        ScriptedProvider::text_turn("fell back to local data", Usage { input_tokens: 150, output_tokens: 20 }),
    ]);
    let mut harness = Harness::new(
        world.host.orchestrator.clone(),
        Arc::new(provider),
        world.dispatcher.clone(),
        None,
        &thread_id,
        HarnessConfig::default(),
    )
    .unwrap();
    let end = harness.run(&[]).await.unwrap();

    // Denied, observed, and the thread still completed.
    assert!(matches!(end, RunEnd::Completed { .. }));
    let events = ryeos_harness::transcript::read_events(
        &world.host.orchestrator.registry.get(&thread_id).unwrap().transcript_path.unwrap(),
    )
    .unwrap();
    assert!(events.iter().any(|e| e["event"] == "permission_denied"));
}

#[tokio::test]
async fn context_pressure_hands_off_to_successor() {
    let world = world();
    write_artifact(&world, ArtifactKind::Workflow, "ops/longhaul",
        "---\nname: longhaul\ncategory: ops\npermissions:\n  - execute.tool.files.*\n---\n\nKeep going until done.\n");
    assert!(sign(&world, ArtifactKind::Workflow, "*").await.is_success());

    let mut req = Request::new(Verb::Execute);
    req.kind = Some(ArtifactKind::Workflow);
    req.id = Some("ops/longhaul".into());
    req.options.thread = true;
    req.options.detach = true;
    let resp = world.dispatcher.handle(req).await;
    let thread_id = resp.data["thread_id"].as_str().unwrap().to_string();

    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_turn(
        &"progress notes ".repeat(300),
        Usage { input_tokens: 400, output_tokens: 900 },
    )])
    .with_context_window(1200);
    let mut harness = Harness::new(
        world.host.orchestrator.clone(),
        Arc::new(provider),
        world.dispatcher.clone(),
        None,
        &thread_id,
        HarnessConfig::default(),
    )
    .unwrap();
    let end = harness.run(&[]).await.unwrap();
    let RunEnd::Continued { successor } = end else {
        panic!("expected continuation, got {end:?}");
    };

    let old = world.host.orchestrator.registry.get(&thread_id).unwrap();
    let new = world.host.orchestrator.registry.get(&successor).unwrap();
    assert_eq!(old.status, ThreadStatus::Continued);
    assert_eq!(old.continuation_thread_id.as_deref(), Some(successor.as_str()));
    assert_eq!(new.continuation_of.as_deref(), Some(thread_id.as_str()));
    assert_eq!(new.chain_root(), old.chain_root());

    // Finishing the successor resolves a wait on the original id.
    world
        .host
        .orchestrator
        .registry
        .set_result(&successor, ThreadStatus::Completed, &json!({"output": "done"}), &Default::default())
        .unwrap();
    let report = world
        .host
        .orchestrator
        .wait(&[thread_id], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(report.results[0].resolved_thread_id, successor);
}

#[tokio::test]
async fn child_spawn_budget_and_attenuation_through_dispatcher() {
    let world = world();
    write_artifact(&world, ArtifactKind::Workflow, "ops/parent",
        "---\nname: parent\ncategory: ops\nlimits:\n  spend: 1.0\npermissions:\n  - execute.tool.files.*\n  - execute.workflow.ops.*\n---\n\nDelegate carefully.\n");
    write_artifact(&world, ArtifactKind::Workflow, "ops/child",
        "---\nname: child\ncategory: ops\nlimits:\n  spend: 0.8\npermissions:\n  - execute.tool.files.*\n---\n\nDo one thing.\n");
    assert!(sign(&world, ArtifactKind::Workflow, "*").await.is_success());

    let mut req = Request::new(Verb::Execute);
    req.kind = Some(ArtifactKind::Workflow);
    req.id = Some("ops/parent".into());
    req.options.thread = true;
    req.options.detach = true;
    let resp = world.dispatcher.handle(req).await;
    let parent_id = resp.data["thread_id"].as_str().unwrap().to_string();

    // The parent thread spawns a child through its own tool call path.
    use ryeos_harness::ToolDispatcher as _;
    let spec = ryeos_harness::ToolCallSpec {
        verb: Verb::Execute,
        kind: ArtifactKind::Workflow,
        id: Some(ArtifactId::new("ops/child").unwrap()),
        params: json!({"async": true}).as_object().cloned().unwrap(),
    };
    let outcome = world.dispatcher.dispatch(&parent_id, &spec).await;
    assert!(!outcome.is_error, "{}", outcome.content);
    let child: serde_json::Value = serde_json::from_str(&outcome.content).unwrap();
    let child_id = child["thread_id"].as_str().unwrap().to_string();

    let child_meta = world.host.orchestrator.registry.get(&child_id).unwrap();
    assert_eq!(child_meta.parent_id.as_deref(), Some(parent_id.as_str()));

    // $0.80 of the parent's $1.00 is now reserved; an explicit ask for
    // $0.25 more cannot fit and aborts the spawn.
    let entry = world.host.orchestrator.ledger.entry(&parent_id).unwrap();
    assert!((entry.reserved_spend - 0.8).abs() < 1e-9);
    let over_ask = ryeos_harness::ToolCallSpec {
        verb: Verb::Execute,
        kind: ArtifactKind::Workflow,
        id: Some(ArtifactId::new("ops/child").unwrap()),
        params: json!({"async": true, "limits": {"spend": 0.25}})
            .as_object()
            .cloned()
            .unwrap(),
    };
    let second = world.dispatcher.dispatch(&parent_id, &over_ask).await;
    assert!(second.is_error);
    assert!(second.content.contains("BudgetReservation"));

    // The failed spawn changed nothing for the parent or child A.
    let entry = world.host.orchestrator.ledger.entry(&parent_id).unwrap();
    assert!((entry.reserved_spend - 0.8).abs() < 1e-9);
    assert_eq!(entry.actual_spend, 0.0);
    assert_eq!(
        world.host.orchestrator.registry.get(&child_id).unwrap().status,
        ThreadStatus::Running
    );
    assert!(world.host.orchestrator.ledger.audit().unwrap().is_empty());
}
