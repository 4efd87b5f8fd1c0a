//! End-to-end scenarios driven through the real subprocess executor.
//!
//! This binary runs without the libtest harness: worker subprocesses
//! re-execute it, and `worker::bootstrap` at the top of `main` routes
//! those invocations into the single-task child path.

use anyhow::{ensure, Context};
use metaflow_lite_core::cards::{CardRenderer, CardSpec, CardTaskView};
use metaflow_lite_core::client::MetaflowClient;
use metaflow_lite_core::datastore::{Datastore, DatastoreConfig};
use metaflow_lite_core::decorator::{Card, Environment};
use metaflow_lite_core::flow::{FlowBuilder, FlowDef, FlowRegistry, Next, StepDef};
use metaflow_lite_core::metadata::{MetadataConfig, MetadataProvider};
use metaflow_lite_core::scheduler::{RunOptions, Scheduler};
use metaflow_lite_core::types::*;
use metaflow_lite_core::worker;
use serde_json::json;
use std::sync::Arc;

const FAIL_MIDDLE_ENV: &str = "MFL_E2E_FAIL_MIDDLE";
const FAIL_SPIN_AT_ENV: &str = "MFL_E2E_FAIL_SPIN_AT";

fn main() {
    let registry = build_registry();
    worker::bootstrap(&registry);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let mut failed = 0u32;
    let mut run = |name: &str, result: anyhow::Result<()>| match result {
        Ok(()) => println!("ok - {name}"),
        Err(e) => {
            failed += 1;
            println!("FAILED - {name}: {e:#}");
        }
    };

    run("linear_hello", runtime.block_on(linear_hello(&registry)));
    run("foreach_doubling", runtime.block_on(foreach_doubling(&registry)));
    run("switch_routing", runtime.block_on(switch_routing(&registry)));
    run("retry_and_catch", runtime.block_on(retry_and_catch(&registry)));
    run("resume_from_failure", runtime.block_on(resume_from_failure(&registry)));
    run("signal_kill_under_catch", runtime.block_on(signal_kill_under_catch(&registry)));
    run("recursive_switch", runtime.block_on(recursive_switch(&registry)));
    run("recursive_switch_resume", runtime.block_on(recursive_switch_resume(&registry)));
    run("nested_foreach", runtime.block_on(nested_foreach(&registry)));
    run("empty_foreach", runtime.block_on(empty_foreach(&registry)));
    run("parallel_group", runtime.block_on(parallel_group(&registry)));
    run("unbounded_foreach", runtime.block_on(unbounded_foreach(&registry)));
    run("timeout_under_catch", runtime.block_on(timeout_under_catch(&registry)));
    run("card_rendering", runtime.block_on(card_rendering(&registry)));
    run("runner_launch", runtime.block_on(runner_launch()));

    if failed > 0 {
        println!("{failed} scenario(s) failed");
        std::process::exit(1);
    }
    println!("all scenarios passed");
}

// ─── Flow definitions ─────────────────────────────────────────

struct LossCard;

impl CardRenderer for LossCard {
    fn render(&self, task: &CardTaskView) -> anyhow::Result<String> {
        let loss = task.get("loss").cloned().unwrap_or(json!(null));
        Ok(format!("<h1>loss: {loss}</h1>"))
    }
}

fn build_registry() -> FlowRegistry {
    FlowRegistry::new()
        .register(hello_flow())
        .register(foreach_flow())
        .register(switch_flow())
        .register(retry_flow())
        .register(resume_flow())
        .register(segv_flow())
        .register(spin_flow())
        .register(spin_resume_flow())
        .register(nested_foreach_flow())
        .register(empty_foreach_flow())
        .register(parallel_flow())
        .register(unbounded_flow())
        .register(timeout_flow())
        .register(card_flow())
}

fn hello_flow() -> FlowDef {
    FlowBuilder::new("HelloFlow")
        .step(
            StepDef::new("start", |f| {
                ensure_env("GREETING", "hi")?;
                f.set("x", json!(1))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end"))
            .with(Arc::new(Environment::new(&[("GREETING", "hi")]))),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("HelloFlow")
}

fn ensure_env(key: &str, want: &str) -> anyhow::Result<()> {
    let got = std::env::var(key).unwrap_or_default();
    ensure!(got == want, "env var {key} not set by decorator (got '{got}')");
    Ok(())
}

fn foreach_flow() -> FlowDef {
    FlowBuilder::new("ForeachFlow")
        .step(
            StepDef::new("start", |f| {
                f.set("xs", json!([1, 2, 3]))?;
                f.next_foreach("worker", "xs")?;
                Ok(())
            })
            .next(Next::foreach("worker", "xs")),
        )
        .step(
            StepDef::new("worker", |f| {
                let x: i64 = f.input_as()?;
                f.set("y", json!(x * 2))?;
                f.next("collect")?;
                Ok(())
            })
            .next(Next::linear("collect")),
        )
        .step(
            StepDef::join("collect", |f, inputs| {
                let mut ys: Vec<i64> = inputs
                    .iter()
                    .map(|slot| slot.get_as::<i64>("y"))
                    .collect::<Result<_, _>>()?;
                ys.sort();
                f.set("ys", json!(ys))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("ForeachFlow")
}

fn switch_flow() -> FlowDef {
    FlowBuilder::new("SwitchFlow")
        .step(
            StepDef::new("start", |f| {
                f.set("pick", json!("a"))?;
                f.next_switch(&["a", "b"], "pick")?;
                Ok(())
            })
            .next(Next::switch(&["a", "b"], "pick")),
        )
        .step(
            StepDef::new("a", |f| {
                f.set("v", json!(10))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(
            StepDef::new("b", |f| {
                f.set("v", json!(20))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(
            StepDef::join("end", |f, inputs| {
                ensure!(inputs.len() == 1, "expected one live branch");
                let v: i64 = inputs.get(0).unwrap().get_as("v")?;
                f.set("v", json!(v))?;
                Ok(())
            })
            .next(Next::end()),
        )
        .build()
        .expect("SwitchFlow")
}

fn retry_flow() -> FlowDef {
    FlowBuilder::new("RetryFlow")
        .step(
            StepDef::new("start", |_f| anyhow::bail!("boom"))
                .next(Next::linear("end"))
                .retry(2, 0)
                .catch("err"),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("RetryFlow")
}

fn resume_flow() -> FlowDef {
    FlowBuilder::new("ResumeFlow")
        .step(
            StepDef::new("start", |f| {
                f.set("seed", json!(7))?;
                f.next("middle")?;
                Ok(())
            })
            .next(Next::linear("middle")),
        )
        .step(
            StepDef::new("middle", |f| {
                if std::env::var(FAIL_MIDDLE_ENV).is_ok() {
                    anyhow::bail!("middle failed on purpose");
                }
                let seed: i64 = f.get_as("seed")?;
                f.set("doubled", json!(seed * 2))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("ResumeFlow")
}

fn segv_flow() -> FlowDef {
    FlowBuilder::new("SegvFlow")
        .step(
            StepDef::new("start", |_f| {
                // Deliver SIGSEGV to this worker process; the orchestrator
                // must survive.
                let pid = std::process::id().to_string();
                let _ = std::process::Command::new("kill")
                    .args(["-11", &pid])
                    .status();
                std::thread::sleep(std::time::Duration::from_secs(5));
                Ok(())
            })
            .next(Next::linear("end"))
            .catch("err"),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("SegvFlow")
}

fn spin_body(f: &mut metaflow_lite_core::FlowScope) -> anyhow::Result<()> {
    let n: i64 = f.get_as("n").unwrap_or(0) + 1;
    if let Ok(fail_at) = std::env::var(FAIL_SPIN_AT_ENV) {
        if fail_at.parse::<i64>().ok() == Some(n) {
            anyhow::bail!("spin failed at iteration {n}");
        }
    }
    f.set("n", json!(n))?;
    let goto = if n < 3 { "spin" } else { "done" };
    f.set("goto", json!(goto))?;
    f.next_switch(&["spin", "done"], "goto")?;
    Ok(())
}

fn spin_flow() -> FlowDef {
    recursive_flow("SpinFlow")
}

fn spin_resume_flow() -> FlowDef {
    recursive_flow("SpinResumeFlow")
}

fn recursive_flow(name: &str) -> FlowDef {
    FlowBuilder::new(name)
        .step(
            StepDef::new("start", |f| {
                f.next("spin")?;
                Ok(())
            })
            .next(Next::linear("spin")),
        )
        .step(
            StepDef::new("spin", spin_body).next(Next::switch(&["spin", "done"], "goto")),
        )
        .step(
            StepDef::new("done", |f| {
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("recursive flow")
}

fn nested_foreach_flow() -> FlowDef {
    FlowBuilder::new("NestedFlow")
        .step(
            StepDef::new("start", |f| {
                f.set("xs", json!([[1, 2], [3]]))?;
                f.next_foreach("mid", "xs")?;
                Ok(())
            })
            .next(Next::foreach("mid", "xs")),
        )
        .step(
            StepDef::new("mid", |f| {
                let ys = f.input().cloned().context("no foreach input")?;
                f.set("ys", ys)?;
                f.next_foreach("leaf", "ys")?;
                Ok(())
            })
            .next(Next::foreach("leaf", "ys")),
        )
        .step(
            StepDef::new("leaf", |f| {
                let stack = f.foreach_stack();
                ensure!(stack.len() == 2, "expected two foreach frames, got {}", stack.len());
                let v: i64 = f.input_as()?;
                f.set("v", json!(v * 10))?;
                f.next("inner_join")?;
                Ok(())
            })
            .next(Next::linear("inner_join")),
        )
        .step(
            StepDef::join("inner_join", |f, inputs| {
                let mut vs: Vec<i64> = inputs
                    .iter()
                    .map(|s| s.get_as::<i64>("v"))
                    .collect::<Result<_, _>>()?;
                vs.sort();
                f.set("vs", json!(vs))?;
                f.next("outer_join")?;
                Ok(())
            })
            .next(Next::linear("outer_join")),
        )
        .step(
            StepDef::join("outer_join", |f, inputs| {
                let mut all: Vec<i64> = Vec::new();
                for slot in inputs.iter() {
                    all.extend(slot.get_as::<Vec<i64>>("vs")?);
                }
                all.sort();
                f.set("all_vs", json!(all))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("NestedFlow")
}

fn empty_foreach_flow() -> FlowDef {
    FlowBuilder::new("EmptyFanFlow")
        .step(
            StepDef::new("start", |f| {
                f.set("xs", json!([]))?;
                f.next_foreach("worker", "xs")?;
                Ok(())
            })
            .next(Next::foreach("worker", "xs")),
        )
        .step(
            StepDef::new("worker", |f| {
                f.next("collect")?;
                Ok(())
            })
            .next(Next::linear("collect")),
        )
        .step(
            StepDef::join("collect", |f, inputs| {
                f.set("n_inputs", json!(inputs.len()))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("EmptyFanFlow")
}

fn parallel_flow() -> FlowDef {
    FlowBuilder::new("ParallelFlow")
        .step(
            StepDef::new("start", |f| {
                f.next_parallel("train", 3)?;
                Ok(())
            })
            .next(Next::parallel("train", 3)),
        )
        .step(
            StepDef::new("train", |f| {
                let rank = f.index().context("no parallel index")?;
                f.set("rank", json!(rank))?;
                f.next("gather")?;
                Ok(())
            })
            .next(Next::linear("gather")),
        )
        .step(
            StepDef::join("gather", |f, inputs| {
                let mut ranks: Vec<i64> = inputs
                    .iter()
                    .map(|s| s.get_as::<i64>("rank"))
                    .collect::<Result<_, _>>()?;
                ranks.sort();
                f.set("ranks", json!(ranks))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("ParallelFlow")
}

fn unbounded_flow() -> FlowDef {
    FlowBuilder::new("UnboundedFlow")
        .step(
            StepDef::new("start", |f| {
                f.set("xs", json!([5, 6]))?;
                f.next_foreach("worker", "xs")?;
                Ok(())
            })
            .next(Next::foreach_unbounded("worker", "xs")),
        )
        .step(
            StepDef::new("worker", |f| {
                let stack = f.foreach_stack();
                ensure!(
                    stack.first().map(|(_, n, _)| n.is_none()).unwrap_or(false),
                    "unbounded frame must not carry num_splits"
                );
                let x: i64 = f.input_as()?;
                f.set("y", json!(x + 1))?;
                f.next("collect")?;
                Ok(())
            })
            .next(Next::linear("collect")),
        )
        .step(
            StepDef::join("collect", |f, inputs| {
                f.set("n_inputs", json!(inputs.len()))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end")),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("UnboundedFlow")
}

fn timeout_flow() -> FlowDef {
    FlowBuilder::new("TimeoutFlow")
        .step(
            StepDef::new("start", |_f| {
                std::thread::sleep(std::time::Duration::from_secs(30));
                Ok(())
            })
            .next(Next::linear("end"))
            .timeout_secs(1)
            .catch("err"),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("TimeoutFlow")
}

fn card_flow() -> FlowDef {
    FlowBuilder::new("CardFlow")
        .step(
            StepDef::new("start", |f| {
                f.set("loss", json!(0.25))?;
                f.next("end")?;
                Ok(())
            })
            .next(Next::linear("end"))
            .with(Arc::new(Card::new(CardSpec::new(
                "default",
                Arc::new(LossCard),
            )))),
        )
        .step(StepDef::new("end", |_f| Ok(())).next(Next::end()))
        .build()
        .expect("CardFlow")
}

// ─── Scenario plumbing ────────────────────────────────────────

struct Harness {
    _dir: tempfile::TempDir,
    datastore: Arc<dyn Datastore>,
    metadata: Arc<dyn MetadataProvider>,
    datastore_cfg: DatastoreConfig,
    metadata_cfg: MetadataConfig,
}

impl Harness {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let datastore_cfg = DatastoreConfig::Local { root: root.clone() };
        let metadata_cfg = MetadataConfig::Local { root };
        Ok(Self {
            datastore: datastore_cfg.build()?,
            metadata: metadata_cfg.build()?,
            datastore_cfg,
            metadata_cfg,
            _dir: dir,
        })
    }

    async fn run(
        &self,
        registry: &FlowRegistry,
        flow_name: &str,
        options: RunOptions,
        resume_step: Option<&str>,
    ) -> (String, metaflow_lite_core::Result<()>) {
        let flow = registry.get(flow_name).expect("registered flow");
        let run_id = gen_run_id();
        let mut scheduler = Scheduler::new(
            flow,
            self.datastore.clone(),
            self.metadata.clone(),
            self.datastore_cfg.clone(),
            self.metadata_cfg.clone(),
            run_id.clone(),
            options,
        );
        let result = scheduler.execute(resume_step).await;
        (run_id, result)
    }

    fn client(&self) -> MetaflowClient {
        MetaflowClient::new(self.datastore.clone(), self.metadata.clone()).with_namespace(None)
    }

    async fn task_count(&self, flow: &str, run: &str, step: &str) -> anyhow::Result<usize> {
        Ok(self.metadata.get_task_ids(flow, run, step).await?.len())
    }
}

// ─── Scenarios ────────────────────────────────────────────────

/// Linear hello: two tasks, x visible through the client, run done.
async fn linear_hello(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "HelloFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    let client = h.client();
    let run = client.flow("HelloFlow").run(&run_id).await?;
    ensure!(run.finished().await?, "run not stamped done");
    ensure!(run.successful().await?, "run not successful");

    ensure!(h.task_count("HelloFlow", &run_id, "start").await? == 1);
    ensure!(h.task_count("HelloFlow", &run_id, "end").await? == 1);

    let start_task = run.step("start").task().await?;
    let data = start_task.data().await?;
    ensure!(data.get("x") == Some(&json!(1)), "x != 1: {data:?}");
    ensure!(start_task.successful().await?);

    // Every completed task has at least one attempt entry.
    let attempts = start_task
        .metadata_entries()
        .await?
        .into_iter()
        .filter(|e| e.kind == META_ATTEMPT)
        .count();
    ensure!(attempts >= 1, "no attempt metadata");
    Ok(())
}

/// Foreach doubling: 5 tasks, sorted results, per-frame metadata.
async fn foreach_doubling(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "ForeachFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    ensure!(h.task_count("ForeachFlow", &run_id, "start").await? == 1);
    ensure!(h.task_count("ForeachFlow", &run_id, "worker").await? == 3);
    ensure!(h.task_count("ForeachFlow", &run_id, "collect").await? == 1);

    let client = h.client();
    let run = client.flow("ForeachFlow").run(&run_id).await?;
    let data = run.data().await?.context("no end data")?;
    // The join's artifacts flow through to the end task.
    ensure!(data.get("ys") == Some(&json!([2, 4, 6])), "ys wrong: {data:?}");

    for task in run.step("worker").tasks().await? {
        let meta = task.metadata_dict().await?;
        let frames = meta
            .get(META_FOREACH_INDICES)
            .context("worker lacks foreach-indices")?;
        let frames: Vec<(String, String, usize)> = serde_json::from_str(frames)?;
        ensure!(frames.len() == 1, "expected one frame");
        ensure!(frames[0].0 == "start" && frames[0].1 == "xs");
    }
    Ok(())
}

/// Switch: only the taken branch produces tasks.
async fn switch_routing(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "SwitchFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    ensure!(h.task_count("SwitchFlow", &run_id, "start").await? == 1);
    ensure!(h.task_count("SwitchFlow", &run_id, "a").await? == 1);
    ensure!(h.task_count("SwitchFlow", &run_id, "b").await? == 0, "branch b ran");
    ensure!(h.task_count("SwitchFlow", &run_id, "end").await? == 1);

    let client = h.client();
    let run = client.flow("SwitchFlow").run(&run_id).await?;
    let data = run.data().await?.context("no end data")?;
    ensure!(data.get("v") == Some(&json!(10)), "v wrong: {data:?}");
    Ok(())
}

/// Retry + catch: three attempts recorded, then suppressed success.
async fn retry_and_catch(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "RetryFlow", RunOptions::default(), None)
        .await;
    result.context("run should be suppressed by catch")?;

    let client = h.client();
    let run = client.flow("RetryFlow").run(&run_id).await?;
    let task = run.step("start").task().await?;

    let attempts: Vec<String> = task
        .metadata_entries()
        .await?
        .into_iter()
        .filter(|e| e.kind == META_ATTEMPT)
        .map(|e| e.value)
        .collect();
    ensure!(
        attempts == vec!["0", "1", "2"],
        "attempts recorded as {attempts:?}"
    );

    ensure!(task.successful().await?, "_task_ok should be true");
    let data = task.data().await?;
    let err = data.get("err").context("no err artifact")?;
    ensure!(
        err.get("type") == Some(&json!("UserStepException")),
        "err.type wrong: {err}"
    );
    ensure!(
        err.get("message").and_then(|m| m.as_str()).unwrap_or("").contains("boom"),
        "err.message wrong: {err}"
    );
    Ok(())
}

/// Resume: start clones with origin markers, middle re-executes, end is
/// fresh, and no task id collides with the origin run's.
async fn resume_from_failure(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;

    std::env::set_var(FAIL_MIDDLE_ENV, "1");
    let (origin_id, origin_result) = h
        .run(registry, "ResumeFlow", RunOptions::default(), None)
        .await;
    std::env::remove_var(FAIL_MIDDLE_ENV);
    ensure!(origin_result.is_err(), "origin run should fail");

    // A failing run still gets its done stamp.
    ensure!(
        h.metadata.is_run_done("ResumeFlow", &origin_id).await?,
        "failed origin run missing done stamp"
    );
    let origin_middle = Pathspec::new("ResumeFlow", &origin_id, "middle", "2");
    let blobs = h.datastore.load_artifacts(&origin_middle).await?;
    let arts = blobs_to_artifacts(&blobs)?;
    ensure!(arts.get(ART_TASK_OK) == Some(&json!(false)), "_task_ok should be false");
    ensure!(arts.contains_key(ART_EXCEPTION), "no _exception artifact");

    let options = RunOptions {
        origin_run_id: Some(origin_id.clone()),
        ..Default::default()
    };
    let (new_id, result) = h
        .run(registry, "ResumeFlow", options, Some("middle"))
        .await;
    result.context("resume failed")?;

    let client = h.client();
    let run = client.flow("ResumeFlow").run(&new_id).await?;
    ensure!(run.successful().await?, "resumed run not successful");

    // start was cloned: original metadata plus resume markers.
    let start_task = run.step("start").task().await?;
    let meta = start_task.metadata_dict().await?;
    ensure!(
        meta.get(META_ORIGIN_RUN_ID) == Some(&origin_id),
        "origin-run-id marker missing"
    );
    ensure!(meta.contains_key(META_ORIGIN_TASK_ID), "origin-task-id marker missing");
    ensure!(meta.contains_key(META_ATTEMPT), "cloned metadata not copied");
    ensure!(
        start_task.origin_pathspec().await?
            == Some(format!("ResumeFlow/{origin_id}/start/1")),
        "origin pathspec wrong"
    );

    // middle re-executed and succeeded; end ran fresh.
    let middle = run.step("middle").task().await?;
    ensure!(middle.successful().await?);
    ensure!(middle.data().await?.get("doubled") == Some(&json!(14)));
    ensure!(run.step("end").task().await?.successful().await?);

    // Task ids in the new run are disjoint from the origin's.
    let mut origin_ids = std::collections::BTreeSet::new();
    for step in ["start", "middle", "end"] {
        for id in h.metadata.get_task_ids("ResumeFlow", &origin_id, step).await? {
            origin_ids.insert(id);
        }
    }
    for step in ["start", "middle", "end"] {
        for id in h.metadata.get_task_ids("ResumeFlow", &new_id, step).await? {
            ensure!(!origin_ids.contains(&id), "task id {id} reused from origin");
        }
    }
    Ok(())
}

/// SIGSEGV in user code: the orchestrator survives, @catch converts the
/// kill into a handled failure, and the stderr log names the fault.
async fn signal_kill_under_catch(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "SegvFlow", RunOptions::default(), None)
        .await;
    result.context("catch should suppress the signal kill")?;

    let client = h.client();
    let run = client.flow("SegvFlow").run(&run_id).await?;
    ensure!(run.finished().await?);

    let task = run.step("start").task().await?;
    ensure!(task.successful().await?, "_task_ok should be true under catch");

    let data = task.data().await?;
    let err = data.get("err").context("no err artifact")?;
    ensure!(
        err.get("type") == Some(&json!("FailureHandledByCatch")),
        "err.type wrong: {err}"
    );

    let stderr = task.stderr().await?;
    ensure!(
        stderr.contains("segmentation fault"),
        "stderr does not mention the fault: {stderr:?}"
    );
    Ok(())
}

/// Recursive switch: three iterations of the same step, one exit path.
async fn recursive_switch(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "SpinFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    ensure!(h.task_count("SpinFlow", &run_id, "spin").await? == 3);
    ensure!(h.task_count("SpinFlow", &run_id, "done").await? == 1);
    ensure!(h.task_count("SpinFlow", &run_id, "end").await? == 1);

    let client = h.client();
    let run = client.flow("SpinFlow").run(&run_id).await?;
    let data = run.data().await?.context("no end data")?;
    ensure!(data.get("n") == Some(&json!(3)), "n wrong: {data:?}");
    Ok(())
}

/// Resume across a recursive switch: successful iterations clone one by
/// one, execution picks up at the first failure.
async fn recursive_switch_resume(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;

    std::env::set_var(FAIL_SPIN_AT_ENV, "2");
    let (origin_id, origin_result) = h
        .run(registry, "SpinResumeFlow", RunOptions::default(), None)
        .await;
    std::env::remove_var(FAIL_SPIN_AT_ENV);
    ensure!(origin_result.is_err(), "origin run should fail at iteration 2");
    // Iteration 1 succeeded, iteration 2 failed.
    ensure!(h.task_count("SpinResumeFlow", &origin_id, "spin").await? == 2);

    let options = RunOptions {
        origin_run_id: Some(origin_id.clone()),
        ..Default::default()
    };
    let (new_id, result) = h
        .run(registry, "SpinResumeFlow", options, Some("spin"))
        .await;
    result.context("resume failed")?;

    // One cloned + two fresh iterations.
    ensure!(h.task_count("SpinResumeFlow", &new_id, "spin").await? == 3);

    let client = h.client();
    let run = client.flow("SpinResumeFlow").run(&new_id).await?;
    let spin_tasks = run.step("spin").tasks().await?;
    let first_meta = spin_tasks[0].metadata_dict().await?;
    ensure!(
        first_meta.get(META_ORIGIN_RUN_ID) == Some(&origin_id),
        "first iteration not cloned from origin"
    );
    let data = run.data().await?.context("no end data")?;
    ensure!(data.get("n") == Some(&json!(3)), "n wrong after resume: {data:?}");
    Ok(())
}

/// Nested foreach: one frame per level, scope-isolated joins.
async fn nested_foreach(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "NestedFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    ensure!(h.task_count("NestedFlow", &run_id, "mid").await? == 2);
    ensure!(h.task_count("NestedFlow", &run_id, "leaf").await? == 3);
    ensure!(h.task_count("NestedFlow", &run_id, "inner_join").await? == 2);
    ensure!(h.task_count("NestedFlow", &run_id, "outer_join").await? == 1);

    let client = h.client();
    let run = client.flow("NestedFlow").run(&run_id).await?;
    let data = run.data().await?.context("no end data")?;
    ensure!(
        data.get("all_vs") == Some(&json!([10, 20, 30])),
        "all_vs wrong: {data:?}"
    );

    // Leaf metadata encodes both enclosing frames, outermost first.
    let leaf = run.step("leaf").tasks().await?.remove(0);
    let meta = leaf.metadata_dict().await?;
    let frames: Vec<(String, String, usize)> =
        serde_json::from_str(meta.get(META_FOREACH_INDICES).context("no frames")?)?;
    ensure!(frames.len() == 2);
    ensure!(frames[0].0 == "start" && frames[1].0 == "mid");
    Ok(())
}

/// Empty foreach: the split runs, no inner tasks, the join sees zero
/// inputs.
async fn empty_foreach(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "EmptyFanFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    ensure!(h.task_count("EmptyFanFlow", &run_id, "start").await? == 1);
    ensure!(h.task_count("EmptyFanFlow", &run_id, "worker").await? == 0);
    ensure!(h.task_count("EmptyFanFlow", &run_id, "collect").await? == 1);

    let client = h.client();
    let run = client.flow("EmptyFanFlow").run(&run_id).await?;
    let data = run.data().await?.context("no end data")?;
    ensure!(data.get("n_inputs") == Some(&json!(0)), "join saw inputs: {data:?}");
    Ok(())
}

/// Parallel group: one control plus two workers, identical parents.
async fn parallel_group(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "ParallelFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    ensure!(h.task_count("ParallelFlow", &run_id, "train").await? == 3);

    let client = h.client();
    let run = client.flow("ParallelFlow").run(&run_id).await?;
    let data = run.data().await?.context("no end data")?;
    ensure!(data.get("ranks") == Some(&json!([0, 1, 2])), "ranks wrong: {data:?}");

    let controls = run.step("train").control_tasks().await?;
    ensure!(controls.len() == 1, "expected exactly one control task");
    let meta = controls[0].metadata_dict().await?;
    ensure!(meta.get(META_INTERNAL_TASK_TYPE).map(|s| s.as_str()) == Some("control"));
    ensure!(meta.get(META_PARALLEL_NUM_NODES).map(|s| s.as_str()) == Some("3"));
    Ok(())
}

/// Unbounded foreach: frames carry no size; a synthetic control task is
/// materialised after the join.
async fn unbounded_foreach(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "UnboundedFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    // Two real workers plus the synthetic control task.
    ensure!(h.task_count("UnboundedFlow", &run_id, "worker").await? == 3);

    let client = h.client();
    let run = client.flow("UnboundedFlow").run(&run_id).await?;
    let data = run.data().await?.context("no end data")?;
    // The join ran before the control task existed.
    ensure!(data.get("n_inputs") == Some(&json!(2)), "join input count: {data:?}");

    let controls = run.step("worker").control_tasks().await?;
    ensure!(controls.len() == 1, "expected one synthetic control task");
    let meta = controls[0].metadata_dict().await?;
    ensure!(meta.get(META_INTERNAL_TASK_TYPE).map(|s| s.as_str()) == Some("control"));
    Ok(())
}

/// Timeout: the body is abandoned at the budget and @catch records a
/// timeout wrapper.
async fn timeout_under_catch(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "TimeoutFlow", RunOptions::default(), None)
        .await;
    result.context("catch should suppress the timeout")?;

    let client = h.client();
    let run = client.flow("TimeoutFlow").run(&run_id).await?;
    let task = run.step("start").task().await?;
    ensure!(task.successful().await?);
    let data = task.data().await?;
    let err = data.get("err").context("no err artifact")?;
    ensure!(
        err.get("type") == Some(&json!("TimeoutException")),
        "err.type wrong: {err}"
    );
    Ok(())
}

/// The programmatic runner: a whole run in a subprocess of this binary,
/// polled to completion, with the run id collected from the id file.
async fn runner_launch() -> anyhow::Result<()> {
    use metaflow_lite_core::runner::{RunState, Runner};

    let dir = tempfile::tempdir()?;
    let root = dir.path().to_string_lossy().to_string();
    let datastore_cfg = DatastoreConfig::Local { root: root.clone() };
    let metadata_cfg = MetadataConfig::Local { root };

    let mut executing = Runner::new("HelloFlow")?
        .datastore(datastore_cfg.clone())
        .metadata(metadata_cfg.clone())
        .tag("launched:runner")
        .run()
        .await?;

    let state = executing.wait().await?;
    ensure!(
        state == RunState::Successful,
        "runner subprocess failed: {}",
        executing.stderr().await
    );
    let run_id = executing.run_id().await.context("no run id written")?;

    let client = MetaflowClient::new(datastore_cfg.build()?, metadata_cfg.build()?)
        .with_namespace(None);
    let run = client.flow("HelloFlow").run(&run_id).await?;
    ensure!(run.successful().await?, "run not successful via client");
    ensure!(run.user_tags().await?.contains("launched:runner"));
    Ok(())
}

/// Cards: rendered after the step, persisted with an 8-hex hash sidecar.
async fn card_rendering(registry: &FlowRegistry) -> anyhow::Result<()> {
    let h = Harness::new()?;
    let (run_id, result) = h
        .run(registry, "CardFlow", RunOptions::default(), None)
        .await;
    result.context("run failed")?;

    let start_id = h
        .metadata
        .get_task_ids("CardFlow", &run_id, "start")
        .await?
        .remove(0);
    let ps = Pathspec::new("CardFlow", &run_id, "start", &start_id);
    let cards = h.datastore.list_cards(&ps).await?;
    ensure!(cards.len() == 1, "expected one card");
    let (html, meta) = h.datastore.load_card(&ps, 0).await?.context("card missing")?;
    ensure!(html.contains("loss: 0.25"), "card html wrong: {html}");
    ensure!(meta.hash.len() == 8, "hash not 8 hex digits");
    ensure!(meta.card_type == "default");
    Ok(())
}
