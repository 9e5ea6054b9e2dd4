//! Integration tests for fan-out/fan-in coordination.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobtrack::engine::{Context, Engine};
use jobtrack::error::{Error, Result};
use jobtrack::job::{Dispatcher, Job, JobConfig, Registry};
use jobtrack::kv::memory::MemoryKv;
use jobtrack::model::{JobId, Status};
use jobtrack::store::StatusStore;
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestDispatcher {
    enqueued: Mutex<Vec<(String, JobId)>>,
}

impl TestDispatcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            enqueued: Mutex::new(Vec::new()),
        })
    }

    fn drain(&self) -> Vec<(String, JobId)> {
        std::mem::take(&mut self.enqueued.lock().unwrap())
    }
}

#[async_trait]
impl Dispatcher for TestDispatcher {
    async fn enqueue(
        &self,
        name: &str,
        uuid: &JobId,
        _options: &Map<String, Value>,
    ) -> Result<bool> {
        self.enqueued
            .lock()
            .unwrap()
            .push((name.to_string(), *uuid));
        Ok(true)
    }

    async fn dequeue(&self, _name: &str, _uuid: &JobId) -> Result<()> {
        Ok(())
    }
}

fn test_store() -> Arc<StatusStore> {
    Arc::new(StatusStore::new(
        Arc::new(MemoryKv::new()),
        Duration::from_secs(60),
    ))
}

/// Fans out `children` trivial children, counting hook invocations.
struct BatchJob {
    children: u64,
    child_bodies: AtomicUsize,
    successes: AtomicUsize,
    killed: AtomicUsize,
}

impl BatchJob {
    fn new(children: u64) -> Arc<Self> {
        Arc::new(Self {
            children,
            child_bodies: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Job for BatchJob {
    async fn perform(&self, ctx: &Context) -> Result<()> {
        ctx.init_parent(self.children).await?;
        for i in 0..self.children {
            let mut options = Map::new();
            options.insert("index".to_string(), json!(i));
            ctx.enqueue_child(options).await?;
        }
        Ok(())
    }

    async fn perform_child(&self, ctx: &Context) -> Result<()> {
        self.child_bodies.fetch_add(1, Ordering::SeqCst);
        ctx.tick("child working").await?;
        Ok(())
    }

    async fn on_success(&self, _ctx: &Context) -> Result<()> {
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_killed(&self, _ctx: &Context) {
        self.killed.fetch_add(1, Ordering::SeqCst);
    }
}

fn batch_engine(job: Arc<BatchJob>, dispatcher: Arc<TestDispatcher>) -> Engine {
    let mut registry = Registry::new();
    registry.register("batch", job, JobConfig::default());
    Engine::new(test_store(), Arc::new(registry), dispatcher)
}

// ---------------------------------------------------------------------------
// Fan-out, fan-in
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parent_stays_working_until_last_child() {
    let job = BatchJob::new(2);
    let dispatcher = TestDispatcher::new();
    let engine = batch_engine(job.clone(), dispatcher.clone());

    let parent = engine.enqueue("batch", Map::new()).await.unwrap().unwrap();
    dispatcher.drain();
    engine.run("batch", &parent).await.unwrap();

    // Parent body returned, but completion belongs to the children
    let record = engine.store().fetch(&parent).await.unwrap();
    assert_eq!(record.status, Status::Working);
    assert_eq!(record.total, Some(2));
    assert_eq!(record.num, Some(0));

    let children = dispatcher.drain();
    assert_eq!(children.len(), 2);

    engine.run("batch", &children[0].1).await.unwrap();
    let record = engine.store().fetch(&parent).await.unwrap();
    assert_eq!(record.status, Status::Working);
    assert_eq!(record.num, Some(1));

    engine.run("batch", &children[1].1).await.unwrap();
    let record = engine.store().fetch(&parent).await.unwrap();
    assert_eq!(record.status, Status::Completed);
    assert_eq!(record.num, Some(2));
    assert_eq!(record.pct_complete(), 100);
    assert_eq!(job.successes.load(Ordering::SeqCst), 1);

    // Successful children leave no records behind
    for (_, child) in &children {
        assert!(engine.store().get(child).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn children_carry_parent_reference() {
    let job = BatchJob::new(1);
    let dispatcher = TestDispatcher::new();
    let engine = batch_engine(job, dispatcher.clone());

    let parent = engine.enqueue("batch", Map::new()).await.unwrap().unwrap();
    dispatcher.drain();
    engine.run("batch", &parent).await.unwrap();

    let children = dispatcher.drain();
    let child = engine.store().fetch(&children[0].1).await.unwrap();
    assert_eq!(child.parent_uuid, Some(parent));
    assert_eq!(
        child.options.get("parent_uuid"),
        Some(&json!(parent.to_string()))
    );
}

#[tokio::test]
async fn enqueue_child_requires_initialized_parent() {
    let dispatcher = TestDispatcher::new();
    let engine = batch_engine(BatchJob::new(0), dispatcher);

    let parent = engine.store().generate_uuid();
    engine
        .store()
        .create(&parent, "batch", Map::new(), None)
        .await
        .unwrap();

    let result = engine.fan().enqueue_child(&parent, Map::new()).await;
    assert!(matches!(result, Err(Error::FanNotInitialized(_))));
}

// ---------------------------------------------------------------------------
// Fan-in race
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_reports_finalize_exactly_once() {
    const N: u64 = 8;
    let job = BatchJob::new(N);
    let dispatcher = TestDispatcher::new();
    let engine = batch_engine(job.clone(), dispatcher.clone());

    let parent = engine.enqueue("batch", Map::new()).await.unwrap().unwrap();
    dispatcher.drain();
    engine.run("batch", &parent).await.unwrap();

    let children: Vec<JobId> = dispatcher.drain().into_iter().map(|(_, id)| id).collect();
    assert_eq!(children.len(), N as usize);

    let mut handles = Vec::new();
    for child in children {
        let fan = engine.fan().clone();
        handles.push(tokio::spawn(async move {
            fan.report_child_done(&parent, &child, true).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let record = engine.store().fetch(&parent).await.unwrap();
    assert_eq!(record.status, Status::Completed);
    assert_eq!(record.num, Some(N));
    assert_eq!(job.successes.load(Ordering::SeqCst), 1);
    assert_eq!(job.killed.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Child failure
// ---------------------------------------------------------------------------

/// Children fail when their options say so.
struct MixedJob {
    successes: AtomicUsize,
}

#[async_trait]
impl Job for MixedJob {
    async fn perform(&self, ctx: &Context) -> Result<()> {
        ctx.init_parent(2).await?;
        for fail in [true, false] {
            let mut options = Map::new();
            options.insert("fail".to_string(), json!(fail));
            ctx.enqueue_child(options).await?;
        }
        Ok(())
    }

    async fn perform_child(&self, ctx: &Context) -> Result<()> {
        if ctx.options().get("fail") == Some(&json!(true)) {
            return Err(Error::Execution("child exploded".to_string()));
        }
        Ok(())
    }

    async fn on_success(&self, _ctx: &Context) -> Result<()> {
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn failed_child_is_retained_and_not_counted() {
    let job = Arc::new(MixedJob {
        successes: AtomicUsize::new(0),
    });
    let dispatcher = TestDispatcher::new();
    let mut registry = Registry::new();
    registry.register("mixed", job.clone(), JobConfig::default());
    let engine = Engine::new(test_store(), Arc::new(registry), dispatcher.clone());

    let parent = engine.enqueue("mixed", Map::new()).await.unwrap().unwrap();
    dispatcher.drain();
    engine.run("mixed", &parent).await.unwrap();
    let children = dispatcher.drain();

    // First child fails; its ceiling is zero so the failure stands
    let mut failing = None;
    let mut succeeding = None;
    for (_, id) in &children {
        let record = engine.store().fetch(id).await.unwrap();
        if record.options.get("fail") == Some(&json!(true)) {
            failing = Some(*id);
        } else {
            succeeding = Some(*id);
        }
    }
    let failing = failing.unwrap();
    let succeeding = succeeding.unwrap();

    let result = engine.run("mixed", &failing).await;
    assert!(result.is_err());

    let parent_record = engine.store().fetch(&parent).await.unwrap();
    assert_eq!(parent_record.status, Status::Working);
    assert_eq!(parent_record.num, Some(0));
    let failed_record = engine.store().fetch(&failing).await.unwrap();
    assert_eq!(failed_record.status, Status::Failed);

    // Second child succeeds; one of two reported, parent still working
    engine.run("mixed", &succeeding).await.unwrap();
    let parent_record = engine.store().fetch(&parent).await.unwrap();
    assert_eq!(parent_record.status, Status::Working);
    assert_eq!(parent_record.num, Some(1));
    assert_eq!(job.successes.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Parent kill
// ---------------------------------------------------------------------------

#[tokio::test]
async fn killing_parent_skips_unstarted_children() {
    let job = BatchJob::new(2);
    let dispatcher = TestDispatcher::new();
    let engine = batch_engine(job.clone(), dispatcher.clone());

    let parent = engine.enqueue("batch", Map::new()).await.unwrap().unwrap();
    dispatcher.drain();
    engine.run("batch", &parent).await.unwrap();
    let children = dispatcher.drain();

    engine.store().kill(&parent).await.unwrap();

    for (_, child) in &children {
        engine.run("batch", child).await.unwrap();
    }

    let record = engine.store().fetch(&parent).await.unwrap();
    assert_eq!(record.status, Status::Killed);
    assert_eq!(job.killed.load(Ordering::SeqCst), 1);
    // Neither child body ran
    assert_eq!(job.child_bodies.load(Ordering::SeqCst), 0);
    // Skipped children are cleaned up like successful ones
    for (_, child) in &children {
        assert!(engine.store().get(child).await.unwrap().is_none());
    }
}

// ---------------------------------------------------------------------------
// Success hook failure during finalization
// ---------------------------------------------------------------------------

struct HookFailJob {
    hook_ran: AtomicBool,
}

#[async_trait]
impl Job for HookFailJob {
    async fn perform(&self, ctx: &Context) -> Result<()> {
        ctx.init_parent(1).await?;
        ctx.enqueue_child(Map::new()).await?;
        Ok(())
    }

    async fn perform_child(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn on_success(&self, _ctx: &Context) -> Result<()> {
        self.hook_ran.store(true, Ordering::SeqCst);
        Err(Error::Execution("hook exploded".to_string()))
    }
}

#[tokio::test]
async fn success_hook_failure_fails_parent_and_reraises() {
    let job = Arc::new(HookFailJob {
        hook_ran: AtomicBool::new(false),
    });
    let dispatcher = TestDispatcher::new();
    let mut registry = Registry::new();
    registry.register("hook-fail", job.clone(), JobConfig::default());
    let engine = Engine::new(test_store(), Arc::new(registry), dispatcher.clone());

    let parent = engine
        .enqueue("hook-fail", Map::new())
        .await
        .unwrap()
        .unwrap();
    dispatcher.drain();
    engine.run("hook-fail", &parent).await.unwrap();
    let children = dispatcher.drain();

    let result = engine.run("hook-fail", &children[0].1).await;
    assert!(matches!(result, Err(Error::Coordination(_))));
    assert!(job.hook_ran.load(Ordering::SeqCst));

    let record = engine.store().fetch(&parent).await.unwrap();
    assert_eq!(record.status, Status::Failed);
    assert!(record.message.contains("success hook failed"));
}
