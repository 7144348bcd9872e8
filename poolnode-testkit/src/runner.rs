use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use poolnode::{JobContext, JobId, JobRunner, NodeRuntime, RunnerConfig, RunnerMeta};

/// What a [`ScriptedRunner`] does with each job.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Returns the data of the job's first input.
    Echo,
    /// Sleeps, then returns `"done"`.
    Sleep(Duration),
    /// Fails in `run` with the message.
    Fail(String),
    /// Fails in `pre_run` with the message.
    FailPreRun(String),
    Panic,
}

/// Start and end of one `run` call.
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub job_id: JobId,
    pub started: Instant,
    pub finished: Instant,
}

impl RunRecord {
    pub fn overlaps(&self, other: &RunRecord) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// Runner with scripted behavior and counters for every hook.
pub struct ScriptedRunner {
    config: RunnerConfig,
    behavior: Behavior,
    accepting: AtomicBool,
    init_failures: AtomicUsize,
    init_calls: AtomicUsize,
    tick_calls: AtomicUsize,
    post_run_calls: AtomicUsize,
    runs: Mutex<Vec<RunRecord>>,
}

impl ScriptedRunner {
    pub fn new(name: impl Into<String>, kind: u32, behavior: Behavior) -> Self {
        let meta = RunnerMeta {
            kind,
            name: name.into(),
            ..Default::default()
        };
        Self {
            config: RunnerConfig::new(meta).with_template(format!("{{\"kind\":{kind}}}")),
            behavior,
            accepting: AtomicBool::new(true),
            init_failures: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
            tick_calls: AtomicUsize::new(0),
            post_run_calls: AtomicUsize::new(0),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, 5003, Behavior::Echo)
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.config.parallel = true;
        self
    }

    /// Makes `can_run` decline every job.
    pub fn declining(self) -> Self {
        self.accepting.store(false, Ordering::SeqCst);
        self
    }

    /// The first `attempts` calls of `init` fail.
    pub fn failing_init(self, attempts: usize) -> Self {
        self.init_failures.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn init_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn tick_count(&self) -> usize {
        self.tick_calls.load(Ordering::SeqCst)
    }

    pub fn post_run_count(&self) -> usize {
        self.post_run_calls.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().clone()
    }

    fn record(&self, job_id: &JobId, started: Instant) {
        self.runs.lock().push(RunRecord {
            job_id: job_id.clone(),
            started,
            finished: Instant::now(),
        });
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    fn config(&self) -> &RunnerConfig {
        &self.config
    }

    async fn init(&self, _node: &NodeRuntime) -> anyhow::Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .init_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("init failed");
        }
        Ok(())
    }

    async fn tick(&self, _node: &NodeRuntime) -> anyhow::Result<()> {
        self.tick_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn can_run(&self, _ctx: &JobContext) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    async fn pre_run(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        if let Behavior::FailPreRun(message) = &self.behavior {
            anyhow::bail!("{message}");
        }
        Ok(())
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<String> {
        let started = Instant::now();
        ctx.logger().info(format!("running {}", ctx.job_id()));
        let outcome = match &self.behavior {
            Behavior::Echo => Ok(ctx
                .input(None)
                .map(|input| input.data.clone())
                .unwrap_or_default()),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok("done".to_string())
            }
            Behavior::Fail(message) => Err(anyhow::anyhow!("{message}")),
            Behavior::FailPreRun(_) => Ok(String::new()),
            Behavior::Panic => panic!("scripted panic"),
        };
        self.record(ctx.job_id(), started);
        outcome
    }

    async fn post_run(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        self.post_run_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
