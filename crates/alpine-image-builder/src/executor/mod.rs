use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::time::Instant;

use crate::config::{BuildConfig, ConfigDoc};
use crate::error::{Error, ErrorKind, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::mounts::MountSet;
use crate::planner::{CUSTOMIZE_BARRIER, Plan, Task};
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

pub const REQUIRES_MOUNTS: &str = "mounts:active";
pub const REQUIRES_ROOT: &str = "root:privileged";

#[derive(Default)]
struct SharedExecState {
    // Set by core.init; every later task resolves scratch paths through it.
    workspace_paths: Mutex<Option<WorkspacePaths>>,
    // The active mount set. Dropping the last ExecCtx clone releases it.
    mounts: Mutex<Option<MountSet>>,
    build_date: OnceLock<String>,
    // (staged, final) output pairs, moved into place only when the run succeeds.
    outputs: Mutex<Vec<(PathBuf, PathBuf)>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Prints events line by line and keeps a tail of each task's output so a
/// failing task can be written to an error log.
#[derive(Default)]
pub struct StdoutSink {
    error_logs_root: Option<PathBuf>,
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_log_paths: Vec<PathBuf>,
}

impl StdoutSink {
    /// Failed task logs go to `<dir>/<timestamp>/<task>.log`.
    pub fn with_error_logs(dir: impl Into<PathBuf>) -> Self {
        Self {
            error_logs_root: Some(dir.into()),
            state: Mutex::default(),
        }
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskStarted { id } => {
                s.started_at.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                s.log_lines += 1;
                let tail = s.task_logs.entry(id.clone()).or_default();
                if tail.len() >= MAX_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let tail = s.task_logs.remove(&id).unwrap_or_default();
                if ok {
                    s.tasks_ok += 1;
                    println!("DONE: {id} ({elapsed_ms}ms)");
                    return;
                }
                s.tasks_failed += 1;
                let error = error.unwrap_or_default();
                println!("FAIL: {id} ({elapsed_ms}ms) {error}");
                if let Some(root) = self.error_logs_root.as_deref() {
                    match write_task_error_log(root, &id, &error, elapsed_ms, &tail) {
                        Ok(path) => {
                            println!("ERROR_LOG: {id} => {}", path.display());
                            s.error_log_paths.push(path);
                        }
                        Err(e) => println!("WARN: failed to write error log for {id}: {e}"),
                    }
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!("  tasks: ok={} failed={}", s.tasks_ok, s.tasks_failed);
                println!("  logs: {}", s.log_lines);
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                for p in &s.error_log_paths {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

const MAX_TAIL_LINES: usize = 4000;

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    /// Workspace paths, creating the scratch dirs if core.init has not run yet
    /// (tests run single stages). Cleaning only happens in core.init.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }
        let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        ws.clean = false;
        let paths = crate::workspace::init_dirs(&ws)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    /// `YYYYMMDD`, fixed for the whole run.
    pub fn build_date(&self) -> String {
        self.shared
            .build_date
            .get_or_init(|| chrono::Local::now().format("%Y%m%d").to_string())
            .clone()
    }

    /// Pin the build date; returns false if it was already fixed.
    pub fn set_build_date(&self, date: impl Into<String>) -> bool {
        self.shared.build_date.set(date.into()).is_ok()
    }

    pub fn hold_mounts(&self, set: MountSet) -> Result<()> {
        let mut g = self
            .shared
            .mounts
            .lock()
            .map_err(|_| Error::msg("mount state lock poisoned"))?;
        match g.as_ref() {
            Some(existing) if existing.root() == set.root() => {
                // Same mounts; keep the first guard as the owner.
                set.disarm();
                return Ok(());
            }
            Some(existing) => {
                return Err(Error::precondition(format!(
                    "mounts for {} are still held",
                    existing.root().display()
                )));
            }
            None => *g = Some(set),
        }
        Ok(())
    }

    /// True when this context holds the mount set for `root`.
    pub fn mounts_active(&self, root: &Path) -> bool {
        self.shared
            .mounts
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|m| m.root() == root))
            .unwrap_or(false)
    }

    /// Release the held mount set, if any. Safe to call repeatedly.
    pub fn release_mounts(&self) -> Result<()> {
        let taken = self
            .shared
            .mounts
            .lock()
            .map_err(|_| Error::msg("mount state lock poisoned"))?
            .take();
        match taken {
            Some(set) => set.release(),
            None => Ok(()),
        }
    }

    /// Register `dest` as a run output. The caller writes to the returned
    /// staging path; [`execute_plan`] renames it to `dest` after every task
    /// succeeded and deletes it otherwise.
    pub fn stage_output(&self, dest: &Path) -> Result<PathBuf> {
        let Some(name) = dest.file_name() else {
            return Err(Error::msg(format!(
                "output path {} has no file name",
                dest.display()
            )));
        };
        let staged = dest.with_file_name(format!(".{}.partial", name.to_string_lossy()));
        self.take_or_push_outputs(Some((staged.clone(), dest.to_path_buf())))?;
        Ok(staged)
    }

    /// Move every staged output into place, in staging order.
    pub fn publish_outputs(&self) -> Result<Vec<PathBuf>> {
        let mut pending = self.take_or_push_outputs(None)?.into_iter();
        let mut published = Vec::new();
        while let Some((staged, dest)) = pending.next() {
            if let Err(e) = fs::rename(&staged, &dest) {
                remove_staged(std::iter::once((staged, dest.clone())).chain(pending));
                return Err(Error::packaging(format!(
                    "failed to publish {}: {e}",
                    dest.display()
                )));
            }
            published.push(dest);
        }
        Ok(published)
    }

    /// Delete staged outputs of a failed run.
    pub fn discard_outputs(&self) {
        match self.take_or_push_outputs(None) {
            Ok(pending) => remove_staged(pending),
            Err(e) => tracing::warn!(error = %e, "cannot discard staged outputs"),
        }
    }

    fn take_or_push_outputs(
        &self,
        entry: Option<(PathBuf, PathBuf)>,
    ) -> Result<Vec<(PathBuf, PathBuf)>> {
        let mut g = self
            .shared
            .outputs
            .lock()
            .map_err(|_| Error::msg("output state lock poisoned"))?;
        match entry {
            Some(e) => {
                g.push(e);
                Ok(Vec::new())
            }
            None => Ok(std::mem::take(&mut *g)),
        }
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Run a subprocess with its output streamed into the log. A non-zero exit
    /// becomes a [`ErrorKind::Privileged`] error.
    pub fn run_cmd(&self, cmd: Command) -> Result<()> {
        self.run_cmd_as(ErrorKind::Privileged, cmd)
    }

    pub fn run_cmd_as(&self, kind: ErrorKind, mut cmd: Command) -> Result<()> {
        let shown = describe_cmd(&cmd);
        if self.dry_run {
            self.log(&format!("DRY-RUN: {shown}"));
            return Ok(());
        }
        tracing::debug!(command = %shown, "spawning");

        // Own process group, so a ^C on the terminal reaches us first and the
        // child cannot read from the controlling TTY.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::new(kind, format!("failed to spawn {shown}: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::new(kind, format!("wait for {shown} failed: {e}")))?;
        if !status.success() {
            return Err(Error::new(kind, format!("{shown} failed: {status}")));
        }
        Ok(())
    }
}

fn describe_cmd(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        out.push(' ');
        out.push_str(&a.to_string_lossy());
    }
    out
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

fn is_privileged() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Check a task's declared preconditions against the current state.
pub fn check_requires(task: &Task, doc: &ConfigDoc, ctx: &ExecCtx) -> Result<()> {
    for req in &task.requires {
        match req.as_str() {
            REQUIRES_MOUNTS => {
                let cfg = BuildConfig::load(doc)?;
                if !ctx.mounts_active(cfg.root()) {
                    return Err(Error::precondition(format!(
                        "task '{}' requires active mounts under {}",
                        task.id,
                        cfg.root().display()
                    )));
                }
            }
            REQUIRES_ROOT => {
                if !ctx.dry_run && !is_privileged() {
                    return Err(Error::precondition(format!(
                        "task '{}' must run as root",
                        task.id
                    )));
                }
            }
            other => {
                return Err(Error::msg(format!(
                    "task '{}' declares unknown precondition '{other}'",
                    task.id
                )));
            }
        }
    }
    Ok(())
}

/// Run every task in plan order, stopping at the first failure. Held mounts
/// are released on the way out whatever the outcome.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let res = run_tasks(doc, plan, reg, ctx);
    let released = ctx.release_mounts();
    let res = match (res, released) {
        (Err(e), Err(release_err)) => {
            tracing::warn!(error = %release_err, "mount release after failure also failed");
            Err(e)
        }
        (Ok(()), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    };
    let res = match res {
        Ok(()) => ctx.publish_outputs().map(|published| {
            for p in published {
                tracing::info!(path = %p.display(), "published output");
            }
        }),
        Err(e) => {
            ctx.discard_outputs();
            Err(e)
        }
    };
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: res.is_ok(),
        error: res.as_ref().err().map(ToString::to_string),
    });
    res
}

fn run_tasks(doc: &ConfigDoc, plan: &Plan, reg: &TaskRegistry, ctx: &mut ExecCtx) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = check_requires(task, doc, ctx).and_then(|()| exec(doc, ctx));
        let elapsed_ms = start.elapsed().as_millis();
        ctx.sink.emit(ExecEvent::TaskFinished {
            id: task.id.clone(),
            ok: res.is_ok(),
            error: res.as_ref().err().map(ToString::to_string),
            elapsed_ms,
        });
        res.map_err(|e| e.context(format!("task '{}' failed", task.id)))?;
    }
    Ok(())
}

fn remove_staged(pending: impl IntoIterator<Item = (PathBuf, PathBuf)>) {
    for (staged, _) in pending {
        match fs::remove_file(&staged) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %staged.display(), error = %e, "failed to remove staged output"),
        }
    }
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", core_init)?;
    reg.add(CUSTOMIZE_BARRIER, core_barrier_customize)?;
    crate::modules::target::TargetModule::register_tasks(&mut reg)?;
    crate::modules::bootstrap::BootstrapModule::register_tasks(&mut reg)?;
    crate::modules::network::NetworkModule::register_tasks(&mut reg)?;
    crate::modules::mounts::MountsModule::register_tasks(&mut reg)?;
    crate::modules::customize::CustomizeModule::register_tasks(&mut reg)?;
    crate::modules::guest::GuestModule::register_tasks(&mut reg)?;
    crate::modules::package::PackageModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let cfg = BuildConfig::load(doc)?;
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();

    ctx.log(&format!("build.release = {}", cfg.release));
    ctx.log(&format!("build.apk_tools = {}", cfg.apk_tools));
    ctx.log(&format!("build.install_dir = {}", cfg.install_dir.display()));
    ctx.log(&format!("build.mirror = {}", cfg.mirror));
    ctx.log(&format!("build.image = {}", cfg.image));
    ctx.log(&format!("build.date = {}", ctx.build_date()));

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.log(&format!("workspace.scratch_dir = {}", paths.scratch_dir.display()));
    ctx.log(&format!("workspace.out_dir = {}", paths.out_dir.display()));
    ctx.set_workspace_paths(paths);
    Ok(())
}

fn core_barrier_customize(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    // Ordering only; the work happened in the customize stages.
    ctx.log("customization complete");
    Ok(())
}

// Split on '\n' only: carriage returns stay in the line so the sanitizer can
// collapse progress output to its final state.
fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || pending.len() >= MAX_PENDING_BYTES {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
                if b == b'\n' {
                    continue;
                }
            }
            pending.push(b);
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

fn write_task_error_log(
    root: &Path,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
    tail: &VecDeque<String>,
) -> Result<PathBuf> {
    let dir = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
    fs::create_dir_all(&dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = format!("task: {task_id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in tail {
        body.push_str(line);
        body.push('\n');
    }
    fs::write(&path, body)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl ExecSink for Collect {
        fn emit(&self, ev: ExecEvent) {
            if let ExecEvent::TaskLog { line, .. } = ev {
                self.0.lock().unwrap().push(line);
            }
        }
    }

    #[test]
    fn run_cmd_streams_output_and_reports_failure() {
        let sink = Arc::new(Collect::default());
        let ctx = ExecCtx::new(false, sink.clone());

        let mut ok = Command::new("sh");
        ok.args(["-c", "printf 'one\\ntwo\\r2b\\n'"]);
        ctx.run_cmd(ok).expect("sh ok");
        assert_eq!(*sink.0.lock().unwrap(), ["one", "2b"]);

        let mut bad = Command::new("sh");
        bad.args(["-c", "exit 3"]);
        let err = ctx.run_cmd_as(ErrorKind::Packaging, bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Packaging);
    }

    #[test]
    fn dry_run_logs_instead_of_spawning() {
        let sink = Arc::new(Collect::default());
        let ctx = ExecCtx::new(true, sink.clone());
        let mut cmd = Command::new("definitely-not-a-real-binary");
        cmd.arg("--flag");
        ctx.run_cmd(cmd).expect("dry run never spawns");
        assert_eq!(
            *sink.0.lock().unwrap(),
            ["DRY-RUN: definitely-not-a-real-binary --flag"]
        );
    }

    #[test]
    fn build_date_is_stable_once_read() {
        let ctx = ExecCtx::new(true, Arc::new(Collect::default()));
        assert!(ctx.set_build_date("20240102"));
        assert!(!ctx.set_build_date("20990101"));
        assert_eq!(ctx.build_date(), "20240102");
    }

    #[test]
    fn error_log_file_names_are_safe() {
        assert_eq!(sanitize_filename_component("customize.sshd"), "customize.sshd");
        assert_eq!(sanitize_filename_component("a/b c"), "a_b_c");
        assert_eq!(sanitize_filename_component(""), "task");
        assert_eq!(format_elapsed_hms(3725), "01:02:05");
    }

    fn write_staged_image(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let staged = ctx.stage_output(&ws.out_dir.join("image.tar.gz"))?;
        fs::write(&staged, b"image")?;
        Ok(())
    }

    fn fail_after_packaging(_: &ConfigDoc, _: &mut ExecCtx) -> Result<()> {
        Err(Error::privileged("umount failed"))
    }

    fn task(id: &str, after: &[&str]) -> Task {
        Task {
            id: id.into(),
            label: id.into(),
            module: "test".into(),
            phase: "test".into(),
            after: after.iter().map(|a| a.to_string()).collect(),
            provides: Vec::new(),
            requires: Vec::new(),
        }
    }

    fn staged_run(fail_last: bool) -> (tempfile::TempDir, Result<()>) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let doc = ConfigDoc::from_value(
            "<mem>",
            toml::from_str(&format!(
                "[workspace]\nroot_dir = \"{}\"\nout_dir = \"out\"\n",
                tmp.path().display()
            ))
            .expect("toml"),
        );
        let mut plan = Plan::default();
        let mut reg = TaskRegistry::default();
        plan.add(task("t.write", &[])).unwrap();
        reg.add("t.write", write_staged_image).unwrap();
        if fail_last {
            plan.add(task("t.fail", &["t.write"])).unwrap();
            reg.add("t.fail", fail_after_packaging).unwrap();
        }
        let mut ctx = ExecCtx::new(false, Arc::new(Collect::default()));
        let res = execute_plan(&doc, &plan, &reg, &mut ctx);
        (tmp, res)
    }

    #[test]
    fn outputs_appear_only_when_the_run_succeeds() {
        let (tmp, res) = staged_run(false);
        res.unwrap();
        let out = tmp.path().join("out");
        assert_eq!(fs::read(out.join("image.tar.gz")).unwrap(), b"image");
        assert!(!out.join(".image.tar.gz.partial").exists());

        let (tmp, res) = staged_run(true);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Privileged);
        let out = tmp.path().join("out");
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }
}
