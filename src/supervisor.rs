use std::{
    collections::HashSet,
    ffi::CString,
    net::TcpListener as StdTcpListener,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use rand::Rng;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};

use crate::{
    config::Config,
    control::{self, ControlTarget},
    controller::{Signal, SHUTDOWN_BROADCAST},
    dns::{self, Lookup},
    internal,
    listener::Listener,
    plugins,
    server::ServerState,
};

/// Entry point after the listening socket is bound and privileges are
/// dropped. `procs <= 1` is single-process mode: this process is its own
/// worker and additionally binds the control channel. Otherwise the
/// parent forks `procs` workers and stays behind to reap and respawn.
pub fn run(
    listener: StdTcpListener,
    config_path: PathBuf,
    config: Config,
    procs: u32,
) -> anyhow::Result<()> {
    if procs <= 1 {
        worker(listener, config_path, config, true)
    } else {
        prefork(listener, config_path, config, procs)
    }
}

/// Resolve `user` and give up root. Must run before any fork so workers
/// inherit the unprivileged identity.
pub fn drop_privileges(user: &str) -> anyhow::Result<()> {
    let name = CString::new(user).context("user name contains NUL")?;

    let passwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if passwd.is_null() {
        anyhow::bail!("unknown user {user:?}");
    }

    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };

    if unsafe { libc::setgid(gid) } != 0 {
        return Err(std::io::Error::last_os_error()).context("setgid failed");
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(std::io::Error::last_os_error()).context("setuid failed");
    }

    internal!(level = INFO, "running as {user} (uid {uid})");
    Ok(())
}

/// One worker process: a fresh current-thread runtime over the shared
/// listening socket. Runtimes never survive a fork, which is why this
/// builds its own.
fn worker(
    listener: StdTcpListener,
    config_path: PathBuf,
    config: Config,
    bind_control: bool,
) -> anyhow::Result<()> {
    // Touch the thread-local PRNG so forked siblings diverge instead of
    // replaying the parent's stream.
    let _: u64 = rand::thread_rng().gen();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("unable to build worker runtime")?;

    runtime.block_on(serve(listener, config_path, config, bind_control))
}

async fn serve(
    listener: StdTcpListener,
    config_path: PathBuf,
    config: Config,
    bind_control: bool,
) -> anyhow::Result<()> {
    listener
        .set_nonblocking(true)
        .context("unable to unblock listener")?;
    let listener = TcpListener::from_std(listener).context("unable to adopt listener")?;

    let resolver: Arc<dyn Lookup> = Arc::new(dns::Resolver::system());
    let registry = plugins::init(&config, Arc::clone(&resolver))?;
    let control_addr = config.control;
    let state = Arc::new(ServerState::new(config, registry));

    spawn_signal_tasks(&state, config_path.clone(), &resolver);
    tokio::spawn(shutdown_on_signal());

    if bind_control {
        let control_listener = TcpListener::bind(control_addr)
            .await
            .with_context(|| format!("unable to bind control channel {control_addr}"))?;

        let target: Arc<dyn ControlTarget> = Arc::new(WorkerControl {
            state: Arc::clone(&state),
            config_path,
            resolver,
        });

        tokio::spawn(async move {
            if let Err(err) = control::serve(control_listener, target).await {
                internal!(level = ERROR, "control channel: {err:#}");
            }
        });
    }

    Listener::new(listener, state).serve().await
}

/// Re-read the configuration and rebuild the plugin chain. Running
/// sessions keep the chain they started with.
pub fn reload(
    state: &ServerState,
    config_path: &Path,
    resolver: &Arc<dyn Lookup>,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let registry = plugins::init(&config, Arc::clone(resolver))?;
    state.install(config, registry);

    internal!(level = INFO, "configuration reloaded");
    Ok(())
}

/// SIGUSR1/SIGUSR2 toggle the pause gate (relayed by the prefork
/// parent); SIGHUP reloads in place.
fn spawn_signal_tasks(state: &Arc<ServerState>, config_path: PathBuf, resolver: &Arc<dyn Lookup>) {
    if let Ok(mut usr1) = signal(SignalKind::user_defined1()) {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                state.pause();
            }
        });
    }

    if let Ok(mut usr2) = signal(SignalKind::user_defined2()) {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            while usr2.recv().await.is_some() {
                state.resume();
            }
        });
    }

    if let Ok(mut hup) = signal(SignalKind::hangup()) {
        let state = Arc::clone(state);
        let resolver = Arc::clone(resolver);
        tokio::spawn(async move {
            while hup.recv().await.is_some() {
                if let Err(err) = reload(&state, &config_path, &resolver) {
                    internal!(level = ERROR, "reload failed: {err:#}");
                }
            }
        });
    }
}

async fn shutdown_on_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            internal!(level = ERROR, "unable to install SIGTERM handler: {err}");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }

    internal!(level = INFO, "shutdown signal received");
    let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
}

struct WorkerControl {
    state: Arc<ServerState>,
    config_path: PathBuf,
    resolver: Arc<dyn Lookup>,
}

impl ControlTarget for WorkerControl {
    fn pause(&self) {
        self.state.pause();
    }

    fn resume(&self) {
        self.state.resume();
    }

    fn status(&self) -> String {
        self.state.status_line()
    }

    fn reload(&self) -> anyhow::Result<()> {
        reload(&self.state, &self.config_path, &self.resolver)
    }
}

#[derive(Default)]
struct ChildTable {
    children: Mutex<HashSet<libc::pid_t>>,
    paused: AtomicBool,
}

impl ChildTable {
    fn add(&self, pid: libc::pid_t) {
        if let Ok(mut children) = self.children.lock() {
            children.insert(pid);
        }
    }

    fn remove(&self, pid: libc::pid_t) {
        if let Ok(mut children) = self.children.lock() {
            children.remove(&pid);
        }
    }

    fn len(&self) -> usize {
        self.children.lock().map_or(0, |children| children.len())
    }

    fn signal_all(&self, sig: libc::c_int) {
        if let Ok(children) = self.children.lock() {
            for pid in children.iter() {
                unsafe {
                    libc::kill(*pid, sig);
                }
            }
        }
    }
}

fn prefork(
    listener: StdTcpListener,
    config_path: PathBuf,
    config: Config,
    procs: u32,
) -> anyhow::Result<()> {
    let table = Arc::new(ChildTable::default());

    for _ in 0..procs {
        let pid = spawn_worker(&listener, &config_path, &config)?;
        table.add(pid);
    }

    internal!(level = INFO, "started {procs} workers");

    parent_loop(&listener, &config_path, &config, &table)
}

/// Fork one worker. The child runs its worker on a fresh thread so no
/// runtime or lock state inherited across the fork is touched, then
/// exits with the worker's status.
fn spawn_worker(
    listener: &StdTcpListener,
    config_path: &Path,
    config: &Config,
) -> anyhow::Result<libc::pid_t> {
    let inherited = listener.try_clone().context("unable to clone listener")?;
    let config_path = config_path.to_path_buf();
    let config = config.clone();

    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()).context("fork failed"),
        0 => {
            unsafe {
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                libc::signal(libc::SIGTERM, libc::SIG_DFL);
                libc::signal(libc::SIGCHLD, libc::SIG_DFL);
            }

            let joined = std::thread::spawn(move || worker(inherited, config_path, config, false))
                .join();

            let code = match joined {
                Ok(Ok(())) => 0,
                Ok(Err(err)) => {
                    eprintln!("worker failed: {err:#}");
                    1
                }
                Err(_) => 2,
            };

            std::process::exit(code);
        }
        pid => {
            internal!(level = INFO, "forked worker {pid}");
            Ok(pid)
        }
    }
}

/// The prefork parent: serves the control channel, reaps dead workers
/// (respawning exactly one replacement each), and on SIGINT/SIGTERM
/// broadcasts SIGINT to the pool and waits for it to drain.
fn parent_loop(
    listener: &StdTcpListener,
    config_path: &Path,
    config: &Config,
    table: &Arc<ChildTable>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("unable to build supervisor runtime")?;

    runtime.block_on(async {
        let control_listener = TcpListener::bind(config.control)
            .await
            .with_context(|| format!("unable to bind control channel {}", config.control))?;

        let target: Arc<dyn ControlTarget> = Arc::new(ParentControl {
            table: Arc::clone(table),
        });
        tokio::spawn(async move {
            if let Err(err) = control::serve(control_listener, target).await {
                internal!(level = ERROR, "control channel: {err:#}");
            }
        });

        let mut child = signal(SignalKind::child()).context("SIGCHLD handler")?;
        let mut term = signal(SignalKind::terminate()).context("SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = child.recv() => {
                    reap_and_respawn(listener, config_path, config, table);
                }
                _ = tokio::signal::ctrl_c() => break,
                _ = term.recv() => break,
            }
        }

        internal!(level = INFO, "stopping workers");
        table.signal_all(libc::SIGINT);

        // Collect the whole pool before exiting.
        loop {
            let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), 0) };
            if pid <= 0 {
                break;
            }
            table.remove(pid);
        }

        Ok(())
    })
}

fn reap_and_respawn(
    listener: &StdTcpListener,
    config_path: &Path,
    config: &Config,
    table: &Arc<ChildTable>,
) {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }

        internal!(level = WARN, "worker {pid} exited (status {status}), respawning");
        table.remove(pid);

        match spawn_worker(listener, config_path, config) {
            Ok(new_pid) => {
                table.add(new_pid);
                if table.paused.load(Ordering::SeqCst) {
                    unsafe {
                        libc::kill(new_pid, libc::SIGUSR1);
                    }
                }
            }
            Err(err) => internal!(level = ERROR, "respawn failed: {err:#}"),
        }
    }
}

struct ParentControl {
    table: Arc<ChildTable>,
}

impl ControlTarget for ParentControl {
    fn pause(&self) {
        self.table.paused.store(true, Ordering::SeqCst);
        self.table.signal_all(libc::SIGUSR1);
    }

    fn resume(&self) {
        self.table.paused.store(false, Ordering::SeqCst);
        self.table.signal_all(libc::SIGUSR2);
    }

    fn status(&self) -> String {
        format!(
            "workers={} paused={}",
            self.table.len(),
            self.table.paused.load(Ordering::SeqCst)
        )
    }

    fn reload(&self) -> anyhow::Result<()> {
        self.table.signal_all(libc::SIGHUP);
        Ok(())
    }
}
