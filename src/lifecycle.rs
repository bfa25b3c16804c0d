//! Component L: the singleton + lifecycle guard.
//!
//! Runs, in order: takeover of any other running instance, PID-lock
//! acquisition, the version gate (install a newer bundle from a mounted
//! update source and relaunch), the location gate (relaunch from the
//! canonical install path if not already running there), auto-start
//! registration, then starts R/T/E and a periodic rescan of the version
//! gate.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde_derive::Deserialize;
use tinytemplate::{format_unescaped, TinyTemplate};

use crate::config::{AutoStart, Config};
use crate::events::EventServer;
use crate::output::Status;
use crate::queue::{EventSink, OutgoingFiles, PendingUrls};
use crate::router::{ClipboardAdapter, NoopClipboardAdapter, NoopUploadNotifier, RouterServer};
use crate::tunnel::TunnelServer;
use crate::util;
use crate::vsock::{EndpointListener, VsockEndpointListener};

const TAKEOVER_GRACE: Duration = Duration::from_millis(300);
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);
const BUNDLE_METADATA_FILE: &str = "bundle.json";

const SYSTEMD_UNIT_TEMPLATE: &str = "\
[Unit]
Description=\\{app_id\\} guest integration daemon

[Service]
ExecStart=\\{binary_path\\}
Restart=on-failure
StandardOutput=append:\\{log_path\\}
StandardError=append:\\{log_path\\}

[Install]
WantedBy=default.target
";

/// Registers (or unregisters) the daemon with the OS's own launch/auto-start
/// services. The real OS integration is out of scope for this crate; tests
/// drive this trait directly.
pub trait LaunchRegistrar: Send + Sync {
    /// Write `contents` to `unit_path`, creating parent directories as needed.
    fn install(&self, unit_path: &Path, contents: &str) -> io::Result<()>;
    /// Remove the unit at `unit_path`, if present.
    fn uninstall(&self, unit_path: &Path) -> io::Result<()>;
}

/// Writes the unit file to disk and nothing else: this is exactly what a
/// systemd user-session auto-start registration requires, and is what
/// backs production use of this trait.
pub struct FileLaunchRegistrar;

impl LaunchRegistrar for FileLaunchRegistrar {
    fn install(&self, unit_path: &Path, contents: &str) -> io::Result<()> {
        if let Some(parent) = unit_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(unit_path, contents)
    }

    fn uninstall(&self, unit_path: &Path) -> io::Result<()> {
        match fs::remove_file(unit_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
struct BundleMetadata {
    build: u64,
    version: String,
}

fn read_metadata(dir: &Path) -> Option<BundleMetadata> {
    let text = fs::read_to_string(dir.join(BUNDLE_METADATA_FILE)).ok()?;
    serde_json::from_str(&text).ok()
}

fn semver_parts(v: &str) -> Vec<u64> {
    v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
}

/// Higher build number wins; ties fall back to comparing each dot-separated
/// version segment as an integer. Nothing beyond that tiebreak is defined.
fn is_newer(candidate: &BundleMetadata, installed: &BundleMetadata) -> bool {
    match candidate.build.cmp(&installed.build) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => semver_parts(&candidate.version) > semver_parts(&installed.version),
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &dest_path)?;
        } else {
            fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

/// One candidate: which configured update source had newer metadata than
/// what's currently installed.
struct UpdateCandidate {
    source_name: String,
    source_path: PathBuf,
}

/// Check update sources in priority order and return the first one newer
/// than the installed bundle, if any.
fn find_newer_source(config: &Config) -> Option<UpdateCandidate> {
    let installed = read_metadata(&config.install_path).unwrap_or(BundleMetadata {
        build: 0,
        version: "0.0.0".to_string(),
    });

    for source in &config.update_sources {
        let Some(candidate) = read_metadata(&source.path) else {
            continue;
        };
        if is_newer(&candidate, &installed) {
            return Some(UpdateCandidate {
                source_name: source.name.clone(),
                source_path: source.path.clone(),
            });
        }
    }
    None
}

fn binary_path(install_path: &Path, app_id: &str) -> PathBuf {
    install_path.join(app_id)
}

fn apply_update(config: &Config, candidate: &UpdateCandidate, registrar: &dyn LaunchRegistrar) -> Result<()> {
    info!(
        "installing newer bundle from update source '{}'",
        candidate.source_name
    );
    copy_dir_all(&candidate.source_path, &config.install_path)
        .with_context(|| format!("failed to install bundle to {:?}", config.install_path))?;

    register_auto_start(config, registrar)
        .context("failed to re-register auto-start after bundle update")?;

    Ok(())
}

fn systemd_unit_path(app_id: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("systemd/user").join(format!("{app_id}.service")))
}

#[derive(serde_derive::Serialize)]
struct UnitContext {
    app_id: String,
    binary_path: String,
    log_path: String,
}

fn render_unit(config: &Config) -> Result<String> {
    let mut tt = TinyTemplate::new();
    tt.set_default_formatter(&format_unescaped);
    // There should never be a runtime error compiling this template; any
    // errors here are trivial bugs.
    tt.add_template("unit", SYSTEMD_UNIT_TEMPLATE).unwrap();

    let log_dir = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir).join(&config.app_id);
    let context = UnitContext {
        app_id: config.app_id.clone(),
        binary_path: binary_path(&config.install_path, &config.app_id)
            .to_string_lossy()
            .to_string(),
        log_path: log_dir.join(format!("{}.log", config.app_id)).to_string_lossy().to_string(),
    };

    // Same as above: only trivial bugs are possible here.
    Ok(tt.render("unit", &context).unwrap())
}

/// Apply the tri-state auto-start preference: `Enabled` installs the unit,
/// `Disabled` uninstalls it, `Unset` leaves whatever is registered alone.
fn register_auto_start(config: &Config, registrar: &dyn LaunchRegistrar) -> Result<()> {
    let Some(unit_path) = systemd_unit_path(&config.app_id) else {
        return Ok(());
    };

    match config.auto_start {
        AutoStart::Enabled => {
            let contents = render_unit(config)?;
            registrar.install(&unit_path, &contents)?;
        }
        AutoStart::Disabled => {
            registrar.uninstall(&unit_path)?;
        }
        AutoStart::Unset => {}
    }
    Ok(())
}

/// A PID lock file, released when dropped.
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    fn path_for(app_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{app_id}.pid"))
    }

    fn live_holder(path: &Path) -> io::Result<Option<i32>> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let pid: i32 = contents.trim().parse().unwrap_or(0);
                if pid > 0 && util::is_alive(pid) {
                    Ok(Some(pid))
                } else {
                    Ok(None)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_self(path: &Path) -> io::Result<()> {
        use std::io::Write as _;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{}", std::process::id())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Acquire the lock for `app_id`, retrying once after a short delay if
    /// another live process currently holds it. Returns `None` if the lock
    /// is still held after the retry — the caller should exit 0.
    pub fn acquire(app_id: &str) -> io::Result<Option<Self>> {
        let path = Self::path_for(app_id);
        for attempt in 0..2 {
            match Self::live_holder(&path)? {
                Some(_) if attempt == 0 => thread::sleep(LOCK_RETRY_DELAY),
                Some(_) => return Ok(None),
                None => {
                    Self::write_self(&path)?;
                    return Ok(Some(Self { path }));
                }
            }
        }
        Ok(None)
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Signal every other running instance of `executable_name` to terminate,
/// then wait out the grace period.
fn takeover(executable_name: &str) {
    let self_pid = std::process::id() as i32;
    let Ok(entries) = fs::read_dir("/proc") else {
        return;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid == self_pid {
            continue;
        }
        if let Ok(comm) = fs::read_to_string(entry.path().join("comm")) {
            if comm.trim() == executable_name {
                util::terminate(pid);
            }
        }
    }
    thread::sleep(TAKEOVER_GRACE);
}

fn current_executable_name() -> Result<String> {
    let exe = std::env::current_exe().context("could not determine current executable")?;
    Ok(exe
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default())
}

fn running_from_canonical_path(config: &Config) -> Result<bool> {
    let current = std::env::current_exe().context("could not determine current executable")?;
    Ok(current == binary_path(&config.install_path, &config.app_id))
}

fn relaunch_and_exit(config: &Config) -> Result<()> {
    let target = binary_path(&config.install_path, &config.app_id);
    info!("relaunching from canonical install path: {target:?}");
    Command::new(&target)
        .spawn()
        .with_context(|| format!("failed to relaunch {target:?}"))?;
    std::process::exit(0);
}

/// Owns the three running servers and their background listener threads.
pub struct ServerSupervisor {
    router: Arc<RouterServer>,
    tunnel: Arc<TunnelServer>,
    events: Arc<EventServer>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl ServerSupervisor {
    /// Bind and start R, T, and E. A bind failure for any one server is
    /// reported on `status_tx` and does not prevent the others from
    /// starting.
    pub fn start(
        config: &Config,
        clipboard: Arc<dyn ClipboardAdapter>,
        downloads_dir: PathBuf,
        status_tx: Sender<Status>,
    ) -> (Self, Arc<dyn EventSink>) {
        let (event_server, pusher) = EventServer::new();
        let event_server = Arc::new(event_server);
        let pusher: Arc<dyn EventSink> = Arc::new(pusher);

        let files = Arc::new(OutgoingFiles::new(Arc::clone(&pusher)));
        let urls = Arc::new(PendingUrls::new(Arc::clone(&pusher)));

        let router = Arc::new(RouterServer::new(
            downloads_dir,
            clipboard,
            Arc::new(NoopUploadNotifier),
            files,
            urls,
        ));
        let tunnel = Arc::new(TunnelServer::new());

        let mut handles = Vec::new();

        handles.push(spawn_server(
            "router",
            config.ports.router,
            status_tx.clone(),
            {
                let router = Arc::clone(&router);
                move |listener| router.serve(listener)
            },
        ));
        handles.push(spawn_server(
            "tunnel",
            config.ports.tunnel,
            status_tx.clone(),
            {
                let tunnel = Arc::clone(&tunnel);
                move |listener| tunnel.serve(listener)
            },
        ));
        handles.push(spawn_server(
            "events",
            config.ports.events,
            status_tx,
            {
                let events = Arc::clone(&event_server);
                move |listener| events.serve(listener)
            },
        ));

        (
            Self {
                router,
                tunnel,
                events: event_server,
                handles,
            },
            pusher,
        )
    }

    /// Stop all three servers.
    pub fn shutdown(&self) {
        self.router.shutdown();
        self.tunnel.shutdown();
        self.events.shutdown();
    }

    /// Block until all three server threads have exited.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn spawn_server(
    name: &'static str,
    port: u32,
    status_tx: Sender<Status>,
    run: impl FnOnce(Box<dyn EndpointListener>) + Send + 'static,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let _ = status_tx.send(Status::ServerStarting(name));
        match VsockEndpointListener::bind(port) {
            Ok(listener) => {
                let _ = status_tx.send(Status::ServerUp(name));
                run(Box::new(listener));
                let _ = status_tx.send(Status::ServerDown(name, Ok(())));
            }
            Err(e) => {
                warn!("{name} server failed to bind vsock port {port}: {e}");
                let _ = status_tx.send(Status::ServerDown(name, Err(e.into())));
            }
        }
    })
}

/// Run the full startup sequence and then block supervising R/T/E and the
/// rescan timer. Returns only on normal shutdown; process-replacing steps
/// (version gate, location gate, lock contention) call `std::process::exit`
/// directly.
pub fn run(config: Config, status_tx: Sender<Status>) -> Result<()> {
    util::ignore_sigpipe();

    let executable_name = current_executable_name()?;
    takeover(&executable_name);

    status_tx.send(Status::LockStart).ok();
    let lock = match PidLock::acquire(&config.app_id)? {
        Some(lock) => {
            status_tx.send(Status::LockEnd(Ok(()))).ok();
            lock
        }
        None => {
            info!("another instance holds the lock for '{}'; exiting", config.app_id);
            status_tx
                .send(Status::LockEnd(Err(anyhow::anyhow!("lock held by another instance"))))
                .ok();
            std::process::exit(0);
        }
    };

    let registrar = FileLaunchRegistrar;
    if let Some(candidate) = find_newer_source(&config) {
        status_tx.send(Status::RescanStart).ok();
        apply_update(&config, &candidate, &registrar)?;
        status_tx.send(Status::RescanEnd(Ok(true))).ok();
        takeover(&executable_name);
        drop(lock);
        return relaunch_and_exit(&config);
    }

    if !running_from_canonical_path(&config)? {
        drop(lock);
        return relaunch_and_exit(&config);
    }

    register_auto_start(&config, &registrar)?;

    let downloads_dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("Downloads")
        .join(&config.app_id);
    let clipboard: Arc<dyn ClipboardAdapter> = Arc::new(NoopClipboardAdapter);
    let (supervisor, _pusher) = ServerSupervisor::start(&config, clipboard, downloads_dir, status_tx.clone());

    let rescan_config = config.clone();
    let rescan_status_tx = status_tx.clone();
    thread::spawn(move || rescan_loop(rescan_config, rescan_status_tx));

    supervisor.join();
    drop(lock);
    Ok(())
}

fn rescan_loop(config: Config, status_tx: Sender<Status>) {
    let registrar = FileLaunchRegistrar;
    loop {
        thread::sleep(Duration::from_secs(config.rescan_interval_secs));
        status_tx.send(Status::RescanStart).ok();
        match find_newer_source(&config) {
            Some(candidate) => {
                if let Err(e) = apply_update(&config, &candidate, &registrar) {
                    warn!("rescan update failed: {e:#}");
                    status_tx.send(Status::RescanEnd(Err(e))).ok();
                    continue;
                }
                status_tx.send(Status::RescanEnd(Ok(true))).ok();
                if let Err(e) = relaunch_and_exit(&config) {
                    warn!("rescan relaunch failed: {e:#}");
                }
            }
            None => {
                status_tx.send(Status::RescanEnd(Ok(false))).ok();
            }
        }
    }
}
