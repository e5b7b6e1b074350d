use std::{
    net::{SocketAddr, TcpListener as StdTcpListener},
    path::PathBuf,
    sync::LazyLock,
};

use anyhow::Context;
use tokio::sync::broadcast;

use crate::{config::Config, internal, supervisor};

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Everything the command line decides; file configuration rides in
/// [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: std::net::IpAddr,
    pub port: u16,
    pub procs: u32,
    pub user: Option<String>,
    pub use_poll: bool,
    pub config_path: PathBuf,
}

pub struct Controller {
    settings: Settings,
    config: Config,
}

impl Controller {
    #[must_use]
    pub const fn new(settings: Settings, config: Config) -> Self {
        Self { settings, config }
    }

    /// Bind, drop privileges, then hand over to the supervisor. Errors
    /// out of here are fatal startup failures; the binary exits
    /// non-zero.
    pub fn run(self) -> anyhow::Result<()> {
        if self.settings.use_poll {
            internal!(
                level = INFO,
                "--use-poll accepted for compatibility; the runtime owns poller selection"
            );
        }

        let addr = SocketAddr::new(self.settings.listen, self.settings.port);
        let listener = bind_listener(addr).with_context(|| format!("unable to bind {addr}"))?;

        if let Some(user) = self.settings.user.as_deref() {
            supervisor::drop_privileges(user)?;
        }

        supervisor::run(
            listener,
            self.settings.config_path,
            self.config,
            self.settings.procs,
        )
    }
}

/// Scrub the inherited environment before anything else runs: a fixed
/// PATH, and no shell startup hooks.
pub fn sanitize_env() {
    std::env::set_var("PATH", "/bin:/usr/bin:/sbin:/usr/sbin");
    std::env::remove_var("ENV");
    std::env::remove_var("BASH_ENV");
}

/// Bind the listening socket by hand: `SO_REUSEADDR`, the system's
/// maximum backlog, close-on-exec. Kept blocking here; workers flip it
/// non-blocking once their runtime adopts it.
fn bind_listener(addr: SocketAddr) -> anyhow::Result<StdTcpListener> {
    use std::os::fd::FromRawFd;

    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("socket");
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            return Err(close_with(fd, "setsockopt SO_REUSEADDR"));
        }

        let bound = match addr {
            SocketAddr::V4(v4) => {
                let mut sin: libc::sockaddr_in = std::mem::zeroed();
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

                libc::bind(
                    fd,
                    std::ptr::addr_of!(sin).cast(),
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            SocketAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = std::mem::zeroed();
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();

                libc::bind(
                    fd,
                    std::ptr::addr_of!(sin6).cast(),
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        };

        if bound != 0 {
            return Err(close_with(fd, "bind"));
        }

        if libc::listen(fd, libc::SOMAXCONN) != 0 {
            return Err(close_with(fd, "listen"));
        }

        Ok(StdTcpListener::from_raw_fd(fd))
    }
}

/// Capture errno, close the half-made socket, and report.
fn close_with(fd: libc::c_int, what: &'static str) -> anyhow::Error {
    let source = std::io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    anyhow::Error::new(source).context(what)
}
