use std::io;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request message sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to resolve the future.
/// Ideally, open work is persisted or finished in an orderly manner but no new requests are
/// accepted anymore.
///
/// The `timeout` is `None` for immediate shutdowns, in which case services should stop as fast
/// as possible without finishing open work.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

type Channel = watch::Sender<Option<Shutdown>>;

/// Global channel to notify all services of a shutdown.
static SHUTDOWN: LazyLock<Channel> = LazyLock::new(|| watch::channel(None).0);

/// Notifies a service about an upcoming shutdown.
///
/// Obtain a handle through [`Controller::shutdown_handle`].
#[derive(Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Wait for a shutdown.
    ///
    /// This receives all shutdown signals since the [`Controller`] has been started, even before
    /// this shutdown handle has been obtained.
    ///
    /// # Cancel safety
    ///
    /// This method is cancellation safe and can be used in `select!`.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = &*self.0.borrow_and_update() {
                return shutdown.clone();
            }
            if self.0.changed().await.is_err() {
                break;
            }
        }

        Shutdown { timeout: None }
    }

    /// Returns the current shutdown state without waiting.
    pub fn get(&self) -> Option<Shutdown> {
        self.0.borrow().clone()
    }
}

/// The mode of a shutdown requested through [`Controller::shutdown`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownMode {
    /// Finish open work within the configured shutdown timeout.
    Graceful,
    /// Stop as fast as possible.
    Immediate,
}

/// Service to start and gracefully stop the system runtime.
///
/// This service offers a static API to wait for a shutdown signal or manually initiate the Tally
/// shutdown. In order to use this functionality, start the controller with
/// [`Controller::start`].
///
/// To shut down gracefully, other services can register with [`Controller::shutdown_handle`].
/// When a shutdown signal is sent to the process, they will receive a [`Shutdown`] message with
/// an optional timeout.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
///
/// use tally_system::{Controller, ShutdownMode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// Controller::start(Duration::from_millis(10));
/// let mut shutdown = Controller::shutdown_handle();
///
/// Controller::shutdown(ShutdownMode::Graceful);
/// let notification = shutdown.notified().await;
/// assert_eq!(notification.timeout, Some(Duration::from_millis(10)));
/// # }
/// ```
#[derive(Debug)]
pub struct Controller;

static SHUTDOWN_TIMEOUT: LazyLock<watch::Sender<Duration>> =
    LazyLock::new(|| watch::channel(Duration::ZERO).0);

impl Controller {
    /// Starts a controller that monitors shutdown signals.
    pub fn start(shutdown_timeout: Duration) {
        SHUTDOWN_TIMEOUT.send_replace(shutdown_timeout);
        tokio::spawn(monitor_shutdown());
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        ShutdownHandle(SHUTDOWN.subscribe())
    }

    /// Manually initiates the shutdown process of the system.
    pub fn shutdown(mode: ShutdownMode) {
        let timeout = match mode {
            ShutdownMode::Immediate => None,
            ShutdownMode::Graceful => Some(*SHUTDOWN_TIMEOUT.borrow()),
        };

        SHUTDOWN.send_replace(Some(Shutdown { timeout }));
    }
}

#[cfg(unix)]
async fn monitor_shutdown() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_quit = signal(SignalKind::quit())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    let mode = tokio::select! {
        biased;

        Some(()) = sig_int.recv() => {
            tally_log::info!("SIGINT received, exiting");
            ShutdownMode::Graceful
        }
        Some(()) = sig_quit.recv() => {
            tally_log::info!("SIGQUIT received, exiting immediately");
            ShutdownMode::Immediate
        }
        Some(()) = sig_term.recv() => {
            tally_log::info!("SIGTERM received, stopping in {}s", SHUTDOWN_TIMEOUT.borrow().as_secs());
            ShutdownMode::Graceful
        }

        else => return Ok(()),
    };

    Controller::shutdown(mode);
    Ok(())
}

#[cfg(not(unix))]
async fn monitor_shutdown() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tally_log::info!("SIGINT received, exiting");
    Controller::shutdown(ShutdownMode::Graceful);
    Ok(())
}
