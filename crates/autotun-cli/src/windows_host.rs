//! Windows service entry point
//!
//! The service control manager starts `autotun service-host`; the process hands
//! its main thread to the dispatcher, which calls back into [`service_main`] on a
//! thread of its own. Stop and shutdown controls stop the supervisor.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
    ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::{define_windows_service, service_dispatcher};

use autotun_cli::service::WINDOWS_SERVICE_NAME;

use crate::SHUTDOWN_TIMEOUT;

struct HostOptions {
    config: Option<PathBuf>,
    work_dir: PathBuf,
}

// The dispatcher callback takes no context, only the SCM start arguments
static OPTIONS: OnceLock<HostOptions> = OnceLock::new();

define_windows_service!(ffi_service_main, service_main);

/// Block until the service stops
pub fn dispatch(config: Option<PathBuf>, work_dir: PathBuf) -> Result<()> {
    if OPTIONS.set(HostOptions { config, work_dir }).is_err() {
        anyhow::bail!("Service host already dispatched");
    }
    service_dispatcher::start(WINDOWS_SERVICE_NAME, ffi_service_main)
        .context("Failed to connect to the service control manager")
}

fn service_main(_arguments: Vec<OsString>) {
    if let Err(e) = run_service() {
        error!(error = %e, "Service stopped on error");
    }
}

fn run_service() -> Result<()> {
    let options = OPTIONS.get().context("Service host options missing")?;

    let stop_requested = Arc::new(Notify::new());
    let notifier = stop_requested.clone();
    let status_handle =
        service_control_handler::register(WINDOWS_SERVICE_NAME, move |control| match control {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                notifier.notify_one();
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => ServiceControlHandlerResult::NotImplemented,
        })
        .context("Failed to register service control handler")?;

    status_handle
        .set_service_status(service_status(
            ServiceState::Running,
            ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
            0,
        ))
        .context("Failed to report service running")?;
    info!(service = WINDOWS_SERVICE_NAME, "Running as Windows service");

    let shutdown = async move {
        stop_requested.notified().await;
        let mut pending =
            service_status(ServiceState::StopPending, ServiceControlAccept::empty(), 0);
        pending.wait_hint = SHUTDOWN_TIMEOUT;
        status_handle
            .set_service_status(pending)
            .context("Failed to report stop pending")
    };

    let result = tokio::runtime::Runtime::new()
        .context("Failed to start runtime")
        .and_then(|runtime| {
            runtime.block_on(crate::run(
                options.config.as_deref(),
                &options.work_dir,
                shutdown,
            ))
        });

    let exit_code = if result.is_ok() { 0 } else { 1 };
    status_handle
        .set_service_status(service_status(
            ServiceState::Stopped,
            ServiceControlAccept::empty(),
            exit_code,
        ))
        .context("Failed to report service stopped")?;
    result
}

fn service_status(
    state: ServiceState,
    controls_accepted: ServiceControlAccept,
    exit_code: u32,
) -> ServiceStatus {
    ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: state,
        controls_accepted,
        exit_code: ServiceExitCode::Win32(exit_code),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    }
}
