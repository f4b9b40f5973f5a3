//! Service installation for macOS (launchd), Linux (systemd) and Windows (SCM)

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Prefix of the daily-rolled log files written with `--log-to-file`
pub const LOG_FILE_PREFIX: &str = "autotun.log";

/// Directory under the working directory holding the log files
pub const LOG_DIR_NAME: &str = "logs";

/// Name registered with the Windows service control manager
pub const WINDOWS_SERVICE_NAME: &str = "autotun";

/// Hidden subcommand the Windows service runs, handing the process to the SCM
pub const SERVICE_HOST_COMMAND: &str = "service-host";

const LAUNCHD_LABEL: &str = "com.autotun.agent";
const SYSTEMD_UNIT: &str = "autotun";
#[cfg(windows)]
const WINDOWS_DISPLAY_NAME: &str = "autotun SSH tunnel";

/// Service manager for platform-specific service installation
pub struct ServiceManager {
    platform: Platform,
    work_dir: PathBuf,
    config: Option<PathBuf>,
}

/// Platform type
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(dead_code)] // Platform variants are conditionally used based on target OS
enum Platform {
    MacOS,
    Linux,
    Windows,
    Unsupported,
}

impl ServiceManager {
    /// Create a service manager for a tunnel running out of `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            platform: Self::detect_platform(),
            work_dir: work_dir.into(),
            config: None,
        }
    }

    /// Pass an explicit configuration file to the installed service
    pub fn with_config(mut self, config: Option<PathBuf>) -> Self {
        self.config = config;
        self
    }

    fn detect_platform() -> Platform {
        #[cfg(target_os = "macos")]
        {
            Platform::MacOS
        }
        #[cfg(target_os = "linux")]
        {
            Platform::Linux
        }
        #[cfg(windows)]
        {
            Platform::Windows
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
        {
            Platform::Unsupported
        }
    }

    pub fn is_supported(&self) -> bool {
        self.platform != Platform::Unsupported
    }

    fn service_name(&self) -> &str {
        match self.platform {
            Platform::MacOS => LAUNCHD_LABEL,
            Platform::Windows => WINDOWS_SERVICE_NAME,
            Platform::Linux | Platform::Unsupported => SYSTEMD_UNIT,
        }
    }

    fn get_binary_path() -> Result<PathBuf> {
        std::env::current_exe().context("Failed to get current executable path")
    }

    fn log_dir(&self) -> PathBuf {
        self.work_dir.join(LOG_DIR_NAME)
    }

    pub fn install(&self) -> Result<()> {
        if !self.is_supported() {
            anyhow::bail!("Service installation is not supported on this platform");
        }

        let binary_path = Self::get_binary_path()?;

        match self.platform {
            Platform::MacOS => self.install_macos(&binary_path),
            Platform::Linux => self.install_linux(&binary_path),
            #[cfg(windows)]
            Platform::Windows => self.install_windows(&binary_path),
            _ => unreachable!(),
        }
    }

    pub fn uninstall(&self) -> Result<()> {
        if !self.is_supported() {
            anyhow::bail!("Service uninstall is not supported on this platform");
        }

        match self.platform {
            Platform::MacOS => self.uninstall_macos(),
            Platform::Linux => self.uninstall_linux(),
            #[cfg(windows)]
            Platform::Windows => self.uninstall_windows(),
            _ => unreachable!(),
        }
    }

    pub fn start(&self) -> Result<()> {
        if !self.is_supported() {
            anyhow::bail!("Service start is not supported on this platform");
        }

        match self.platform {
            Platform::MacOS => self.start_macos(),
            Platform::Linux => self.start_linux(),
            #[cfg(windows)]
            Platform::Windows => self.start_windows(),
            _ => unreachable!(),
        }
    }

    pub fn stop(&self) -> Result<()> {
        if !self.is_supported() {
            anyhow::bail!("Service stop is not supported on this platform");
        }

        match self.platform {
            Platform::MacOS => self.stop_macos(),
            Platform::Linux => self.stop_linux(),
            #[cfg(windows)]
            Platform::Windows => self.stop_windows(),
            _ => unreachable!(),
        }
    }

    pub fn restart(&self) -> Result<()> {
        self.stop().ok(); // Ignore error if not running
        self.start()
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        match self.platform {
            Platform::MacOS => self.status_macos(),
            Platform::Linux => self.status_linux(),
            #[cfg(windows)]
            Platform::Windows => self.status_windows(),
            _ => Ok(ServiceStatus::NotInstalled),
        }
    }

    /// Last `lines` lines of the service log
    pub fn logs(&self, lines: usize) -> Result<String> {
        match self.platform {
            Platform::MacOS | Platform::Windows => self.logs_from_files(lines),
            Platform::Linux => self.logs_linux(lines),
            Platform::Unsupported => {
                anyhow::bail!("Service logs are not supported on this platform")
            }
        }
    }

    // ============ macOS (launchd) implementation ============

    fn get_launchd_plist_path(&self) -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home
            .join("Library")
            .join("LaunchAgents")
            .join(format!("{}.plist", self.service_name())))
    }

    fn install_macos(&self, binary_path: &Path) -> Result<()> {
        let plist_path = self.get_launchd_plist_path()?;
        let plist_dir = plist_path
            .parent()
            .context("Failed to get parent directory")?;

        fs::create_dir_all(plist_dir).context("Failed to create LaunchAgents directory")?;
        fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;

        let plist_content = launchd_plist(
            LAUNCHD_LABEL,
            binary_path,
            &self.work_dir,
            self.config.as_deref(),
        );
        fs::write(&plist_path, plist_content)
            .with_context(|| format!("Failed to write plist file: {:?}", plist_path))?;

        println!("✅ Service installed: {}", plist_path.display());
        println!("   Start with: autotun service start");

        Ok(())
    }

    fn uninstall_macos(&self) -> Result<()> {
        self.stop_macos().ok();

        let plist_path = self.get_launchd_plist_path()?;

        if plist_path.exists() {
            fs::remove_file(&plist_path)
                .with_context(|| format!("Failed to remove plist file: {:?}", plist_path))?;
            println!("✅ Service uninstalled");
        } else {
            println!("Service is not installed");
        }

        Ok(())
    }

    fn start_macos(&self) -> Result<()> {
        let plist_path = self.get_launchd_plist_path()?;

        if !plist_path.exists() {
            anyhow::bail!("Service is not installed. Run 'autotun service install' first.");
        }

        let output = Command::new("launchctl")
            .arg("load")
            .arg(&plist_path)
            .output()
            .context("Failed to execute launchctl")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("Already loaded") {
                anyhow::bail!("Failed to start service: {}", stderr);
            }
        }

        println!("✅ Service started");
        Ok(())
    }

    fn stop_macos(&self) -> Result<()> {
        let plist_path = self.get_launchd_plist_path()?;

        if !plist_path.exists() {
            anyhow::bail!("Service is not installed");
        }

        let output = Command::new("launchctl")
            .arg("unload")
            .arg(&plist_path)
            .output()
            .context("Failed to execute launchctl")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to stop service: {}", stderr);
        }

        println!("✅ Service stopped");
        Ok(())
    }

    fn status_macos(&self) -> Result<ServiceStatus> {
        let plist_path = self.get_launchd_plist_path()?;

        if !plist_path.exists() {
            return Ok(ServiceStatus::NotInstalled);
        }

        let output = Command::new("launchctl")
            .arg("list")
            .arg(self.service_name())
            .output()
            .context("Failed to execute launchctl")?;

        if output.status.success() {
            Ok(ServiceStatus::Running)
        } else {
            Ok(ServiceStatus::Stopped)
        }
    }

    fn logs_from_files(&self, lines: usize) -> Result<String> {
        let Some(log_file) = latest_log_file(&self.log_dir())? else {
            return Ok("No logs available".to_string());
        };

        let content = fs::read_to_string(&log_file)
            .with_context(|| format!("Failed to read log file: {:?}", log_file))?;
        Ok(tail_lines(&content, lines))
    }

    // ============ Linux (systemd) implementation ============

    fn get_systemd_unit_path(&self) -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home
            .join(".config")
            .join("systemd")
            .join("user")
            .join(format!("{}.service", self.service_name())))
    }

    fn install_linux(&self, binary_path: &Path) -> Result<()> {
        let unit_path = self.get_systemd_unit_path()?;
        let unit_dir = unit_path
            .parent()
            .context("Failed to get parent directory")?;

        fs::create_dir_all(unit_dir).context("Failed to create systemd user directory")?;

        let unit_content = systemd_unit(binary_path, &self.work_dir, self.config.as_deref());
        fs::write(&unit_path, unit_content)
            .with_context(|| format!("Failed to write unit file: {:?}", unit_path))?;

        Command::new("systemctl")
            .arg("--user")
            .arg("daemon-reload")
            .output()
            .context("Failed to reload systemd daemon")?;

        println!("✅ Service installed: {}", unit_path.display());
        println!("   Start with: autotun service start");

        Ok(())
    }

    fn uninstall_linux(&self) -> Result<()> {
        self.stop_linux().ok();

        let unit_path = self.get_systemd_unit_path()?;

        if unit_path.exists() {
            Command::new("systemctl")
                .arg("--user")
                .arg("disable")
                .arg(self.service_name())
                .output()
                .ok();

            fs::remove_file(&unit_path)
                .with_context(|| format!("Failed to remove unit file: {:?}", unit_path))?;

            Command::new("systemctl")
                .arg("--user")
                .arg("daemon-reload")
                .output()
                .context("Failed to reload systemd daemon")?;

            println!("✅ Service uninstalled");
        } else {
            println!("Service is not installed");
        }

        Ok(())
    }

    fn start_linux(&self) -> Result<()> {
        let unit_path = self.get_systemd_unit_path()?;

        if !unit_path.exists() {
            anyhow::bail!("Service is not installed. Run 'autotun service install' first.");
        }

        let output = Command::new("systemctl")
            .arg("--user")
            .arg("start")
            .arg(self.service_name())
            .output()
            .context("Failed to execute systemctl")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to start service: {}", stderr);
        }

        // Enable for auto-start
        Command::new("systemctl")
            .arg("--user")
            .arg("enable")
            .arg(self.service_name())
            .output()
            .ok();

        println!("✅ Service started");
        Ok(())
    }

    fn stop_linux(&self) -> Result<()> {
        let output = Command::new("systemctl")
            .arg("--user")
            .arg("stop")
            .arg(self.service_name())
            .output()
            .context("Failed to execute systemctl")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to stop service: {}", stderr);
        }

        println!("✅ Service stopped");
        Ok(())
    }

    fn status_linux(&self) -> Result<ServiceStatus> {
        let unit_path = self.get_systemd_unit_path()?;

        if !unit_path.exists() {
            return Ok(ServiceStatus::NotInstalled);
        }

        let output = Command::new("systemctl")
            .arg("--user")
            .arg("is-active")
            .arg(self.service_name())
            .output()
            .context("Failed to execute systemctl")?;

        let status_str = String::from_utf8_lossy(&output.stdout).trim().to_string();

        match status_str.as_str() {
            "active" => Ok(ServiceStatus::Running),
            _ => Ok(ServiceStatus::Stopped),
        }
    }

    fn logs_linux(&self, lines: usize) -> Result<String> {
        let output = Command::new("journalctl")
            .arg("--user")
            .arg("-u")
            .arg(self.service_name())
            .arg("-n")
            .arg(lines.to_string())
            .arg("--no-pager")
            .output()
            .context("Failed to read logs")?;

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

// ============ Windows (service control manager) implementation ============

#[cfg(windows)]
impl ServiceManager {
    fn open_windows_service(
        &self,
        access: windows_service::service::ServiceAccess,
    ) -> Result<Option<windows_service::service::Service>> {
        use windows_service::service_manager::ServiceManagerAccess;

        // ERROR_SERVICE_DOES_NOT_EXIST
        const NOT_INSTALLED: i32 = 1060;

        let manager = scm_connect(ServiceManagerAccess::CONNECT)?;
        match manager.open_service(WINDOWS_SERVICE_NAME, access) {
            Ok(service) => Ok(Some(service)),
            Err(windows_service::Error::Winapi(e)) if e.raw_os_error() == Some(NOT_INSTALLED) => {
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to open service"),
        }
    }

    fn install_windows(&self, binary_path: &Path) -> Result<()> {
        use std::ffi::OsString;
        use windows_service::service::{
            ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceType,
        };
        use windows_service::service_manager::ServiceManagerAccess;

        fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;

        let info = ServiceInfo {
            name: OsString::from(WINDOWS_SERVICE_NAME),
            display_name: OsString::from(WINDOWS_DISPLAY_NAME),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: binary_path.to_path_buf(),
            launch_arguments: windows_service_args(&self.work_dir, self.config.as_deref())
                .into_iter()
                .map(OsString::from)
                .collect(),
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };

        let manager =
            scm_connect(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;
        let service = manager
            .create_service(&info, ServiceAccess::CHANGE_CONFIG)
            .context("Failed to create service")?;
        service
            .set_description("Keeps remote and local SSH port forwards alive")
            .context("Failed to set service description")?;

        println!("✅ Service installed: {}", WINDOWS_SERVICE_NAME);
        println!("   Start with: autotun service start");

        Ok(())
    }

    fn uninstall_windows(&self) -> Result<()> {
        use windows_service::service::{ServiceAccess, ServiceState};

        let access = ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE;
        let Some(service) = self.open_windows_service(access)? else {
            println!("Service is not installed");
            return Ok(());
        };

        let status = service.query_status().context("Failed to query service")?;
        if status.current_state != ServiceState::Stopped {
            service.stop().ok();
        }
        service.delete().context("Failed to delete service")?;

        println!("✅ Service uninstalled");
        Ok(())
    }

    fn start_windows(&self) -> Result<()> {
        use windows_service::service::ServiceAccess;

        let Some(service) = self.open_windows_service(ServiceAccess::START)? else {
            anyhow::bail!("Service is not installed. Run 'autotun service install' first.");
        };
        service
            .start::<&str>(&[])
            .context("Failed to start service")?;

        println!("✅ Service started");
        Ok(())
    }

    fn stop_windows(&self) -> Result<()> {
        use windows_service::service::ServiceAccess;

        let Some(service) = self.open_windows_service(ServiceAccess::STOP)? else {
            anyhow::bail!("Service is not installed");
        };
        service.stop().context("Failed to stop service")?;

        println!("✅ Service stopped");
        Ok(())
    }

    fn status_windows(&self) -> Result<ServiceStatus> {
        use windows_service::service::{ServiceAccess, ServiceState};

        let Some(service) = self.open_windows_service(ServiceAccess::QUERY_STATUS)? else {
            return Ok(ServiceStatus::NotInstalled);
        };
        let status = service.query_status().context("Failed to query service")?;

        match status.current_state {
            ServiceState::Running | ServiceState::StartPending => Ok(ServiceStatus::Running),
            _ => Ok(ServiceStatus::Stopped),
        }
    }
}

#[cfg(windows)]
fn scm_connect(
    access: windows_service::service_manager::ServiceManagerAccess,
) -> Result<windows_service::service_manager::ServiceManager> {
    windows_service::service_manager::ServiceManager::local_computer(None::<&str>, access)
        .context("Failed to connect to the service control manager")
}

/// Arguments the installed service passes to the binary
pub fn service_args(work_dir: &Path, config: Option<&Path>) -> Vec<String> {
    command_args("run", work_dir, config)
}

/// Launch arguments of the Windows service
pub fn windows_service_args(work_dir: &Path, config: Option<&Path>) -> Vec<String> {
    command_args(SERVICE_HOST_COMMAND, work_dir, config)
}

fn command_args(command: &str, work_dir: &Path, config: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        command.to_string(),
        "--log-to-file".to_string(),
        "--work-dir".to_string(),
        work_dir.display().to_string(),
    ];
    if let Some(config) = config {
        args.push("--config".to_string());
        args.push(config.display().to_string());
    }
    args
}

/// launchd agent definition
pub fn launchd_plist(
    label: &str,
    binary_path: &Path,
    work_dir: &Path,
    config: Option<&Path>,
) -> String {
    let arguments: String = std::iter::once(binary_path.display().to_string())
        .chain(service_args(work_dir, config))
        .map(|arg| format!("        <string>{}</string>\n", xml_escape(&arg)))
        .collect();
    let stderr_log = work_dir.join(LOG_DIR_NAME).join("stderr.log");

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{arguments}    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardErrorPath</key>
    <string>{stderr_log}</string>
    <key>WorkingDirectory</key>
    <string>{work_dir}</string>
</dict>
</plist>
"#,
        label = label,
        arguments = arguments,
        stderr_log = xml_escape(&stderr_log.display().to_string()),
        work_dir = xml_escape(&work_dir.display().to_string()),
    )
}

/// systemd user unit
pub fn systemd_unit(binary_path: &Path, work_dir: &Path, config: Option<&Path>) -> String {
    let exec_start: Vec<String> = std::iter::once(binary_path.display().to_string())
        .chain(service_args(work_dir, config))
        .map(|arg| systemd_quote(&arg))
        .collect();

    format!(
        r#"[Unit]
Description=autotun SSH port-forwarding supervisor
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
WorkingDirectory={work_dir}
ExecStart={exec_start}
Restart=on-failure
RestartSec=5s

[Install]
WantedBy=default.target
"#,
        work_dir = systemd_quote(&work_dir.display().to_string()),
        exec_start = exec_start.join(" "),
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn systemd_quote(value: &str) -> String {
    if value.contains(char::is_whitespace) || value.contains('"') {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Most recent daily log file in `dir`, if any
///
/// Daily files are suffixed with the date, so the lexically greatest name is the newest.
pub fn latest_log_file(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut newest: Option<PathBuf> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if is_log && newest.as_ref().map_or(true, |current| path > *current) {
            newest = Some(path);
        }
    }
    Ok(newest)
}

fn tail_lines(content: &str, lines: usize) -> String {
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    let mut tail = all[start..].join("\n");
    if !tail.is_empty() {
        tail.push('\n');
    }
    tail
}

/// Service status
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    NotInstalled,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Running => write!(f, "Running ✅"),
            ServiceStatus::Stopped => write!(f, "Stopped"),
            ServiceStatus::NotInstalled => write!(f, "Not installed"),
        }
    }
}
