/// Process management for GDB
///
/// Spawning the debugger with the MI interpreter and delivering the
/// platform-specific break signal.

use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::{GdbError, Result};

pub struct GdbProcess {
    child: Child,
}

impl GdbProcess {
    /// Start a new GDB process with MI interface
    pub fn start(gdb_path: &str, args: &[String]) -> Result<Self> {
        log::debug!("Starting GDB process: {} {:?}", gdb_path, args);

        let child = Command::new(gdb_path)
            .arg("--interpreter=mi2")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        log::debug!("GDB process started with PID: {:?}", child.id());

        Ok(GdbProcess { child })
    }

    /// Get the process ID
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Option<tokio::process::ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.child.stderr.take()
    }

    /// Kill the GDB process
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Deliver Ctrl+C to the process so GDB breaks the running target.
#[cfg(windows)]
pub fn send_interrupt_signal(pid: u32) -> Result<()> {
    unsafe {
        use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_C_EVENT};

        let result = GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid);
        if result == 0 {
            log::error!("GenerateConsoleCtrlEvent failed for PID {}", pid);
            Err(GdbError::Send("Failed to send Ctrl+C event".into()))
        } else {
            log::debug!("Successfully sent CTRL_C_EVENT to PID {}", pid);
            Ok(())
        }
    }
}

#[cfg(unix)]
pub fn send_interrupt_signal(pid: u32) -> Result<()> {
    let result = unsafe { libc::kill(pid as i32, libc::SIGINT) };
    if result != 0 {
        log::error!("Failed to send SIGINT to PID {}", pid);
        Err(GdbError::Send("Failed to send SIGINT".into()))
    } else {
        log::debug!("Successfully sent SIGINT to PID {}", pid);
        Ok(())
    }
}

#[cfg(not(any(windows, unix)))]
pub fn send_interrupt_signal(_pid: u32) -> Result<()> {
    Err(GdbError::Send("Interrupt not supported on this platform".into()))
}

/// Keep our own console alive when Ctrl+C is delivered to the debugger.
#[cfg(windows)]
pub fn install_signal_protection() {
    unsafe {
        use winapi::shared::minwindef::{BOOL, DWORD, TRUE};
        use winapi::um::consoleapi::SetConsoleCtrlHandler;

        unsafe extern "system" fn ctrl_handler(ctrl_type: DWORD) -> BOOL {
            use winapi::um::wincon::{CTRL_BREAK_EVENT, CTRL_C_EVENT};

            match ctrl_type {
                CTRL_C_EVENT | CTRL_BREAK_EVENT => TRUE,
                _ => 0,
            }
        }

        if SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) == 0 {
            log::warn!("Failed to install custom Ctrl+C handler");
        }
    }
}

#[cfg(not(windows))]
pub fn install_signal_protection() {
    log::debug!("Signal protection not required on this platform");
}
