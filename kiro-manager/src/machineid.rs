use crate::config::{expand_path, MachineIdConfig};
use crate::error::ManagerError;
use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const CRYPTOGRAPHY_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Cryptography";
pub const MACHINE_GUID_VALUE: &str = "MachineGuid";
const AGENT_EXTENSION_DIR: [&str; 4] = ["app", "extensions", "kiro.kiro-agent", "dist"];
const EXTENSION_FILE_NAME: &str = "extension.js";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration)
        -> Result<CommandOutput, io::Error>;
}

/// Runs helper binaries and kills them once `timeout` elapses.
pub struct SystemRunner;

fn read_pipe<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

#[cfg(windows)]
fn hide_console_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console_window(_cmd: &mut Command) {}

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_console_window(&mut cmd);
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || read_pipe(stdout));
        let stderr_reader = thread::spawn(move || read_pipe(stderr));

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{program} did not finish within {}s", timeout.as_secs()),
                ));
            }
            thread::sleep(Duration::from_millis(20));
        };

        let status_code = status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    Windows,
    MacOs,
    Linux,
    Other,
}

/// Host capabilities the identity strategies need. One implementation per
/// operating system, chosen once by [`current_platform`].
pub trait Platform {
    fn kind(&self) -> PlatformKind;

    fn name(&self) -> &str;

    /// The machine identifier as the OS reports it, before normalisation.
    fn acquire_raw_identifier(&self) -> Result<String, ManagerError>;

    /// Writes the system-wide machine identifier.
    fn set_system_identifier(&self, new_id: &str) -> Result<(), ManagerError>;

    fn install_dir_candidates(&self) -> Vec<PathBuf>;

    fn extension_js_path(&self, install_dir: &Path) -> PathBuf;
}

fn agent_extension_under(base: PathBuf) -> PathBuf {
    AGENT_EXTENSION_DIR
        .iter()
        .fold(base, |path, segment| path.join(segment))
        .join(EXTENSION_FILE_NAME)
}

pub struct WindowsPlatform<R: CommandRunner> {
    runner: R,
    timeout: Duration,
}

impl<R: CommandRunner> WindowsPlatform<R> {
    pub fn new(runner: R, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl<R: CommandRunner> Platform for WindowsPlatform<R> {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Windows
    }

    fn name(&self) -> &str {
        "windows"
    }

    fn acquire_raw_identifier(&self) -> Result<String, ManagerError> {
        let args: Vec<String> = ["query", CRYPTOGRAPHY_KEY, "/v", MACHINE_GUID_VALUE]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self
            .runner
            .run("reg", &args, self.timeout)
            .map_err(|err| ManagerError::io("run reg query", err))?;
        if !output.success() {
            return Err(ManagerError::MachineIdNotFound(format!(
                "reg query exited with {}: {}",
                output.status_code,
                output.combined().trim()
            )));
        }
        parse_reg_query_output(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ManagerError::MachineIdNotFound("MachineGuid missing from reg query output".to_string())
        })
    }

    fn set_system_identifier(&self, new_id: &str) -> Result<(), ManagerError> {
        let args: Vec<String> = [
            "add",
            CRYPTOGRAPHY_KEY,
            "/v",
            MACHINE_GUID_VALUE,
            "/t",
            "REG_SZ",
            "/d",
            new_id,
            "/f",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let output = self
            .runner
            .run("reg", &args, self.timeout)
            .map_err(|err| ManagerError::io("run reg add", err))?;
        if output.success() {
            return Ok(());
        }
        let text = output.combined();
        if is_access_denied(&text) {
            return Err(ManagerError::RequiresAdmin);
        }
        Err(ManagerError::Process(format!(
            "reg add exited with {}: {}",
            output.status_code,
            text.trim()
        )))
    }

    fn install_dir_candidates(&self) -> Vec<PathBuf> {
        dirs::data_local_dir()
            .map(|dir| vec![dir.join("Programs").join("Kiro")])
            .unwrap_or_default()
    }

    fn extension_js_path(&self, install_dir: &Path) -> PathBuf {
        agent_extension_under(install_dir.join("resources"))
    }
}

pub struct MacPlatform<R: CommandRunner> {
    runner: R,
    timeout: Duration,
}

impl<R: CommandRunner> MacPlatform<R> {
    pub fn new(runner: R, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl<R: CommandRunner> Platform for MacPlatform<R> {
    fn kind(&self) -> PlatformKind {
        PlatformKind::MacOs
    }

    fn name(&self) -> &str {
        "macos"
    }

    fn acquire_raw_identifier(&self) -> Result<String, ManagerError> {
        let args: Vec<String> = ["-rd1", "-c", "IOPlatformExpertDevice"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self
            .runner
            .run("ioreg", &args, self.timeout)
            .map_err(|err| ManagerError::io("run ioreg", err))?;
        if !output.success() {
            return Err(ManagerError::MachineIdNotFound(format!(
                "ioreg exited with {}",
                output.status_code
            )));
        }
        parse_ioreg_output(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| ManagerError::MachineIdNotFound("IOPlatformUUID not found".to_string()))
    }

    fn set_system_identifier(&self, _new_id: &str) -> Result<(), ManagerError> {
        Err(ManagerError::NotWindows)
    }

    fn install_dir_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from("/Applications/Kiro.app")];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join("Applications").join("Kiro.app"));
        }
        candidates
    }

    fn extension_js_path(&self, install_dir: &Path) -> PathBuf {
        agent_extension_under(install_dir.join("Contents").join("Resources"))
    }
}

pub struct LinuxPlatform {
    id_files: Vec<PathBuf>,
}

impl LinuxPlatform {
    pub fn new(id_files: Vec<PathBuf>) -> Self {
        Self { id_files }
    }
}

impl Platform for LinuxPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Linux
    }

    fn name(&self) -> &str {
        "linux"
    }

    fn acquire_raw_identifier(&self) -> Result<String, ManagerError> {
        for path in &self.id_files {
            match fs::read_to_string(path) {
                Ok(content) if !content.trim().is_empty() => return Ok(content),
                Ok(_) => tracing::debug!(path = %path.display(), "machine-id file is empty"),
                Err(err) => tracing::debug!(path = %path.display(), "machine-id file unreadable: {err}"),
            }
        }
        Err(ManagerError::MachineIdNotFound(format!(
            "none of {} contain a machine-id",
            self.id_files
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    fn set_system_identifier(&self, _new_id: &str) -> Result<(), ManagerError> {
        Err(ManagerError::NotWindows)
    }

    fn install_dir_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from("/usr/share/kiro"), PathBuf::from("/opt/Kiro")];
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".local").join("share").join("kiro"));
        }
        candidates
    }

    fn extension_js_path(&self, install_dir: &Path) -> PathBuf {
        agent_extension_under(install_dir.join("resources"))
    }
}

pub struct UnsupportedPlatform {
    os: String,
}

impl Platform for UnsupportedPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Other
    }

    fn name(&self) -> &str {
        &self.os
    }

    fn acquire_raw_identifier(&self) -> Result<String, ManagerError> {
        Err(ManagerError::Unsupported(self.os.clone()))
    }

    fn set_system_identifier(&self, _new_id: &str) -> Result<(), ManagerError> {
        Err(ManagerError::NotWindows)
    }

    fn install_dir_candidates(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn extension_js_path(&self, install_dir: &Path) -> PathBuf {
        agent_extension_under(install_dir.join("resources"))
    }
}

pub fn current_platform(cfg: &MachineIdConfig) -> Box<dyn Platform> {
    let timeout = cfg.command_timeout();
    match env::consts::OS {
        "windows" => Box::new(WindowsPlatform::new(SystemRunner, timeout)),
        "macos" => Box::new(MacPlatform::new(SystemRunner, timeout)),
        "linux" => Box::new(LinuxPlatform::new(
            cfg.linux_paths
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| expand_path(p.trim()))
                .collect(),
        )),
        other => Box::new(UnsupportedPlatform {
            os: other.to_string(),
        }),
    }
}

/// Lower-cased, trimmed identifier; queried fresh on every call.
pub fn raw_identifier(platform: &dyn Platform) -> Result<String, ManagerError> {
    let id = platform.acquire_raw_identifier()?.trim().to_lowercase();
    if id.is_empty() {
        return Err(ManagerError::MachineIdNotFound(format!(
            "{} reported an empty machine id",
            platform.name()
        )));
    }
    Ok(id)
}

pub fn derive_identifier(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

pub fn generate_machine_id() -> String {
    Uuid::new_v4().to_string().to_lowercase()
}

pub fn parse_reg_query_output(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with(MACHINE_GUID_VALUE))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            let _name = parts.next()?;
            let kind = parts.next()?;
            if !kind.starts_with("REG_") {
                return None;
            }
            parts.next().map(|value| value.to_string())
        })
}

pub fn parse_ioreg_output(text: &str) -> Option<String> {
    text.lines()
        .filter(|line| line.contains("IOPlatformUUID"))
        .find_map(|line| {
            let (_, value) = line.split_once('=')?;
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_lowercase())
        })
}

/// Recognises a privilege denial in `reg.exe` output from English,
/// Traditional Chinese and Simplified Chinese Windows installs.
pub fn is_access_denied(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("access is denied") || text.contains("拒絕存取") || text.contains("拒绝访问")
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockRunner {
        calls: RefCell<Vec<(String, Vec<String>)>>,
        outputs: RefCell<Vec<CommandOutput>>,
    }

    impl MockRunner {
        fn with_output(status_code: i32, stdout: &str, stderr: &str) -> Self {
            let runner = Self::default();
            runner.outputs.borrow_mut().push(CommandOutput {
                status_code,
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            });
            runner
        }
    }

    impl CommandRunner for MockRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _timeout: Duration,
        ) -> Result<CommandOutput, io::Error> {
            self.calls
                .borrow_mut()
                .push((program.to_string(), args.to_vec()));
            let mut queued = self.outputs.borrow_mut();
            if queued.is_empty() {
                return Ok(CommandOutput {
                    status_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                });
            }
            Ok(queued.remove(0))
        }
    }

    const REG_QUERY_SAMPLE: &str = "\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\Microsoft\\Cryptography\r\n    MachineGuid    REG_SZ    6F2A1C3E-1111-4A2B-9C3D-ABCDEF012345\r\n\r\n";

    #[test]
    fn reg_query_output_is_parsed() {
        assert_eq!(
            parse_reg_query_output(REG_QUERY_SAMPLE).as_deref(),
            Some("6F2A1C3E-1111-4A2B-9C3D-ABCDEF012345")
        );
        assert_eq!(parse_reg_query_output("ERROR: nothing"), None);
    }

    #[test]
    fn ioreg_output_is_parsed_and_lowercased() {
        let sample = r#"+-o J314sAP  <class IOPlatformExpertDevice>
    {
      "IOPlatformSerialNumber" = "C02XXXX"
      "IOPlatformUUID" = "A1B2C3D4-0000-1111-2222-333344445555"
    }"#;
        assert_eq!(
            parse_ioreg_output(sample).as_deref(),
            Some("a1b2c3d4-0000-1111-2222-333344445555")
        );
        assert_eq!(parse_ioreg_output("nothing here"), None);
    }

    #[test]
    fn access_denied_detection_covers_localised_output() {
        assert!(is_access_denied("ERROR: Access is denied.\r\n"));
        assert!(is_access_denied("錯誤: 拒絕存取。"));
        assert!(is_access_denied("错误: 拒绝访问。"));
        assert!(!is_access_denied("ERROR: Invalid syntax."));
    }

    #[test]
    fn windows_identifier_is_normalised() {
        let platform = WindowsPlatform::new(
            MockRunner::with_output(0, REG_QUERY_SAMPLE, ""),
            Duration::from_secs(1),
        );
        let id = raw_identifier(&platform).unwrap();
        assert_eq!(id, "6f2a1c3e-1111-4a2b-9c3d-abcdef012345");
        let calls = platform.runner.calls.borrow();
        assert_eq!(calls[0].0, "reg");
        assert_eq!(calls[0].1[0], "query");
    }

    #[test]
    fn windows_write_maps_denial_to_requires_admin() {
        let platform = WindowsPlatform::new(
            MockRunner::with_output(1, "", "ERROR: Access is denied.\r\n"),
            Duration::from_secs(1),
        );
        let err = platform.set_system_identifier("new-id").unwrap_err();
        assert!(matches!(err, ManagerError::RequiresAdmin));
    }

    #[test]
    fn windows_write_other_failures_stay_generic() {
        let platform = WindowsPlatform::new(
            MockRunner::with_output(1, "", "ERROR: Invalid syntax."),
            Duration::from_secs(1),
        );
        let err = platform.set_system_identifier("new-id").unwrap_err();
        assert!(matches!(err, ManagerError::Process(_)));
    }

    #[test]
    fn windows_write_passes_new_guid_to_reg_add() {
        let platform = WindowsPlatform::new(MockRunner::default(), Duration::from_secs(1));
        platform.set_system_identifier("abc-123").unwrap();
        let calls = platform.runner.calls.borrow();
        let args = &calls[0].1;
        assert_eq!(args[0], "add");
        assert!(args.windows(2).any(|w| w[0] == "/d" && w[1] == "abc-123"));
        assert_eq!(args.last().map(String::as_str), Some("/f"));
    }

    #[test]
    fn linux_reads_first_non_empty_file() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty");
        let real = dir.path().join("real");
        fs::write(&empty, "\n").unwrap();
        fs::write(&real, "  ABCDEF0123456789\n").unwrap();
        let platform = LinuxPlatform::new(vec![dir.path().join("missing"), empty, real]);
        assert_eq!(raw_identifier(&platform).unwrap(), "abcdef0123456789");
    }

    #[test]
    fn linux_without_files_reports_not_found() {
        let dir = tempdir().unwrap();
        let platform = LinuxPlatform::new(vec![dir.path().join("missing")]);
        let err = raw_identifier(&platform).unwrap_err();
        assert!(matches!(err, ManagerError::MachineIdNotFound(_)));
    }

    #[test]
    fn derived_identifier_is_sha256_hex() {
        assert_eq!(
            derive_identifier("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn generated_ids_are_lowercase_v4_uuids() {
        let id = generate_machine_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id, id.to_lowercase());
        assert_eq!(id.as_bytes()[14], b'4');
        assert_ne!(id, generate_machine_id());
    }

    #[test]
    fn unsupported_platform_fails_acquisition() {
        let platform = UnsupportedPlatform {
            os: "plan9".to_string(),
        };
        assert!(matches!(
            raw_identifier(&platform).unwrap_err(),
            ManagerError::Unsupported(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_times_out_and_kills_child() {
        let started = Instant::now();
        let err = SystemRunner
            .run("sleep", &["5".to_string()], Duration::from_millis(200))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_output() {
        let output = SystemRunner
            .run("echo", &["hello".to_string()], Duration::from_secs(5))
            .unwrap();
        assert!(output.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }
}
