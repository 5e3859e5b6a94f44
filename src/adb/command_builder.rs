// ADB Command Builder - Typed builder for adb argument vectors
// Keeps the command surface the engine consumes in one place.

/// The adb commands the engine issues.
#[derive(Debug, Clone)]
pub enum AdbCommand {
    Devices { long: bool },
    Shell(String),
    Push { local: String, remote: String },
    Forward { local_tcp: u16, remote_spec: String },
    ForwardRemove { local_tcp: u16 },
    ExecOut(Vec<String>),
    Connect { target: String },
    Disconnect { target: String },
    Tcpip { port: u16 },
    StartServer,
    KillServer,
    GetProp(String),
}

impl AdbCommand {
    /// Convert the command into an argument vector for the adb process.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            AdbCommand::Devices { long } => {
                let mut args = vec!["devices".into()];
                if *long {
                    args.push("-l".into());
                }
                args
            }
            AdbCommand::Shell(cmd) => vec!["shell".into(), cmd.clone()],
            AdbCommand::Push { local, remote } => {
                vec!["push".into(), local.clone(), remote.clone()]
            }
            AdbCommand::Forward {
                local_tcp,
                remote_spec,
            } => vec![
                "forward".into(),
                format!("tcp:{local_tcp}"),
                remote_spec.clone(),
            ],
            AdbCommand::ForwardRemove { local_tcp } => vec![
                "forward".into(),
                "--remove".into(),
                format!("tcp:{local_tcp}"),
            ],
            AdbCommand::ExecOut(cmd) => {
                let mut args = vec!["exec-out".into()];
                args.extend(cmd.iter().cloned());
                args
            }
            AdbCommand::Connect { target } => vec!["connect".into(), target.clone()],
            AdbCommand::Disconnect { target } => vec!["disconnect".into(), target.clone()],
            AdbCommand::Tcpip { port } => vec!["tcpip".into(), port.to_string()],
            AdbCommand::StartServer => vec!["start-server".into()],
            AdbCommand::KillServer => vec!["kill-server".into()],
            AdbCommand::GetProp(prop) => {
                vec!["shell".into(), "getprop".into(), prop.clone()]
            }
        }
    }
}

/// Builder prepending device targeting to a command's argument vector.
#[derive(Default)]
pub struct AdbCommandBuilder {
    serial: Option<String>,
}

impl AdbCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target a specific device by serial.
    pub fn target(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    /// Construct the full argument list including device targeting.
    pub fn build(&self, command: AdbCommand) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref serial) = self.serial {
            args.push("-s".into());
            args.push(serial.clone());
        }
        args.extend(command.to_args());
        args
    }
}
