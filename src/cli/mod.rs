//! Interactive driver commands: parsing of REPL lines and program arguments, plus the
//! one-line rendering of session states printed by the binary.

use std::path::PathBuf;

use crate::identity::{Role, SessionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { email: String, password: String, role: Role },
    Signup { email: String, password: String, name: String, role: Role },
    OAuth { role: Role },
    /// Deep-link redirect pasted back after the browser flow.
    Callback { url: String },
    Logout,
    WhoAmI,
    Help,
    Quit,
}

pub const REPL_HELP: &str = "Commands:
  login <email> <password> <doctor|patient>        sign in with a password
  signup <email> <password> <name...> <role>       create an account (name may contain spaces)
  oauth <doctor|patient>                           start the browser sign-in
  callback <redirect-url>                          finish the browser sign-in from the redirect link
  logout                                           end the session
  whoami                                           show the current session
  help                                             show this help
  quit | exit                                      leave";

fn parse_role(s: &str) -> Result<Role, String> {
    s.parse::<Role>().map_err(|_| format!("unknown role '{}': expected doctor or patient", s))
}

/// Parse one REPL line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(head) = parts.first() else { return Ok(None) };
    let cmd = match head.to_ascii_lowercase().as_str() {
        "login" => {
            if parts.len() != 4 { return Err("usage: login <email> <password> <doctor|patient>".into()); }
            Command::Login { email: parts[1].to_string(), password: parts[2].to_string(), role: parse_role(parts[3])? }
        }
        "signup" => {
            if parts.len() < 5 { return Err("usage: signup <email> <password> <name...> <doctor|patient>".into()); }
            let role = parse_role(parts[parts.len() - 1])?;
            let name = parts[3..parts.len() - 1].join(" ");
            Command::Signup { email: parts[1].to_string(), password: parts[2].to_string(), name, role }
        }
        "oauth" => {
            if parts.len() != 2 { return Err("usage: oauth <doctor|patient>".into()); }
            Command::OAuth { role: parse_role(parts[1])? }
        }
        "callback" => {
            if parts.len() != 2 { return Err("usage: callback <redirect-url>".into()); }
            Command::Callback { url: parts[1].to_string() }
        }
        "logout" => Command::Logout,
        "whoami" | "status" => Command::WhoAmI,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{}'; type 'help'", other)),
    };
    Ok(Some(cmd))
}

pub fn describe_state(state: &SessionState) -> String {
    match state {
        SessionState::Anonymous => "anonymous".to_string(),
        SessionState::Authenticating(Some(role)) => format!("authenticating as {}", role),
        SessionState::Authenticating(None) => "authenticating".to_string(),
        SessionState::ResolvingProfile(raw, _) => format!("resolving profile for {}", raw.id),
        SessionState::Authenticated(p) => format!("signed in: {} <{}> ({})", p.display_name, p.email, p.role),
        SessionState::Failed(err) => format!("failed [{}]: {}", err.code_str(), err),
    }
}

/// Program arguments of the `clinic-session` binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub help: bool,
}

pub fn usage(program: &str) -> String {
    format!(
        "Usage:\n  {program} [--config <file.json>]\n\nConfiguration is read from the optional JSON file, then CLINIC_* environment variables\n(CLINIC_BACKEND_URL and CLINIC_ANON_KEY are required).\n\n{REPL_HELP}"
    )
}

pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<CliArgs, String> {
    let mut out = CliArgs::default();
    let mut it = args.into_iter();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--config" | "-c" => {
                let v = it.next().ok_or_else(|| "--config requires a path".to_string())?;
                out.config = Some(PathBuf::from(v));
            }
            "-h" | "--help" => out.help = true,
            unk => return Err(format!("Unrecognized argument: {}", unk)),
        }
    }
    Ok(out)
}
