//! Screening for untrusted server configurations.
//!
//! A server configuration that arrives from outside the deployment boundary
//! can name an arbitrary command with arbitrary arguments. Before anything is
//! spawned, the configuration passes through a fixed pipeline: command
//! allow-list, per-command flag deny-list, shell-metacharacter screening,
//! local-file-access screening, then environment checks. The first failure
//! wins. The checks are conservative string screens, not a sandbox;
//! `TrustMode::Trusted` bypasses them for configurations the deployment
//! already trusts.

use serde_json::{Map, Value};

use crate::config::StdioServerConfig;

/// How much to trust a server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustMode {
    /// Validate stdio configurations before spawning anything.
    #[default]
    Untrusted,
    /// Skip validation; the configuration source is fully trusted.
    Trusted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("invalid server configuration")]
    InvalidConfig,
    #[error("command '{0}' is not allowed")]
    DisallowedCommand(String),
    #[error("argument '{argument}' is not allowed for command '{command}'")]
    DisallowedFlag { command: String, argument: String },
    #[error(
        "argument '{argument}' contains flag '{flag}' that is not allowed for command '{command}'"
    )]
    DisallowedFlagValue {
        command: String,
        argument: String,
        flag: String,
    },
    #[error("argument contains potentially dangerous characters: {0}")]
    CommandInjectionRisk(String),
    #[error("argument contains potential local file access: {0}")]
    LocalFileAccessRisk(String),
    #[error("argument is suspiciously long ({0} bytes)")]
    OversizedArgument(usize),
    #[error("{0} contains a null byte")]
    NullByteRisk(String),
    #[error("environment variable '{0}' modification is not allowed")]
    ProtectedEnvVar(String),
}

const ALLOWED_COMMANDS: &[&str] = &["node", "npx", "python", "python3", "docker"];

const DENIED_FLAGS: &[(&str, &[&str])] = &[
    ("npx", &["-c", "--call", "--shell-auto-fallback"]),
    (
        "node",
        &["-e", "--eval", "-p", "--print", "--inspect", "--inspect-brk"],
    ),
    ("python", &["-c", "-m"]),
    ("python3", &["-c", "-m"]),
    (
        "docker",
        &[
            "run",
            "exec",
            "-v",
            "--volume",
            "--privileged",
            "--network",
            "--pid",
            "--ipc",
        ],
    ),
];

const INJECTION_TOKENS: &[&str] = &[";", "&&", "|", "`", "$("];

const DANGEROUS_EXTENSIONS: &[&str] = &[
    ".exe", ".bat", ".cmd", ".sh", ".ps1", ".vbs", ".scr", ".com", ".pif", ".dll", ".sys",
];

const FILE_FLAG_NAMES: &[&str] = &[
    "file", "input", "output", "config", "load", "save", "import", "export", "read", "write",
];

const PROTECTED_ENV_VARS: &[&str] = &[
    "PATH",
    "NODE_OPTIONS",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "PYTHONPATH",
    "PYTHONSTARTUP",
];

const MAX_ARGUMENT_BYTES: usize = 1000;

/// Exact, case-sensitive allow-list membership.
pub fn validate_command(command: &str) -> Result<(), SecurityError> {
    if ALLOWED_COMMANDS.contains(&command) {
        Ok(())
    } else {
        Err(SecurityError::DisallowedCommand(command.to_string()))
    }
}

fn denied_flags_for(command: &str) -> &'static [&'static str] {
    DENIED_FLAGS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, flags)| *flags)
        .unwrap_or(&[])
}

/// Per-command flag deny-list.
///
/// Arguments are trimmed and lowercased before comparison (so `  -C  ` still
/// matches `-c`) but reported verbatim. The `--flag=value` single-token form
/// is matched on the part before `=`. Commands without a deny-list pass.
pub fn validate_command_flags(command: &str, args: &[Value]) -> Result<(), SecurityError> {
    let denied = denied_flags_for(command);
    if denied.is_empty() {
        return Ok(());
    }

    for value in args {
        let Some(arg) = value.as_str() else {
            continue;
        };
        let lowered = arg.trim().to_ascii_lowercase();
        if denied.contains(&lowered.as_str()) {
            return Err(SecurityError::DisallowedFlag {
                command: command.to_string(),
                argument: arg.to_string(),
            });
        }
        if let Some((flag, _)) = lowered.split_once('=') {
            if denied.contains(&flag) {
                return Err(SecurityError::DisallowedFlagValue {
                    command: command.to_string(),
                    argument: arg.to_string(),
                    flag: flag.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Reject arguments carrying shell metacharacters.
///
/// The child is spawned without a shell, but arguments are still forwarded to
/// tools that may hand them to one.
pub fn validate_command_injection(args: &[Value]) -> Result<(), SecurityError> {
    for value in args {
        let Some(arg) = value.as_str() else {
            continue;
        };
        if INJECTION_TOKENS.iter().any(|token| arg.contains(token)) {
            return Err(SecurityError::CommandInjectionRisk(arg.to_string()));
        }
    }
    Ok(())
}

fn has_dangerous_extension(arg: &str) -> bool {
    let lowered = arg.to_ascii_lowercase();
    DANGEROUS_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
}

fn is_file_flag(arg: &str) -> bool {
    let Some(stripped) = arg.strip_prefix('-') else {
        return false;
    };
    let stripped = stripped.strip_prefix('-').unwrap_or(stripped);
    let name = stripped.split('=').next().unwrap_or("");
    FILE_FLAG_NAMES
        .iter()
        .any(|flag| name.eq_ignore_ascii_case(flag))
}

fn is_windows_drive_path(arg: &str) -> bool {
    let bytes = arg.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Screen arguments for local filesystem reach: absolute and relative paths,
/// traversal, dangerous executable extensions, file-oriented flags, null
/// bytes and oversized values.
pub fn validate_args_for_local_file_access(args: &[Value]) -> Result<(), SecurityError> {
    for value in args {
        let Some(arg) = value.as_str() else {
            continue;
        };
        if arg.contains('\0') {
            return Err(SecurityError::NullByteRisk("argument".to_string()));
        }
        if arg.len() > MAX_ARGUMENT_BYTES {
            return Err(SecurityError::OversizedArgument(arg.len()));
        }

        let trimmed = arg.trim();
        let risky = (trimmed.starts_with('/') && trimmed.len() > 1 && !trimmed.starts_with("//"))
            || is_windows_drive_path(trimmed)
            || trimmed.contains("../")
            || trimmed.contains("..\\")
            || trimmed.starts_with("..")
            || trimmed.starts_with("./")
            || trimmed.starts_with("~/")
            || trimmed.to_ascii_lowercase().starts_with("file://")
            || has_dangerous_extension(trimmed)
            || is_file_flag(trimmed);
        if risky {
            return Err(SecurityError::LocalFileAccessRisk(arg.to_string()));
        }
    }
    Ok(())
}

/// Reject protected variables (case-insensitive name match) and null bytes in
/// names or string values. Non-string values are skipped.
pub fn validate_env(env: &Map<String, Value>) -> Result<(), SecurityError> {
    for (name, value) in env {
        if PROTECTED_ENV_VARS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(name))
        {
            return Err(SecurityError::ProtectedEnvVar(name.clone()));
        }
        if name.contains('\0') {
            return Err(SecurityError::NullByteRisk(format!(
                "environment variable '{name}'"
            )));
        }
        if let Some(value) = value.as_str() {
            if value.contains('\0') {
                return Err(SecurityError::NullByteRisk(format!(
                    "environment variable '{name}'"
                )));
            }
        }
    }
    Ok(())
}

/// Validate an untrusted JSON server configuration.
///
/// Pipeline order: shape, command, flags, injection, file access, env. The
/// first failure short-circuits. Missing `args`/`env` validate as empty.
pub fn validate_server_config(config: &Value) -> Result<(), SecurityError> {
    let Some(obj) = config.as_object() else {
        return Err(SecurityError::InvalidConfig);
    };
    let Some(command) = obj.get("command").and_then(Value::as_str) else {
        return Err(SecurityError::InvalidConfig);
    };
    let empty_args = Vec::new();
    let args = obj
        .get("args")
        .and_then(Value::as_array)
        .unwrap_or(&empty_args);
    let empty_env = Map::new();
    let env = obj
        .get("env")
        .and_then(Value::as_object)
        .unwrap_or(&empty_env);

    validate_command(command)?;
    validate_command_flags(command, args)?;
    validate_command_injection(args)?;
    validate_args_for_local_file_access(args)?;
    validate_env(env)?;
    Ok(())
}

/// Typed entry point used at the spawn site.
pub fn validate_stdio_config(config: &StdioServerConfig) -> Result<(), SecurityError> {
    let args: Vec<Value> = config
        .args
        .iter()
        .map(|arg| Value::String(arg.clone()))
        .collect();
    let env: Map<String, Value> = config
        .env
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect();

    validate_command(&config.command)?;
    validate_command_flags(&config.command, &args)?;
    validate_command_injection(&args)?;
    validate_args_for_local_file_access(&args)?;
    validate_env(&env)?;
    Ok(())
}
