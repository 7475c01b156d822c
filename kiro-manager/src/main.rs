mod backup;
mod config;
mod error;
mod fsutil;
mod machineid;
mod patch;
mod reset;
mod softreset;
mod token;
mod usage;

use crate::backup::{BackupRegistry, ORIGINAL_BACKUP_NAME};
use crate::config::{
    read_config, resolve_config_path, resolve_paths, Config, ResolvedPaths, DEFAULT_CONFIG_YAML,
};
use crate::error::{Interrupted, ManagerError};
use crate::fsutil::write_atomic;
use crate::machineid::{
    current_platform, derive_identifier, raw_identifier, Platform, PlatformKind,
};
use crate::patch::PatchEngine;
use crate::softreset::SoftResetController;
use crate::token::TokenSummary;
use crate::usage::{load_usage, UsageInfo};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kiro-manager", version, about = "Kiro account snapshot and machine-id manager")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the raw and hashed machine id
    MachineId,
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
    Usage {
        #[command(subcommand)]
        command: UsageCommand,
    },
    /// Substitute the machine id seen by the Kiro agent extension
    SoftReset {
        #[command(subcommand)]
        command: SoftResetCommand,
    },
    /// Replace the Windows MachineGuid (requires Administrator)
    Reset {
        #[arg(long)]
        skip_backup_check: bool,
        #[arg(long)]
        yes: bool,
    },
    Paths,
    Doctor,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    List,
    Create {
        name: String,
    },
    EnsureOriginal,
    Restore {
        name: String,
    },
    Delete {
        name: String,
        #[arg(long)]
        yes: bool,
    },
    Show {
        name: String,
    },
    UpdateToken {
        name: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        expires_at: String,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    Status,
}

#[derive(Subcommand, Debug)]
enum UsageCommand {
    /// Remaining credits from a saved GetUsageLimits response
    Balance { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum SoftResetCommand {
    Run,
    Restore,
    Status,
    Patch,
    Unpatch,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ErrorDetails {
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

/// A failed command, optionally with the partial result it reached.
#[derive(Debug)]
struct CommandError {
    error: ManagerError,
    progress: Option<Value>,
}

impl From<ManagerError> for CommandError {
    fn from(error: ManagerError) -> Self {
        Self {
            error,
            progress: None,
        }
    }
}

impl CommandError {
    fn interrupted<T: Serialize>(interrupted: Interrupted<T>) -> Self {
        Self {
            progress: serde_json::to_value(&interrupted.progress).ok(),
            error: interrupted.error,
        }
    }

    fn details(&self) -> ErrorDetails {
        ErrorDetails {
            error_code: self.error.code().to_string(),
            hint: self.error.hint().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

/// Loaded config plus everything derived from it for one invocation.
struct Environment {
    platform: Box<dyn Platform>,
    paths: ResolvedPaths,
}

impl Environment {
    fn load(ctx: &Context) -> Result<Self, ManagerError> {
        let cfg: Config = read_config(&ctx.config_path)?;
        let platform = current_platform(&cfg.machine_id);
        let paths = resolve_paths(&cfg, &ctx.config_path, platform.as_ref())?;
        tracing::debug!(platform = platform.name(), ?paths, "resolved environment");
        Ok(Self { platform, paths })
    }

    fn registry(&self) -> BackupRegistry<'_> {
        BackupRegistry::new(
            self.paths.backup_root.clone(),
            self.paths.auth_token.clone(),
            self.platform.as_ref(),
        )
    }

    fn patch_engine(&self) -> PatchEngine {
        PatchEngine::new(
            self.paths.extension_js.clone(),
            &self.paths.lock_dir,
            self.paths.override_file.clone(),
        )
    }

    fn soft_reset(&self) -> SoftResetController {
        SoftResetController::new(
            self.patch_engine(),
            self.paths.override_file.clone(),
            self.paths.sso_cache.clone(),
        )
    }

    /// Records the machine's first-seen id. Failure never blocks the
    /// command that triggered it.
    fn ensure_original(&self) {
        match self.registry().ensure_original() {
            Ok(true) => tracing::info!("created {ORIGINAL_BACKUP_NAME} backup"),
            Ok(false) => {}
            Err(err) => tracing::warn!("could not create {ORIGINAL_BACKUP_NAME} backup: {err}"),
        }
    }
}

fn main() -> Result<(), ManagerError> {
    init_tracing();
    let cli = Cli::parse();
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::MachineId => handle_machine_id(&ctx),
        Commands::Backup { command } => handle_backup(&ctx, command),
        Commands::Token { command } => handle_token(&ctx, command),
        Commands::Usage { command } => handle_usage(&ctx, command),
        Commands::SoftReset { command } => handle_soft_reset(&ctx, command),
        Commands::Reset {
            skip_backup_check,
            yes,
        } => handle_reset(&ctx, skip_backup_check, yes),
        Commands::Paths => handle_paths(&ctx),
        Commands::Doctor => handle_doctor(&ctx),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        let details = err.details();
        if ctx.json {
            let payload = JsonResult {
                ok: false,
                result: err.progress.clone(),
                error: Some(err.error.to_string()),
                error_details: Some(details),
            };
            print_json(&payload)?;
        } else {
            if let Some(progress) = &err.progress {
                eprintln!("Partial progress: {progress}");
            }
            eprintln!("{}", err.error);
            if let Some(hint) = details.hint {
                eprintln!("Hint: {hint}");
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("KIRO_MANAGER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_machine_id(ctx: &Context) -> Result<(), CommandError> {
    let env = Environment::load(ctx)?;
    let raw = raw_identifier(env.platform.as_ref())?;
    let derived = derive_identifier(&raw);
    let backed_up_by = match env.registry().find_by_machine_id(&raw) {
        Ok(name) => name,
        Err(err) => {
            tracing::warn!("could not scan backups: {err}");
            None
        }
    };
    emit(
        ctx,
        json!({
            "platform": env.platform.name(),
            "machine_id": raw,
            "derived": derived,
            "backed_up_by": backed_up_by,
        }),
        || {
            let mut text = format!("Machine ID: {raw}\nDerived:    {derived}");
            match &backed_up_by {
                Some(name) => text.push_str(&format!("\nBacked up in: {name}")),
                None => text.push_str("\nNot backed up yet."),
            }
            text
        },
    )
}

fn handle_backup(ctx: &Context, command: BackupCommand) -> Result<(), CommandError> {
    let env = Environment::load(ctx)?;
    if !matches!(command, BackupCommand::EnsureOriginal) {
        env.ensure_original();
    }
    let registry = env.registry();
    match command {
        BackupCommand::List => {
            let backups = registry.list()?;
            emit(
                ctx,
                json!({"root": registry.root(), "backups": backups}),
                || {
                    if backups.is_empty() {
                        return "No backups.".to_string();
                    }
                    backups
                        .iter()
                        .map(|b| {
                            format!(
                                "{:<24} {:<26} token:{:<3} machine-id:{}",
                                b.name,
                                b.backup_time
                                    .map(|t| t.to_rfc3339())
                                    .unwrap_or_else(|| "-".to_string()),
                                yes_no(b.has_token),
                                yes_no(b.has_machine_id)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                },
            )
        }
        BackupCommand::Create { name } => {
            let info = registry.create(&name)?;
            emit(ctx, json!({ "backup": info }), || {
                format!("Created backup {} at {}", info.name, info.path.display())
            })
        }
        BackupCommand::EnsureOriginal => {
            let created = registry.ensure_original()?;
            emit(
                ctx,
                json!({"name": ORIGINAL_BACKUP_NAME, "created": created}),
                || {
                    if created {
                        format!("Created {ORIGINAL_BACKUP_NAME} backup.")
                    } else {
                        format!("{ORIGINAL_BACKUP_NAME} backup already present.")
                    }
                },
            )
        }
        BackupCommand::Restore { name } => {
            registry.restore_token(&name)?;
            emit(
                ctx,
                json!({"name": name, "restored_to": env.paths.auth_token}),
                || format!("Restored token from {name}. Restart Kiro to pick it up."),
            )
        }
        BackupCommand::Delete { name, yes } => {
            // Surface not-found before prompting.
            registry.info(&name)?;
            if !confirm(ctx, yes, &format!("Delete backup {name}?"))? {
                return emit(ctx, json!({"name": name, "deleted": false}), || {
                    "Aborted.".to_string()
                });
            }
            registry.delete(&name)?;
            emit(ctx, json!({"name": name, "deleted": true}), || {
                format!("Deleted backup {name}.")
            })
        }
        BackupCommand::Show { name } => {
            let info = registry.info(&name)?;
            let machine_id = registry
                .read_machine_id(&name)
                .map_err(|err| tracing::debug!("machine id half unavailable: {err}"))
                .ok();
            let token = registry
                .read_token(&name)
                .map_err(|err| tracing::debug!("token half unavailable: {err}"))
                .ok();
            let summary = TokenSummary::from_token(token.as_ref(), Utc::now());
            emit(
                ctx,
                json!({"backup": info, "machine_id": machine_id, "token": summary}),
                || {
                    let mut lines = vec![format!("Backup:     {}", info.name)];
                    lines.push(format!(
                        "Machine ID: {}",
                        machine_id
                            .as_ref()
                            .map(|m| m.machine_id.as_str())
                            .unwrap_or("-")
                    ));
                    lines.push(token_line(&summary));
                    lines.join("\n")
                },
            )
        }
        BackupCommand::UpdateToken {
            name,
            access_token,
            expires_at,
        } => {
            let token = registry.update_token(&name, &access_token, &expires_at)?;
            let summary = TokenSummary::from_token(Some(&token), Utc::now());
            emit(ctx, json!({"name": name, "token": summary}), || {
                format!("Updated token in {name}; expires at {expires_at}.")
            })
        }
    }
}

fn handle_token(ctx: &Context, command: TokenCommand) -> Result<(), CommandError> {
    match command {
        TokenCommand::Status => {
            let env = Environment::load(ctx)?;
            let summary = TokenSummary::load(&env.paths.auth_token, Utc::now());
            emit(
                ctx,
                json!({"path": env.paths.auth_token, "token": summary}),
                || token_line(&summary),
            )
        }
    }
}

fn handle_usage(ctx: &Context, command: UsageCommand) -> Result<(), CommandError> {
    match command {
        UsageCommand::Balance { file } => {
            let usage = load_usage(&file);
            emit(ctx, json!({"path": file, "usage": usage}), || {
                usage_line(&usage)
            })
        }
    }
}

fn handle_soft_reset(ctx: &Context, command: SoftResetCommand) -> Result<(), CommandError> {
    let env = Environment::load(ctx)?;
    let controller = env.soft_reset();
    match command {
        SoftResetCommand::Run => {
            env.ensure_original();
            let result = controller
                .soft_reset()
                .map_err(CommandError::interrupted)?;
            emit(ctx, json!(result), || {
                format!(
                    "Soft reset complete.\nNew machine ID: {}\nRestart Kiro and sign in again.",
                    result.new_machine_id
                )
            })
        }
        SoftResetCommand::Restore => {
            env.ensure_original();
            controller.restore_original()?;
            emit(ctx, json!({"restored": true}), || {
                "Override removed; Kiro will see the real machine id after restart.".to_string()
            })
        }
        SoftResetCommand::Status => {
            let status = controller.status();
            emit(ctx, json!(status), || {
                format!(
                    "Patched:    {}\nCustom ID:  {}\nExtension:  {}",
                    yes_no(status.is_patched),
                    if status.has_custom_id {
                        status.custom_machine_id.as_str()
                    } else {
                        "-"
                    },
                    if status.extension_path.is_empty() {
                        "not found"
                    } else {
                        status.extension_path.as_str()
                    }
                )
            })
        }
        SoftResetCommand::Patch => {
            let engine = controller.engine();
            let changed = engine.apply()?;
            let state = engine.detect()?;
            emit(
                ctx,
                json!({"path": engine.artifact(), "changed": changed, "state": state}),
                || format!("extension.js is {}", state.label()),
            )
        }
        SoftResetCommand::Unpatch => {
            let engine = controller.engine();
            let changed = engine.remove()?;
            let state = engine.detect()?;
            emit(
                ctx,
                json!({"path": engine.artifact(), "changed": changed, "state": state}),
                || format!("extension.js is {}", state.label()),
            )
        }
    }
}

fn handle_reset(ctx: &Context, skip_backup_check: bool, yes: bool) -> Result<(), CommandError> {
    let env = Environment::load(ctx)?;
    env.ensure_original();
    if env.platform.kind() != PlatformKind::Windows {
        return Err(ManagerError::NotWindows.into());
    }
    if !confirm(
        ctx,
        yes,
        "Replace the system MachineGuid and clear the SSO cache?",
    )? {
        return emit(ctx, json!({"reset": false}), || "Aborted.".to_string());
    }
    let registry = env.registry();
    let result = reset::reset_environment(
        env.platform.as_ref(),
        &registry,
        &env.paths.sso_cache,
        skip_backup_check,
    )
    .map_err(CommandError::interrupted)?;
    emit(ctx, json!(result), || {
        format!(
            "Machine ID changed.\nOld: {}\nNew: {}\nRestart Kiro and sign in again.",
            result.old_machine_id, result.new_machine_id
        )
    })
}

fn handle_paths(ctx: &Context) -> Result<(), CommandError> {
    let env = Environment::load(ctx)?;
    let mut payload = serde_json::to_value(&env.paths).map_err(ManagerError::from)?;
    if let Value::Object(map) = &mut payload {
        map.insert("platform".to_string(), json!(env.platform.name()));
    }
    emit(ctx, payload.clone(), || {
        payload
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(key, value)| {
                        format!("{key:<14} {}", value.as_str().unwrap_or("-"))
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    })
}

fn handle_doctor(ctx: &Context) -> Result<(), CommandError> {
    let env = Environment::load(ctx)?;
    let mut checks = BTreeMap::new();

    let platform_ok = env.platform.kind() != PlatformKind::Other;
    checks.insert("platform_supported", platform_ok);

    let probe_ok = match env.platform.kind() {
        PlatformKind::Windows => which::which("reg").is_ok(),
        PlatformKind::MacOs => which::which("ioreg").is_ok(),
        PlatformKind::Linux => true,
        PlatformKind::Other => false,
    };
    checks.insert("probe_tool", probe_ok);

    let machine_id_ok = raw_identifier(env.platform.as_ref()).is_ok();
    checks.insert("machine_id_readable", machine_id_ok);

    let install_ok = env
        .paths
        .install_dir
        .as_ref()
        .map(|dir| dir.exists())
        .unwrap_or(false);
    checks.insert("install_dir_found", install_ok);

    let extension_ok = env.paths.extension_js.is_file();
    checks.insert("extension_found", extension_ok);

    let backup_ok = fs::create_dir_all(&env.paths.backup_root)
        .and_then(|_| {
            let test_path = env.paths.backup_root.join(".kiro_manager_write_test");
            fs::write(&test_path, b"ok")?;
            fs::remove_file(&test_path)
        })
        .is_ok();
    checks.insert("backup_root_writable", backup_ok);

    checks.insert("auth_token_present", env.paths.auth_token.is_file());

    let failed: Vec<&str> = [
        ("platform is not supported", platform_ok),
        ("identifier probe tool is missing", probe_ok),
        ("machine id cannot be read", machine_id_ok),
        ("backup root is not writable", backup_ok),
    ]
    .into_iter()
    .filter(|(_, ok)| !ok)
    .map(|(msg, _)| msg)
    .collect();
    let ok = failed.is_empty();

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({"checks": checks, "platform": env.platform.name()})),
            error: (!ok).then(|| failed.join("; ")),
            error_details: None,
        };
        print_json(&payload)?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    for (name, passed) in &checks {
        println!("{:<22} {}", name, if *passed { "ok" } else { "missing" });
    }
    if !ok {
        return Err(ManagerError::Process(failed.join("; ")).into());
    }
    Ok(())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), CommandError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return emit(
                    ctx,
                    json!({"path": ctx.config_path, "created": false}),
                    || format!("Config already exists at {}", ctx.config_path.display()),
                );
            }
            write_atomic(&ctx.config_path, DEFAULT_CONFIG_YAML.as_bytes())?;
            emit(ctx, json!({"path": ctx.config_path, "created": true}), || {
                format!("Wrote {}", ctx.config_path.display())
            })
        }
        ConfigCommand::Validate => {
            let exists = ctx.config_path.exists();
            read_config(&ctx.config_path)?;
            emit(
                ctx,
                json!({"path": ctx.config_path, "exists": exists, "valid": true}),
                || format!("{} is valid", ctx.config_path.display()),
            )
        }
    }
}

fn confirm(ctx: &Context, yes: bool, prompt: &str) -> Result<bool, ManagerError> {
    if yes {
        return Ok(true);
    }
    if ctx.json || !io::stdin().is_terminal() {
        return Err(ManagerError::Process(format!(
            "{prompt} needs confirmation; re-run with --yes"
        )));
    }
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn token_line(summary: &TokenSummary) -> String {
    if !summary.present {
        return "Token: none".to_string();
    }
    format!(
        "Token: {} ({}) expires {}{}",
        if summary.provider.is_empty() {
            "unknown provider"
        } else {
            summary.provider.as_str()
        },
        if summary.auth_method.is_empty() {
            "-"
        } else {
            summary.auth_method.as_str()
        },
        if summary.expires_at.is_empty() {
            "-"
        } else {
            summary.expires_at.as_str()
        },
        if summary.expired { " [expired]" } else { "" }
    )
}

fn usage_line(usage: &UsageInfo) -> String {
    if usage.usage_limit == 0.0 {
        return "Usage: unavailable".to_string();
    }
    format!(
        "{}: {:.2} of {:.2} left ({:.2} used){}",
        if usage.subscription_title.is_empty() {
            "Usage"
        } else {
            usage.subscription_title.as_str()
        },
        usage.balance,
        usage.usage_limit,
        usage.current_usage,
        if usage.is_low_balance { " [low]" } else { "" }
    )
}

fn emit(ctx: &Context, payload: Value, human: impl FnOnce() -> String) -> Result<(), CommandError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", human());
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), ManagerError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
