//! Bench Manager - bench 生命周期管理
//!
//! Usage:
//! - Create: `bench-manager create shop --admin-tools`
//! - Start / stop: `bench-manager start shop`, `bench-manager stop shop`
//! - Workers: `bench-manager sync-workers shop [--force] [--rollback]`
//! - HTTPS: `bench-manager ssl-enable shop.example.com --email ops@example.com`
//! - Logs / shell: `bench-manager logs shop --follow`, `bench-manager shell shop --service nginx`

use anyhow::{anyhow, bail, Context};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use bench_manager::config::{AppSpec, BenchConfig};
use bench_manager::domain::{normalize_bench_name, EnvironmentType, SslCertificate, SslType};
use bench_manager::services::creation::{create_bench, CreateOptions, CreationOutcome};
use bench_manager::services::prompt::StdinPrompt;
use bench_manager::state::{get_shutdown_token, trigger_shutdown};
use bench_manager::{Bench, BenchContext, BenchError, EnvConfig, LoadOptions};

const DEFAULT_EXTENSIONS: &[&str] = &[
    "dbaeumer.vscode-eslint",
    "esbenp.prettier-vscode",
    "ms-python.black-formatter",
    "ms-python.debugpy",
    "ms-python.python",
];

#[derive(Debug, Default, PartialEq)]
struct CreateArgs {
    admin_pass: Option<String>,
    environment: Option<String>,
    apps: Vec<AppSpec>,
    frappe_branch: Option<String>,
    developer_mode: bool,
    admin_tools: bool,
    ssl: bool,
    email: Option<String>,
    template: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Create { bench: String, args: CreateArgs },
    Start { bench: String, force: bool },
    Stop { bench: String },
    Restart { bench: String },
    Remove { bench: String },
    Info { bench: String },
    Logs {
        bench: String,
        follow: bool,
        service: Option<String>,
    },
    Shell {
        bench: String,
        service: String,
        user: Option<String>,
    },
    SyncWorkers { bench: String, force: bool, rollback: bool },
    SslEnable { bench: String, email: Option<String> },
    SslDisable { bench: String },
    SslRenew { bench: String },
    AdminTools { bench: String, enable: bool },
    Attach {
        bench: String,
        user: String,
        workdir: String,
        extensions: Vec<String>,
        debugger: bool,
    },
    Help,
}

#[derive(Debug, PartialEq)]
struct Cli {
    verbose: bool,
    command: Command,
}

/// 解析命令行参数
fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut verbose = false;
    let mut positional = Vec::new();
    let mut flags: Vec<(String, Option<String>)> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--verbose" | "-v" => verbose = true,
            "--help" | "-h" => {
                return Ok(Cli {
                    verbose,
                    command: Command::Help,
                })
            }
            // 带值的选项
            "--admin-pass" | "--env" | "--apps" | "--frappe-branch" | "--email" | "--user"
            | "--workdir" | "--extension" | "--service" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| format!("{} requires a value", arg))?;
                flags.push((arg.to_string(), Some(value.clone())));
                i += 1;
            }
            _ if arg.starts_with("--") => flags.push((arg.to_string(), None)),
            _ => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let has = |name: &str| flags.iter().any(|(f, _)| f == name);
    let value = |name: &str| {
        flags
            .iter()
            .rev()
            .find(|(f, _)| f == name)
            .and_then(|(_, v)| v.clone())
    };

    let Some(command) = positional.first() else {
        return Ok(Cli {
            verbose,
            command: Command::Help,
        });
    };
    let bench = positional
        .get(1)
        .cloned()
        .ok_or_else(|| format!("{} requires a bench name", command))?;

    let command = match command.as_str() {
        "create" => Command::Create {
            bench,
            args: CreateArgs {
                admin_pass: value("--admin-pass"),
                environment: value("--env"),
                apps: value("--apps").map(|v| parse_apps(&v)).unwrap_or_default(),
                frappe_branch: value("--frappe-branch"),
                developer_mode: has("--developer-mode"),
                admin_tools: has("--admin-tools"),
                ssl: has("--ssl"),
                email: value("--email"),
                template: has("--template"),
            },
        },
        "start" => Command::Start {
            bench,
            force: has("--force"),
        },
        "stop" => Command::Stop { bench },
        "restart" => Command::Restart { bench },
        "remove" => Command::Remove { bench },
        "info" => Command::Info { bench },
        "logs" => Command::Logs {
            bench,
            follow: has("--follow"),
            service: value("--service"),
        },
        "shell" => Command::Shell {
            bench,
            service: value("--service").unwrap_or_else(|| "frappe".to_string()),
            user: value("--user"),
        },
        "sync-workers" => Command::SyncWorkers {
            bench,
            force: has("--force"),
            rollback: has("--rollback"),
        },
        "ssl-enable" => Command::SslEnable {
            bench,
            email: value("--email"),
        },
        "ssl-disable" => Command::SslDisable { bench },
        "ssl-renew" => Command::SslRenew { bench },
        "admin-tools" => match positional.get(2).map(String::as_str) {
            Some("enable") => Command::AdminTools { bench, enable: true },
            Some("disable") => Command::AdminTools { bench, enable: false },
            _ => return Err("admin-tools requires 'enable' or 'disable'".to_string()),
        },
        "attach" => {
            let mut extensions: Vec<String> = flags
                .iter()
                .filter(|(f, _)| f == "--extension")
                .filter_map(|(_, v)| v.clone())
                .collect();
            if extensions.is_empty() {
                extensions = DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect();
            }
            Command::Attach {
                bench,
                user: value("--user").unwrap_or_else(|| "frappe".to_string()),
                workdir: value("--workdir").unwrap_or_else(|| "/workspace".to_string()),
                extensions,
                debugger: has("--debugger"),
            }
        }
        other => return Err(format!("Unknown command: {}", other)),
    };

    Ok(Cli { verbose, command })
}

/// `erpnext:version-15,hrms` -> 应用列表
fn parse_apps(value: &str) -> Vec<AppSpec> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|spec| match spec.split_once(':') {
            Some((app, branch)) => AppSpec {
                app: app.to_string(),
                branch: Some(branch.to_string()),
            },
            None => AppSpec {
                app: spec.to_string(),
                branch: None,
            },
        })
        .collect()
}

fn print_help() {
    println!("Bench Manager - bench 生命周期管理");
    println!();
    println!("USAGE:");
    println!("    bench-manager [OPTIONS] <COMMAND> <BENCH> [ARGS]");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose    Debug logging");
    println!("    -h, --help       Print help information");
    println!();
    println!("COMMANDS:");
    println!("    create           Create a bench");
    println!("                       --admin-pass <PASS> --env <dev|prod> --apps <app[:branch],..>");
    println!("                       --frappe-branch <BRANCH> --developer-mode --admin-tools");
    println!("                       --ssl --email <EMAIL> --template");
    println!("    start            Start a bench (--force to recreate containers)");
    println!("    stop             Stop a bench");
    println!("    restart          Stop then start a bench");
    println!("    remove           Remove a bench, its database and files");
    println!("    info             Show bench information");
    println!("    logs             Show server log files or a service's logs (--follow, --service <S>)");
    println!("    shell            Open a shell in a service (--service <S>, --user <U>)");
    println!("    sync-workers     Regenerate workers (--force, --rollback)");
    println!("    ssl-enable       Issue a certificate (--email <EMAIL>)");
    println!("    ssl-disable      Revoke the certificate");
    println!("    ssl-renew        Renew the certificate");
    println!("    admin-tools      enable | disable Mailhog and Adminer");
    println!("    attach           Attach VS Code (--user, --workdir, --extension, --debugger)");
    println!();
    println!("ENVIRONMENT:");
    println!("    BENCH_MANAGER_HOME, BENCH_PROBE_ATTEMPTS, BENCH_PROBE_INTERVAL_MS, BENCH_PROBE_MODE,");
    println!("    BENCH_SUPERVISOR_WAIT_SECS, BENCH_CERT_COMMAND, BENCH_UID, BENCH_GID, RUST_LOG");
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_help();
            std::process::exit(2);
        }
    };

    if cli.command == Command::Help {
        print_help();
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
    let result = rt.block_on(run(cli));
    if let Some(message) = result.as_ref().err().and_then(precondition_message) {
        eprintln!("Error: {}", message);
        std::process::exit(1);
    }
    result
}

/// 前置条件错误只输出一行提示，不带错误链
fn precondition_message(err: &anyhow::Error) -> Option<String> {
    err.downcast_ref::<BenchError>()
        .filter(|e| e.is_precondition())
        .map(|e| e.to_string())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = EnvConfig::from_env();
    let _guard = bench_manager::logging::init_tracing(&settings.logs_dir, cli.verbose)
        .with_context(|| format!("Failed to initialize logging in {}", settings.logs_dir.display()))?;

    // Ctrl-C 取消正在进行的等待
    let _ = get_shutdown_token();
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            trigger_shutdown();
        }
    });

    let ctx = Arc::new(BenchContext::from_settings(settings, Arc::new(StdinPrompt)).await);

    match cli.command {
        Command::Help => print_help(),
        Command::Create { bench, args } => create(ctx, &bench, args).await?,
        Command::Start { bench, force } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            bench.start(force).await?;
        }
        Command::Stop { bench } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            bench.stop().await?;
        }
        Command::Restart { bench } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            bench.stop().await?;
            bench.start(false).await?;
        }
        Command::Remove { bench } => {
            let mut bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            if bench.remove_bench(true).await? {
                info!(bench = %bench.name(), "Bench removed");
            }
        }
        Command::Info { bench } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::reconcile()).await?;
            println!("{}", bench.info().await?);
        }
        Command::Logs {
            bench,
            follow,
            service,
        } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            let mut stdout = tokio::io::stdout();
            bench.logs(follow, service.as_deref(), &mut stdout).await?;
        }
        Command::Shell {
            bench,
            service,
            user,
        } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            bench.shell(&service, user.as_deref()).await?;
        }
        Command::SyncWorkers {
            bench,
            force,
            rollback,
        } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            if rollback {
                let restored = bench.restore_workers_supervisor_conf().await?;
                info!(bench = %bench.name(), restored, "Workers configuration restored");
            } else {
                let outcome = bench.sync_workers_compose(force).await?;
                info!(bench = %bench.name(), ?outcome, "Workers synced");
            }
        }
        Command::SslEnable { bench, email } => {
            let mut bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            let mut certificate = SslCertificate::new(bench.name(), SslType::LetsEncrypt);
            certificate.email = email;
            bench.update_certificate(certificate).await?;
        }
        Command::SslDisable { bench } => {
            let mut bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            let certificate = SslCertificate::none(bench.name());
            bench.update_certificate(certificate).await?;
        }
        Command::SslRenew { bench } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            bench.renew_certificate().await?;
        }
        Command::AdminTools { bench, enable } => {
            let mut bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            toggle_admin_tools(&mut bench, enable).await?;
        }
        Command::Attach {
            bench,
            user,
            workdir,
            extensions,
            debugger,
        } => {
            let bench = Bench::load(ctx, &bench, LoadOptions::default()).await?;
            bench
                .attach_to_bench(&user, &extensions, &workdir, debugger)
                .await?;
        }
    }
    Ok(())
}

async fn create(ctx: Arc<BenchContext>, name: &str, args: CreateArgs) -> anyhow::Result<()> {
    let name = normalize_bench_name(name);
    if ctx.settings.bench_path(&name).exists() {
        bail!("Bench {} already exists", name);
    }

    let mut config = BenchConfig::new(
        &name,
        args.admin_pass.unwrap_or_else(|| "admin".to_string()),
        PathBuf::new(),
    );
    if let Some(env) = args.environment {
        config.environment_type = EnvironmentType::parse(&env)
            .ok_or_else(|| anyhow!("Unknown environment type: {}", env))?;
    }
    if let Some(branch) = args.frappe_branch {
        config.frappe_branch = branch;
    }
    config.apps_list = args.apps;
    config.developer_mode = args.developer_mode;
    config.admin_tools = args.admin_tools;
    if args.ssl {
        config.ssl = SslCertificate::new(&name, SslType::LetsEncrypt);
        config.ssl.email = args.email;
    }

    let mut bench = Bench::new(ctx, config);
    let report = create_bench(
        &mut bench,
        CreateOptions {
            template: args.template,
        },
    )
    .await;

    match report.outcome {
        CreationOutcome::Created(info) => {
            println!("{}", info);
            Ok(())
        }
        CreationOutcome::Template => {
            println!("Template bench {} created", bench.name());
            Ok(())
        }
        CreationOutcome::Failed { at, error, .. } => {
            Err(anyhow!(error).context(format!("Bench creation failed after step '{}'", at)))
        }
    }
}

async fn toggle_admin_tools(bench: &mut Bench, enable: bool) -> anyhow::Result<()> {
    let restart_required = if enable {
        bench.sync_admin_tools_compose().await?
    } else {
        bench.admin_tools().disable().await?
    };

    bench.config.admin_tools = enable;
    bench.save_config().await?;

    if restart_required && bench.primary().is_running().await? {
        bench.restart_frappe_server().await?;
    }
    Ok(())
}
