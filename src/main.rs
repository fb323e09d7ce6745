mod config;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gdbadapter::{Breakpoint, Commands, GdbAdapter, ProcessInfo};
use qconn::{FileService, PairingEvent, QConnChannel, SecurePairing, TargetFile};
use serde::Serialize;

use config::{Args, Command, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    config.merge_args(&args);
    config.validate()?;

    let level = config.log.level_filter()?;
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .with_module_level("gdbadapter", level)
        .with_module_level("qconn", level)
        .init()
        .context("Failed to initialize logger")?;

    if args.show_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    log::info!("targetlink starting, target {}", config.target.host);

    match &args.command {
        Some(Command::Pair { password, ssh_key }) => pair(&config, password, ssh_key).await,
        Some(Command::Info) => info(&config, args.json).await,
        Some(Command::Ls { path }) => ls(&config, path, args.json).await,
        Some(Command::Gdb { attach, symbols }) => {
            gdb(&config, attach.as_deref(), symbols.as_deref(), args.json).await
        }
        None => {
            log::warn!("No command given, try --help");
            Ok(())
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn pair(config: &Config, password: &str, ssh_key: &std::path::Path) -> Result<()> {
    let key = std::fs::read_to_string(ssh_key)
        .with_context(|| format!("Failed to read public key {}", ssh_key.display()))?;

    let pairing = SecurePairing::new(config.target.pairing())?;
    let mut events = pairing.subscribe();

    pairing.connect(password, &key).await?;
    pairing.keep_alive(Duration::from_millis(config.target.keep_alive_ms))?;
    println!("Paired with {}, press Ctrl+C to disconnect", config.target.host);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(PairingEvent::NotAuthenticated) => {
                    pairing.close().await;
                    bail!("Lost connection to {}", config.target.host);
                }
                Ok(PairingEvent::Authenticated) => {}
                Err(e) => log::debug!("Pairing event stream: {}", e),
            },
        }
    }

    pairing.close().await;
    Ok(())
}

#[derive(Serialize)]
struct TargetInfo {
    properties: std::collections::BTreeMap<String, String>,
    services: Vec<String>,
}

async fn info(config: &Config, json: bool) -> Result<()> {
    let target = &config.target;
    let mut channel = QConnChannel::open(&target.host, target.qconn_port, target.transport(), None).await?;

    let properties = channel.info().await?.into_iter().collect();
    let services = channel.services().await?;
    let endian = channel.endian().await?;
    channel.close().await;

    let info = TargetInfo { properties, services };
    if json {
        return print_json(&info);
    }

    for (key, value) in &info.properties {
        println!("{:<16} {}", key, value);
    }
    println!("{:<16} {:?}", "byte order", endian);
    println!("{:<16} {}", "services", info.services.join(" "));
    Ok(())
}

async fn ls(config: &Config, path: &str, json: bool) -> Result<()> {
    let target = &config.target;
    let mut files = FileService::open(&target.host, target.qconn_port, target.transport()).await?;

    let result = list_entries(&mut files, path).await;
    files.close().await;
    let entries = result?;

    if json {
        return print_json(&entries);
    }
    for entry in &entries {
        println!(
            "{}{:04o} {:>6} {:>6} {:>12}  {}",
            entry.type_char(),
            entry.permissions(),
            entry.uid,
            entry.gid,
            entry.size,
            entry.name()
        );
    }
    Ok(())
}

async fn list_entries(files: &mut FileService, path: &str) -> Result<Vec<TargetFile>> {
    let base = path.trim_end_matches('/');
    let mut entries = Vec::new();
    for name in files.list(path).await? {
        let child = format!("{}/{}", base, name);
        match files.stat(&child).await {
            Ok(entry) => entries.push(entry),
            Err(e) => log::warn!("Unable to stat {}: {}", child, e),
        }
    }
    Ok(entries)
}

async fn gdb(config: &Config, attach: Option<&str>, symbols: Option<&str>, json: bool) -> Result<()> {
    gdbadapter::process::install_signal_protection();

    let mut adapter = GdbAdapter::new(config.gdb.clone());
    let session = adapter.start_session().await?;
    let commands = Commands::new(session.ids().clone());

    let result = drive_gdb(&adapter, &commands, config, attach, symbols, json).await;
    adapter.stop_session().await?;
    result
}

async fn drive_gdb(
    adapter: &GdbAdapter,
    commands: &Commands,
    config: &Config,
    attach: Option<&str>,
    symbols: Option<&str>,
    json: bool,
) -> Result<()> {
    let target = &config.target;
    let select = commands.target_select_qnx(&target.host, target.qconn_port, target.gdb_retries)?;
    let response = adapter.execute(select).await?;
    if response.is_error() {
        bail!(
            "Unable to select target {}: {}",
            target.host,
            response.error_message().unwrap_or_default()
        );
    }

    let response = adapter.execute(commands.process_list()?).await?;
    let processes = ProcessInfo::parse_list(&response);

    let Some(executable) = attach else {
        if json {
            return print_json(&processes);
        }
        for process in &processes {
            println!("{:>8}  {}", process.pid, process.executable);
        }
        return Ok(());
    };

    let process = ProcessInfo::find(&processes, executable)
        .with_context(|| format!("No process running {} on {}", executable, target.host))?;
    let group = commands.attach(symbols.unwrap_or(&process.executable), process.pid)?;
    let response = adapter.execute(group).await?;
    if response.is_error() {
        bail!(
            "Unable to attach to {}: {}",
            process.pid,
            response.error_message().unwrap_or_default()
        );
    }
    log::info!("Attached to {} ({})", process.name(), process.pid);

    let insert = commands.break_insert("main")?;
    let command = insert.command().to_string();
    let breakpoint = adapter.execute(insert).await?;
    if json {
        match Breakpoint::from_response(&breakpoint) {
            Ok(bkpt) => print_json(&bkpt)?,
            Err(e) => log::warn!("No breakpoint on main: {}", e),
        }
        return Ok(());
    }

    // number;file;line;addr;location
    match commands.extract(&command, &breakpoint)?.as_slice() {
        [number, file, line, addr, location] if !number.is_empty() => {
            let addr = if addr.is_empty() { "<pending>" } else { addr.as_str() };
            if file.is_empty() {
                println!("Breakpoint {} on {} at {}", number, location, addr);
            } else {
                println!("Breakpoint {} on {} at {} ({}:{})", number, location, addr, file, line);
            }
        }
        _ => log::warn!(
            "No breakpoint on main: {}",
            breakpoint.error_message().unwrap_or_default()
        ),
    }
    Ok(())
}
