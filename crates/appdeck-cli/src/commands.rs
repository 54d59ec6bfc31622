use std::io::{self, Write};
use std::process::Command;
use std::sync::{mpsc, Arc};

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use appdeck_installer::{
    ApplicationRegistry, FileApplicationRegistry, LocationRegistry, MountTable, Reconciler,
    TaskEngine, TaskEvent,
};
use appdeck_sudo::{spawn_helper, SudoClient, SudoServer};

use crate::config::InstallerConfig;

pub struct App {
    pub engine: TaskEngine,
    pub events: mpsc::Receiver<TaskEvent>,
    pub registry: Arc<FileApplicationRegistry>,
    pub locations: Arc<LocationRegistry>,
}

// Brings the whole stack up: privileged helper, application registry,
// startup reconciliation, task engine. Nothing accepts work until the
// reconciler has succeeded.
pub fn bootstrap(config: &InstallerConfig) -> Result<App> {
    let paths = config.paths();
    paths.ensure_base_dirs()?;
    let locations = Arc::new(config.location_registry()?);
    let registry = Arc::new(FileApplicationRegistry::load(&paths)?);

    let sudo = Arc::new(connect_sudo(config)?);
    if sudo.is_fallback() {
        warn!(target: "cli",
            "no privileged helper; filesystem operations run with this user's rights");
    }

    Reconciler::new(&sudo, &locations, registry.as_ref(), &paths)
        .run()
        .context("startup reconciliation failed")?;

    let (sender, events) = mpsc::channel();
    let engine = TaskEngine::new(
        sudo,
        locations.clone(),
        registry.clone() as Arc<dyn ApplicationRegistry>,
        paths,
        config.settings(),
        sender,
    )?;

    Ok(App {
        engine,
        events,
        registry,
        locations,
    })
}

// Re-executes this binary as the privileged helper, talking over its stdio.
// When that fails (not packaged setuid, no root) the same operations run
// in-process so development setups keep working.
fn connect_sudo(config: &InstallerConfig) -> Result<SudoClient> {
    let exe = std::env::current_exe().context("failed to determine the current executable")?;
    let mut command = Command::new(exe);
    command.arg("sudo-helper");
    for root in config.allowed_roots() {
        command.arg("--allowed-root").arg(root);
    }

    match spawn_helper(&mut command) {
        Ok(client) => Ok(client),
        Err(err) => {
            warn!(target: "cli", error = %format!("{err:#}"),
                "could not spawn the privileged helper, using in-process fallback");
            Ok(SudoClient::fallback(SudoServer::new(config.allowed_roots())))
        }
    }
}

pub fn install(app: &App, url: &str, location: Option<&str>, assume_yes: bool) -> Result<()> {
    let task_id = app.engine.enqueue_install(url, location);
    let bar = progress_bar("downloading");

    loop {
        let event = app
            .events
            .recv()
            .context("the task engine stopped unexpectedly")?;
        match event {
            TaskEvent::Progress {
                task_id: id,
                progress,
            } if id == task_id => {
                bar.set_position((progress * 100.0) as u64);
            }
            TaskEvent::RequestingAcknowledge {
                task_id: id,
                header,
            } if id == task_id => {
                bar.finish_and_clear();
                println!("package:  {} {}", header.application_id, header.version);
                println!("name:     {}", header.display_name());
                if !header.capabilities.is_empty() {
                    println!("requests: {}", header.capabilities.join(", "));
                }
                if assume_yes || confirm("install this package?")? {
                    app.engine.acknowledge(&task_id);
                } else {
                    app.engine.cancel(&task_id);
                }
            }
            TaskEvent::Finished { task_id: id } if id == task_id => {
                bar.finish_and_clear();
                let application_id = app
                    .engine
                    .task_application_id(&task_id)
                    .unwrap_or_default();
                println!("installed {application_id}");
                return Ok(());
            }
            TaskEvent::Failed { task_id: id, error } if id == task_id => {
                bar.finish_and_clear();
                return Err(anyhow!("installation failed: {error}"));
            }
            _ => {}
        }
    }
}

pub fn remove(app: &App, application_id: &str, keep_documents: bool, force: bool) -> Result<()> {
    let task_id = app.engine.enqueue_removal(application_id, keep_documents, force);
    wait_for_task(app, &task_id)?;
    println!("removed {application_id}");
    Ok(())
}

pub fn activate(app: &App, application_id: &str, activate: bool) -> Result<()> {
    let task_id = app.engine.enqueue_activation(application_id, activate);
    wait_for_task(app, &task_id)?;
    println!(
        "{} {application_id}",
        if activate { "activated" } else { "deactivated" }
    );
    Ok(())
}

fn wait_for_task(app: &App, task_id: &str) -> Result<()> {
    loop {
        let event = app
            .events
            .recv()
            .context("the task engine stopped unexpectedly")?;
        match event {
            TaskEvent::Finished { task_id: id } if id == task_id => return Ok(()),
            TaskEvent::Failed { task_id: id, error } if id == task_id => {
                return Err(anyhow!("{error}"));
            }
            _ => {}
        }
    }
}

pub fn list(app: &App) {
    for record in app.registry.applications() {
        let location = record
            .report
            .map(|report| report.installation_location_id)
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{}  {}  {}",
            record.header.application_id, record.header.version, location
        );
    }
}

pub fn locations(app: &App) -> Result<()> {
    let mounts = MountTable::read()?;
    for location in app.locations.list() {
        let mut notes = Vec::new();
        if location.is_default {
            notes.push("default".to_string());
        }
        if location.is_removable() {
            notes.push(if location.is_mounted(&mounts) {
                "mounted".to_string()
            } else {
                "not mounted".to_string()
            });
        }
        let space = match location.disk_usage() {
            Ok(usage) => format!(
                "{} MiB free of {} MiB",
                usage.free_bytes / (1024 * 1024),
                usage.total_bytes / (1024 * 1024)
            ),
            Err(_) => "space unknown".to_string(),
        };

        println!("{}  {}  {}", location.id(), space, notes.join(", "));
        println!("  apps: {}", location.installation_path.display());
        println!("  docs: {}", location.document_path.display());
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush().context("failed to write prompt")?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("failed to read answer")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn progress_bar(label: &str) -> ProgressBar {
    let bar = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg:<12} [{bar:20}] {percent:>3}%")
    {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.set_message(label.to_string());
    bar
}
