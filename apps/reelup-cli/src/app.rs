use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use reelup_protocol::{TaskStatus, UploadEvent};
use reelup_task_store::{FileTaskStore, TaskStore};
use reelup_transfer::{FileRef, FileSource, TaskId, UploadTask};
use reelup_transport::{HttpTransport, TransportClient};
use reelup_uploader::{
    NetworkSignals, PathResolver, RetryPolicy, UploadCoordinator, WorkerBridge,
};
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cli::Command;
use crate::config::Config;

pub async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    let store_dir = config.store_dir()?;
    let store: Arc<dyn TaskStore> = Arc::new(
        FileTaskStore::new(store_dir.clone())
            .with_context(|| format!("opening task store at {}", store_dir.display()))?,
    );

    match command {
        Command::Upload {
            file,
            title,
            description,
            meta,
        } => {
            let metadata = build_metadata(&file, title, description, &meta)?;
            upload(&config, store, &file, metadata).await
        }
        Command::Resume => resume(&config, store).await,
        Command::List { status } => list(store.as_ref(), status),
        Command::Show { id } => show(store.as_ref(), &TaskId::from_string(id)),
        Command::Purge { id } => {
            let id = TaskId::from_string(id);
            if store.purge(&id)? {
                println!("purged {id}");
                Ok(())
            } else {
                bail!("no upload {id}")
            }
        }
    }
}

fn build_coordinator(
    config: &Config,
    store: Arc<dyn TaskStore>,
) -> anyhow::Result<UploadCoordinator> {
    let transport: Arc<dyn TransportClient> = Arc::new(HttpTransport::new(config.transport_config())?);
    let uploader = config.uploader_config();
    let retry = RetryPolicy::new(uploader.retry.clone());

    let mut builder = UploadCoordinator::builder(store, Arc::clone(&transport)).config(uploader);
    if config.background {
        match WorkerBridge::spawn(transport, retry, NetworkSignals::always_online()) {
            Ok(bridge) => builder = builder.bridge(Arc::new(bridge)),
            Err(e) => warn!(error = %e, "background worker unavailable, uploading in foreground"),
        }
    }
    Ok(builder.build())
}

async fn upload(
    config: &Config,
    store: Arc<dyn TaskStore>,
    path: &Path,
    metadata: Value,
) -> anyhow::Result<()> {
    let file = FileRef::from_path(path).with_context(|| format!("reading {}", path.display()))?;
    let source = Arc::new(FileSource::open(path)?);

    let coordinator = build_coordinator(config, store)?;
    let printer = print_events(coordinator.subscribe());
    let id = coordinator.create_upload(file, metadata, source).await?;
    println!("upload {id} started");

    let result = finish(&coordinator, &[id]).await;
    printer.abort();
    result
}

async fn resume(config: &Config, store: Arc<dyn TaskStore>) -> anyhow::Result<()> {
    let coordinator = build_coordinator(config, store)?;
    let printer = print_events(coordinator.subscribe());
    let ids = coordinator.initialize(&PathResolver).await?;
    if ids.is_empty() {
        println!("nothing to resume");
    }

    let result = finish(&coordinator, &ids).await;
    printer.abort();
    result
}

/// Waits for `ids` to settle, or stops everything on Ctrl-C.
async fn finish(coordinator: &UploadCoordinator, ids: &[TaskId]) -> anyhow::Result<()> {
    let settled = async {
        for id in ids {
            coordinator.wait_idle(id).await;
        }
    };

    tokio::select! {
        _ = settled => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("SIGINT received, stopping uploads");
            coordinator.shutdown().await;
            println!("interrupted; run `reelup resume` to continue");
            return Ok(());
        }
    }
    coordinator.shutdown().await;

    let mut failed = 0;
    for id in ids {
        match coordinator.task(id).await? {
            Some(task) if task.status == TaskStatus::Completed => {}
            Some(task) => {
                failed += 1;
                let reason = task.last_error.as_deref().unwrap_or("unknown error");
                eprintln!("{id}: {} ({reason})", task.status);
            }
            None => failed += 1,
        }
    }
    if failed > 0 {
        bail!("{failed} upload(s) did not complete");
    }
    Ok(())
}

fn print_events(mut rx: broadcast::Receiver<UploadEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(UploadEvent::UploadProgress { task_id, progress }) => {
                    println!("{task_id}: {progress:>3}%");
                }
                Ok(UploadEvent::UploadComplete { task_id }) => println!("{task_id}: complete"),
                Ok(UploadEvent::UploadError { task_id, error }) => {
                    eprintln!("{task_id}: error: {error}");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn list(store: &dyn TaskStore, status: Option<TaskStatus>) -> anyhow::Result<()> {
    let tasks = match status {
        Some(status) => store.list_by_status(status)?,
        None => store.list()?,
    };
    if tasks.is_empty() {
        println!("no uploads");
        return Ok(());
    }
    for task in &tasks {
        println!("{}", summary_line(task));
    }
    Ok(())
}

fn show(store: &dyn TaskStore, id: &TaskId) -> anyhow::Result<()> {
    let task = store.get(id)?.with_context(|| format!("no upload {id}"))?;
    println!("{}", summary_line(&task));
    if let Some(path) = &task.file_ref.path {
        println!("  path:     {}", path.display());
    }
    println!("  type:     {}", task.file_ref.content_type);
    println!("  created:  {}", task.created_at.to_rfc3339());
    println!("  updated:  {}", task.updated_at.to_rfc3339());
    println!("  retries:  {}", task.retry_count);
    println!("  metadata: {}", task.metadata);
    if let Some(error) = &task.last_error {
        println!("  error:    {error}");
    }
    if let Some(result) = &task.server_result {
        println!("  result:   {result}");
    }
    let pending: Vec<String> = task
        .pending_chunks()
        .iter()
        .map(|c| c.index.to_string())
        .collect();
    if !pending.is_empty() {
        println!("  pending:  {}", pending.join(","));
    }
    Ok(())
}

fn summary_line(task: &UploadTask) -> String {
    format!(
        "{}  {:<9}  {:>3}%  {}/{} chunks  {}",
        task.id,
        task.status,
        task.progress_percent(),
        task.uploaded_chunks(),
        task.total_chunks(),
        task.file_ref.name
    )
}

/// Finalize metadata: title (file name by default), description, then `--meta` pairs.
fn build_metadata(
    file: &Path,
    title: Option<String>,
    description: Option<String>,
    meta: &[String],
) -> anyhow::Result<Value> {
    let mut map = Map::new();
    let title = title.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    map.insert("title".into(), Value::String(title));
    if let Some(description) = description {
        map.insert("description".into(), Value::String(description));
    }
    for pair in meta {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --meta {pair:?}, expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --meta {pair:?}, empty key");
        }
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(map))
}
