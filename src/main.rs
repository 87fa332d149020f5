use anyhow::bail;
use clap::Parser;
use inquire::error::InquireResult;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod app;
mod bookmarks;
mod cli;
mod config;
mod lock;
mod semantic;
#[cfg(test)]
mod tests;

use app::App;
use bookmarks::{BookmarkChange, BookmarkNode, BookmarkSource};
use cli::{Command, EventArgs};
use lock::FileLock;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let base_path = config::base_path()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let app = App::new(&base_path);
    let result = runtime.block_on(run(&app, args.command));
    app.close()?;
    result
}

async fn run(app: &App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Index { source, yes } => {
            let _lock = FileLock::try_acquire(app.base_path())?;
            let settings = app.settings.load()?;
            let count = app.store.count()?;

            if settings.reindex_required() && count > 0 && !yes {
                let prompt = format!(
                    "The index was built with {}. Rebuild it with {}? This removes {} indexed bookmarks.",
                    settings
                        .indexed_label()
                        .unwrap_or_else(|| "another provider".to_string()),
                    settings.active_label(),
                    count
                );
                if !confirm(&prompt)? {
                    return Ok(());
                }
            }

            let tree = app.bookmark_source(source.bookmarks)?.tree()?;
            let cancel = cancel_on_ctrl_c();
            let (bar, progress) = spawn_progress_bar(app);

            let report = app.indexer.build_index(&tree, &cancel).await;
            progress.abort();
            bar.finish_and_clear();
            print_json(&report?)
        }

        Command::Sync { source } => {
            let _lock = FileLock::try_acquire(app.base_path())?;
            let tree = app.bookmark_source(source.bookmarks)?.tree()?;
            let report = app.indexer.sync(&tree, &cancel_on_ctrl_c()).await?;
            print_json(&report)
        }

        Command::Search {
            query,
            top_k,
            semantic_only,
            source,
        } => {
            let source = if semantic_only {
                None
            } else {
                match app.bookmark_source(source.bookmarks) {
                    Ok(source) => Some(source),
                    Err(e) => {
                        log::warn!("keyword search disabled: {}", e);
                        None
                    }
                }
            };

            let output = app
                .search(
                    source.as_ref().map(|s| s as &dyn BookmarkSource),
                    &query,
                    top_k,
                    semantic_only,
                )
                .await?;

            if let Some(message) = &output.semantic_error {
                eprintln!("{}", message);
            } else if output.reindex_required {
                eprintln!("The index was built with another provider or model. Run `semmark index` to rebuild it.");
            }
            print_json(&output.hits)
        }

        Command::Status {} => print_json(&app.search.status()?),

        Command::Clear { yes } => {
            let _lock = FileLock::try_acquire(app.base_path())?;
            let count = app.store.count()?;
            if !yes && !confirm(&format!("Remove all {} indexed bookmarks?", count))? {
                return Ok(());
            }
            let removed = app.clear()?;
            println!("{} items removed", removed);
            Ok(())
        }

        Command::Event { event } => {
            let _lock = FileLock::try_acquire(app.base_path())?;
            let outcome = match event {
                EventArgs::Created { id, title, url } => {
                    let node = BookmarkNode {
                        id,
                        title,
                        url,
                        date_added: Some(chrono::Utc::now().timestamp_millis()),
                        children: vec![],
                    };
                    app.indexer.on_created(&node).await?
                }
                EventArgs::Removed { id } => app.indexer.on_removed(&id)?,
                EventArgs::Changed { id, title, url } => {
                    app.indexer
                        .on_changed(&id, &BookmarkChange { title, url })
                        .await?
                }
            };
            print_json(&outcome)
        }

        Command::Provider { kind } => {
            app.settings.set_active_provider(kind)?;
            if app.settings.load()?.reindex_required() {
                println!("Active provider set to {}. Run `semmark index` to rebuild the index.", kind);
            } else {
                println!("Active provider set to {}", kind);
            }
            Ok(())
        }

        Command::Token { kind, token } => {
            if !kind.is_remote() {
                bail!("{} does not use an API token", kind);
            }
            app.settings.set_token(kind, &token)?;
            println!("Token for {} updated", kind);
            Ok(())
        }

        Command::BaseUrl { kind, url } => {
            if !kind.is_remote() {
                bail!("{} does not use a base url", kind);
            }
            app.settings.set_base_url(kind, &url)?;
            println!("Base url for {} updated", kind);
            Ok(())
        }
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    match inquire::prompt_confirmation(prompt) {
        InquireResult::Ok(answer) => Ok(answer),
        InquireResult::Err(err) => bail!("An error occurred: {}", err),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupted, stopping after the current bookmark");
                cancel.cancel();
            }
        }
    });
    cancel
}

fn spawn_progress_bar(app: &App) -> (indicatif::ProgressBar, tokio::task::JoinHandle<()>) {
    let mut progress = app.indexer.subscribe();
    let bar = indicatif::ProgressBar::new(0);
    bar.set_style(
        indicatif::ProgressStyle::with_template("{bar:40} {pos}/{len} indexed")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
    );

    let handle = tokio::spawn({
        let bar = bar.clone();
        async move {
            while progress.changed().await.is_ok() {
                let current = *progress.borrow_and_update();
                bar.set_length(current.total as u64);
                bar.set_position(current.indexed as u64);
            }
        }
    });

    (bar, handle)
}
