use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::config::ProviderKind;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SourceArgs {
    /// Chrome `Bookmarks` file. Defaults to `bookmarks_file` from config.yaml
    #[clap(short, long)]
    pub bookmarks: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum EventArgs {
    /// A bookmark was created
    Created {
        id: String,

        /// Bookmark title
        #[clap(short, long, default_value = "")]
        title: String,

        /// a url. Omit for a folder
        #[clap(short, long)]
        url: Option<String>,
    },
    /// A bookmark was removed
    Removed { id: String },
    /// A bookmark's title or url changed
    Changed {
        id: String,

        /// New title
        #[clap(short, long)]
        title: Option<String>,

        /// New url
        #[clap(short, long)]
        url: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Index every bookmark that is not indexed yet.
    /// Rebuilds from scratch when the active provider changed.
    Index {
        #[clap(flatten)]
        source: SourceArgs,

        /// Auto confirm a rebuild
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
    /// Reconcile the index with the bookmarks file
    Sync {
        #[clap(flatten)]
        source: SourceArgs,
    },
    /// Search bookmarks by keyword and meaning
    Search {
        /// Query text
        query: String,

        /// Maximum number of semantic hits
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Skip keyword search
        #[clap(long, default_value = "false")]
        semantic_only: bool,

        #[clap(flatten)]
        source: SourceArgs,
    },
    /// Show providers and index state
    Status {},
    /// Remove every indexed bookmark
    Clear {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
    /// Apply a single bookmark event to the index
    Event {
        #[clap(subcommand)]
        event: EventArgs,
    },
    /// Select the embedding provider (local, jina, openai, fallback)
    Provider { kind: ProviderKind },
    /// Store the API token of a remote provider. An empty token removes it
    Token { kind: ProviderKind, token: String },
    /// Set the base url of a remote provider. An empty url restores the default
    BaseUrl { kind: ProviderKind, url: String },
}
