use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download one novel into an EPUB, resuming any existing artifact.
    Download(DownloadArgs),
    /// Run the HTTP job surface.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Novel page URL (metruyencv.com or tangthuvien.net).
    #[arg(long)]
    pub url: String,

    /// metruyencv reader access token for restricted chapters.
    #[arg(long)]
    pub cookie: Option<String>,

    /// Directory for the finished artifact.
    #[arg(long, default_value = "novel_output")]
    pub out_dir: String,

    /// Directory for checkpoints and resumed remote copies.
    #[arg(long, default_value = "novel_temp")]
    pub temp_dir: String,

    /// Checkpoint after this many newly fetched chapters.
    #[arg(long, default_value_t = 50)]
    pub checkpoint_interval: usize,

    /// Dropbox access token; falls back to NOVEL2EPUB_DROPBOX_TOKEN.
    #[arg(long)]
    pub dropbox_token: Option<String>,

    /// Remote directory for finished artifacts.
    #[arg(long, default_value = "/Novel")]
    pub remote_dir: String,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: String,

    /// Base directory for job records and artifacts.
    #[arg(long, default_value = "data")]
    pub data_dir: String,

    /// Maximum downloads in flight at once.
    #[arg(long, default_value_t = 2)]
    pub max_concurrency: usize,

    /// Checkpoint after this many newly fetched chapters.
    #[arg(long, default_value_t = 50)]
    pub checkpoint_interval: usize,

    /// Dropbox access token; falls back to NOVEL2EPUB_DROPBOX_TOKEN.
    #[arg(long)]
    pub dropbox_token: Option<String>,
}
