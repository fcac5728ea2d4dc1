//! `qiniu-storage`: inspect and manipulate registry storage from the command line.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::WrapErr as _;
use futures::TryStreamExt as _;
use storage::{Config, StorageConfig};
use storage_driver::Source;
use tokio::io::AsyncWriteExt as _;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qiniu-storage", version, about)]
struct Args {
    /// TOML storage configuration. Without one, the Qiniu bucket is
    /// configured from the `QINIU_*` environment variables.
    #[arg(short, long, env = "QINIU_STORAGE_CONFIG")]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print an object, or save it to a file.
    Get {
        path: String,
        #[arg(short, long)]
        output: Option<Utf8PathBuf>,
    },

    /// Store a file, or standard input, as an object.
    Put {
        path: String,
        input: Option<Utf8PathBuf>,
    },

    /// List the objects below a directory.
    Ls {
        #[arg(default_value = "")]
        path: String,
    },

    /// Delete an object.
    Rm { path: String },

    /// Show an object's metadata.
    Stat { path: String },

    /// Print a signed download URL for an object.
    Url { path: String },

    /// Exit with status 1 if an object is missing.
    Exists { path: String },
}

async fn load(path: Option<&Utf8PathBuf>) -> eyre::Result<Config> {
    let Some(path) = path else {
        return Ok(Config {
            driver: StorageConfig::QiniuEnv,
            cache: storage::CacheConfig::disabled(),
        });
    };

    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("read configuration from {path}"))?;
    toml_edit::de::from_str(&text).wrap_err_with(|| format!("parse configuration in {path}"))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let storage = load(args.config.as_ref()).await?.build()?;
    tracing::debug!(driver = storage.name(), "Storage ready");

    let mut stdout = tokio::io::stdout();
    match args.command {
        Command::Get { path, output: Some(output) } => {
            storage.download_file(&path, &output).await?;
        }
        Command::Get { path, output: None } => {
            let mut stream = storage.get_stream(&path, None).await?;
            while let Some(chunk) = stream.try_next().await? {
                stdout.write_all(&chunk).await?;
            }
        }
        Command::Put { path, input: Some(input) } => {
            let path = storage.upload_file(&path, &input).await?;
            println!("{path}");
        }
        Command::Put { path, input: None } => {
            let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let path = storage.put_stream(&path, Source::Unsized(&mut stdin)).await?;
            println!("{path}");
        }
        Command::Ls { path } => {
            let mut paths = storage.list_directory(&path).await?;
            while let Some(path) = paths.try_next().await? {
                stdout.write_all(format!("{path}\n").as_bytes()).await?;
            }
        }
        Command::Rm { path } => storage.remove(&path).await?,
        Command::Stat { path } => {
            let metadata = storage.metadata(&path).await?;
            println!("size:    {}", metadata.size);
            println!("created: {}", metadata.created.to_rfc3339());
            if let Some(hash) = metadata.hash {
                println!("hash:    {hash}");
            }
            if let Some(content_type) = metadata.content_type {
                println!("type:    {content_type}");
            }
        }
        Command::Url { path } => match storage.content_redirect_url(&path)? {
            Some(url) => println!("{url}"),
            None => eyre::bail!("{} storage does not serve download URLs", storage.name()),
        },
        Command::Exists { path } => {
            if !storage.exists(&path).await {
                std::process::exit(1);
            }
        }
    }

    stdout.flush().await?;
    Ok(())
}
