//! ft - File Transferer
//!
//! `ft serve` exposes a directory, `ft list` prints it as CSV, and
//! `ft download` mirrors it locally with parallel workers.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ft::cli::{dial_addr, init_logging, listen_addr, Cli, Command, DownloadOpts, ListOpts, ServeOpts};
use ft::client::Client;
use ft::download::{download_tree, DownloadOptions};
use ft::listing::{write_listing, ModeFormat};
use ft::progress::{BarProgress, NoProgress, ProgressObserver};
use ft::server::Server;
use ft::tls;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user (Ctrl-C), cancelling...");
        token.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        match cli.command {
            Command::Serve(opts) => serve_main(opts, cancel).await,
            Command::Download(opts) => download_main(opts, cancel).await,
            Command::List(opts) => list_main(opts, cancel).await,
        }
    })
}

async fn serve_main(opts: ServeOpts, cancel: CancellationToken) -> Result<()> {
    let mut server = Server::new(&opts.dir)?;
    if let Some(dir) = &opts.tls_path {
        if opts.generate_cert {
            let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
            if tls::generate_self_signed(dir, &names)? {
                info!(dir = %dir.display(), "generated self-signed certificate");
            }
        }
        let config = tls::load_server_config(dir)
            .with_context(|| format!("load TLS files from {}", dir.display()))?;
        server = server.with_tls(config);
    }

    let addr = listen_addr(&opts.addr);
    tokio::select! {
        res = server.bind(&addr) => res,
        _ = cancel.cancelled() => Ok(()),
    }
}

fn build_client(addr: &str, tls_path: Option<&std::path::Path>, cancel: CancellationToken) -> Result<Client> {
    let mut client = Client::new(dial_addr(addr)).with_cancellation(cancel);
    if let Some(dir) = tls_path {
        let config = tls::load_client_config(dir)
            .with_context(|| format!("load TLS certificate from {}", dir.display()))?;
        client = client.with_tls(config)?;
    }
    Ok(client)
}

async fn download_main(opts: DownloadOpts, cancel: CancellationToken) -> Result<()> {
    let client = build_client(&opts.addr, opts.tls_path.as_deref(), cancel)?;
    client
        .check_connection()
        .await
        .with_context(|| format!("cannot connect to {}", client.addr()))?;

    let bars = (!opts.no_progress).then(|| Arc::new(BarProgress::new()));
    let progress: Arc<dyn ProgressObserver> = match &bars {
        Some(b) => b.clone(),
        None => Arc::new(NoProgress),
    };
    let options = DownloadOptions {
        workers: opts.workers,
        ..DownloadOptions::default()
    };

    let summary = download_tree(&client, &opts.dir, options, progress).await?;
    if let Some(b) = bars {
        b.finish();
    }
    info!(
        dirs = summary.dirs,
        files = summary.files,
        bytes = summary.bytes,
        failed = summary.failed.len(),
        "download finished"
    );
    if let Some(e) = &summary.listing_error {
        warn!("listing ended early: {}", e);
    }
    Ok(())
}

async fn list_main(opts: ListOpts, cancel: CancellationToken) -> Result<()> {
    let client = build_client(&opts.addr, opts.tls_path.as_deref(), cancel)?;
    let mut listing = client
        .list_files()
        .await
        .with_context(|| format!("cannot connect to {}", client.addr()))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write_listing(&mut listing, &mut out, ModeFormat::default()).await?;
    out.flush().ok();
    Ok(())
}
