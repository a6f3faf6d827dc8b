#[macro_use] extern crate clap;

use clap::{App, ArgMatches};
use env_logger::Env;
use indicatif::{DecimalBytes, ProgressBar, ProgressStyle};
use rootless_pull::{errors::PullError, Config, Puller, ShutdownTrigger};
use std::{io, path::Path, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml)
        .version(crate_version!())
        .get_matches();

    let log_level = matches.value_of("log_level").unwrap_or("warn");
    env_logger::init_from_env(Env::default().default_filter_or(log_level));

    if let Err(err) = run(&matches).await {
        log::debug!("{:?}", err);
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn run(matches: &ArgMatches<'_>) -> Result<(), PullError> {
    let mut config = Config::builder();
    if let Some(dir) = matches.value_of("state_dir") {
        config = config.state_dir(Path::new(dir));
    }
    let puller = Puller::new(config.build().map_err(PullError::Storage)?)?;

    match matches.subcommand() {
        ("pull", Some(args)) => pull(&puller, args.value_of("image_reference").unwrap_or("")).await,
        ("gc", _) => gc(&puller).await,
        ("df", _) => df(&puller),
        (other, _) => {
            log::error!("unknown subcommand {:?}", other);
            Ok(())
        }
    }
}

async fn pull(puller: &Puller, reference: &str) -> Result<(), PullError> {
    let name = puller.parse_reference(reference)?;
    let trigger = Arc::new(ShutdownTrigger::new());
    let session = trigger.session(&puller.config().namespace);
    let signals = tokio::spawn(forward_signals(trigger.clone()));

    println!("Pulling {}...", name);
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg} [{elapsed}]") {
        spinner.set_style(style);
    }
    spinner.set_message(reference.to_owned());
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = puller.pull(&session, reference).await;
    spinner.finish_and_clear();
    signals.abort();

    let outcome = result?;
    println!("Snapshot ref: {}", outcome.snapshot_id);
    println!("Size: {}", DecimalBytes(outcome.size));
    Ok(())
}

async fn gc(puller: &Puller) -> Result<(), PullError> {
    let report = puller.gc().await?;
    println!(
        "Removed {} chains, {} blobs, {} temporary files",
        report.chains_removed.len(),
        report.blobs_removed,
        report.temp_files_removed
    );
    println!("Freed: {}", DecimalBytes(report.bytes_freed));
    Ok(())
}

fn df(puller: &Puller) -> Result<(), PullError> {
    let usage = puller.disk_usage()?;
    println!("Images: {}", usage.images);
    println!("Chains: {}", usage.chains);
    println!("Blobs: {}", usage.blobs);
    println!("Size: {}", DecimalBytes(usage.bytes));
    Ok(())
}

/// Turn SIGINT and SIGTERM into a shutdown request
///
/// Repeated signals are logged but cleanup only starts once.
async fn forward_signals(trigger: Arc<ShutdownTrigger>) -> io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => (),
        }
        if trigger.trigger() {
            eprintln!("interrupted, cleaning up");
        } else {
            log::warn!("already shutting down");
        }
    }
}
