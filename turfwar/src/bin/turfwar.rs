//! turfwar server
use daemonize::Daemonize;
use mptc::signals::SignalTracker;
use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;
use turfwar::asset::AssetStore;
use turfwar::conf::{self, Config, Invocation};
use turfwar::logging::Logger;
use turfwar::result::TurfResult;
use turfwar::server::{self, ConnectionStream, ServerContext};
use turfwar::store::StoreConnector;
use turfwar::workers::{self, BackgroundWorkers};

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let conf = match Config::from_args(&args) {
        Ok(Invocation::Run(c)) => c,
        Ok(Invocation::Help(text)) => {
            println!("{text}");
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{e}\n\n{}", Config::usage());
            process::exit(conf::EXIT_USAGE);
        }
    };

    if let Err(e) = run(*conf) {
        log::error!("turfwar exiting on error: {e}");
        eprintln!("turfwar: {e}");
        process::exit(1);
    }
}

fn run(mut conf: Config) -> TurfResult<()> {
    conf.resolve_asset_dir()?;

    // Must happen before any threads exist.
    if conf.daemonize {
        Daemonize::new()
            .working_directory(&conf.asset_dir)
            .start()
            .map_err(|e| format!("Cannot daemonize: {e}"))?;
    }

    Logger::new(&conf.logging).init()?;

    env::set_current_dir(&conf.asset_dir)
        .map_err(|e| format!("Cannot chdir to {}: {e}", conf.asset_dir))?;

    if let Some(ref tmp) = conf.tmp_dir {
        env::set_var("TMPDIR", tmp);
    }

    let connector: Arc<dyn StoreConnector> = Arc::new(conf.connector()?);

    let (score, recent) = workers::initial_documents(connector.as_ref())?;

    // Missing static files are fatal.
    let assets = AssetStore::load(Path::new("."), score, recent)?;

    let signals = SignalTracker::new();
    signals.track_shutdown()?;

    let ctx = Arc::new(ServerContext::new(assets, conf.keepalive(), signals));

    let stream = ConnectionStream::new(ctx.clone(), &conf.address, conf.port)?;

    let mut background = BackgroundWorkers::spawn(&ctx, connector)?;
    background.spawn_asset_worker(&ctx)?;

    log::info!(
        "turfwar started with {} workers, keepalive {}ms",
        conf.workers,
        conf.keepalive_ms
    );

    // Runs until a signal arrives or the listener fails.
    server::serve(stream, conf.workers);

    ctx.signals.request_shutdown();
    background.join(&ctx);

    log::info!("turfwar exiting");

    Ok(())
}
