use std::{
    path::PathBuf,
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tokendrill::{
    options::Options,
    pipeline::{Config, Pipeline},
};
use tokendrill_token::pkcs11::Pkcs11Provider;

fn main() {
    let options = Options::parse();
    init_logging(options.debug);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("interrupt received, will shut down after this iteration completes");
            cancel.store(true, Ordering::Relaxed);
        }) {
            error!("unable to register the interrupt handler: {e}");
            process::exit(1);
        }
    }

    let provider = match Pkcs11Provider::load(&options.library) {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            error!("unable to connect to the PKCS#11 library, aborting: {e}");
            process::exit(1);
        }
    };
    match provider.info() {
        Ok(info) => debug!("{info}"),
        Err(e) => debug!("unable to read the module information: {e}"),
    }

    let config = Config {
        pin: options.pin,
        key_id: options.key_id.0,
        max_iterations: options.count,
        interval: Duration::from_millis(options.interval),
        journal_dir: PathBuf::from("."),
    };
    let pipeline = Pipeline::new(provider, config, cancel);

    let mut slots = match pipeline.startup() {
        Ok(slots) => slots,
        Err(e) => {
            error!("unable to start the load test, aborting: {e}");
            process::exit(1);
        }
    };
    pipeline.run(&mut slots);
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
