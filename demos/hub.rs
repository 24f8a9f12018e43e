// Copyright (c) 2018 The rust-gpio-cdev Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gpio_cdev_hub::config::HubConfig;
use gpio_cdev_hub::{Consumer, Hub};
use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
struct Cli {
    /// TOML file listing switches, sensors and covers
    config: PathBuf,
    /// The gpiochip device (e.g. /dev/gpiochip0), overrides the config
    #[structopt(long)]
    chip: Option<PathBuf>,
}

/// Prints every edge seen on its lines.
struct Logger {
    name: String,
    on: AtomicBool,
}

impl Consumer for Logger {
    fn handle_event(&self) {
        let on = !self.on.load(Ordering::SeqCst);
        self.on.store(on, Ordering::SeqCst);
        info!("[{}] event, now {}", self.name, if on { "on" } else { "off" });
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    fn set_on(&self, on: bool) {
        self.on.store(on, Ordering::SeqCst)
    }
}

fn do_main(args: Cli) -> anyhow::Result<()> {
    let mut config = HubConfig::load(&args.config)?;
    if args.chip.is_some() {
        config.path = args.chip;
    }

    let mut hub = config.open_hub()?;
    info!("using {} ({:?})", hub.hub_id().display(), hub.label());

    // The hub only keeps weak references; the consumers live here.
    let consumers = config.apply(&mut hub, |name: &str| -> Arc<dyn Consumer> {
        Arc::new(Logger {
            name: name.to_owned(),
            on: AtomicBool::new(false),
        })
    })?;
    for (name, consumer) in &consumers {
        info!("registered {} (on: {})", name, consumer.is_on());
    }

    hub.startup();
    if !hub.dispatcher().is_armed() {
        info!("no sensors configured, nothing to watch");
        return Ok(());
    }

    loop {
        run_once(&hub)?;
    }
}

fn run_once(hub: &Hub) -> anyhow::Result<()> {
    let delivered = hub.wait_events(None)?;
    if delivered == 0 {
        info!("woke without events");
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Cli::from_args();
    if let Err(e) = do_main(args) {
        error!("{:?}", e);
    }
}
