/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use clap::{ArgAction, Parser};
use flexi_logger::Logger;
use log::{debug, info, warn};
#[cfg(unix)]
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use kestrel_agent::config::Config;
use kestrel_agent::dispatcher::Dispatcher;
use kestrel_agent::platform::WorkloadTable;
use kestrel_agent::probe::{ProbeBridge, QueueBridge};
use kestrel_agent::utils::stats;

#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(
        short = 'f',
        visible_short_alias = 'c',
        long,
        default_value = "/etc/kestrel-agent.yaml"
    )]
    config_file: String,

    /// Display the version
    #[clap(short, long, action = ArgAction::SetTrue)]
    version: bool,
}

#[cfg(unix)]
fn wait_on_signals() {
    let mut signals = Signals::new(TERM_SIGNALS).unwrap();
    signals.forever().next();
    signals.handle().close();
}

#[cfg(not(unix))]
fn wait_on_signals() {
    thread::park();
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    if opts.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let _logger = Logger::try_with_env_or_str("info")?.start()?;

    let config = match Config::load_from_file(&opts.config_file) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}, using defaults", e);
            Config::default()
        }
    };
    info!(
        "starting with {} workers, {} tracked connections max",
        config.effective_workers(),
        config.max_connections
    );

    let stats_collector = Arc::new(stats::Collector::new(config.stats_interval));
    stats_collector.start();

    // filled by the metadata watcher sidecar, empty lookups are fine
    let workload_table = Arc::new(WorkloadTable::default());

    let (dispatcher, records) =
        Dispatcher::new(config, workload_table.clone(), stats_collector.clone());
    let dispatcher = Arc::new(dispatcher);
    dispatcher.start();

    // the exporter pipeline attaches here, until then records go to the log
    let sink = thread::Builder::new().name("record-sink".to_owned()).spawn(move || {
        for record in records {
            match serde_json::to_string(&record.attributes()) {
                Ok(line) => debug!("record {}", line),
                Err(e) => warn!("record serialize failed: {}", e),
            }
        }
    })?;

    // the native probe owns the sending half of this bridge
    let (_event_sender, mut bridge) = QueueBridge::bounded(1 << 16);
    bridge.init_probe()?;
    bridge.subscribe("syscall_data_event", "net")?;
    let ingest = {
        let dispatcher = dispatcher.clone();
        thread::Builder::new().name("probe-ingest".to_owned()).spawn(move || {
            while let Some(event) = bridge.next_event() {
                dispatcher.send(event);
            }
        })?
    };

    wait_on_signals();
    info!("received terminate signal, draining");

    dispatcher.stop();
    stats_collector.stop();
    drop(_event_sender);
    let _ = ingest.join();
    let _ = sink.join();
    Ok(())
}
