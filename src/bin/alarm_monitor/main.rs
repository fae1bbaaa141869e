use alarm_monitor::alarm_event::AlarmEvent;
use alarm_monitor::daemon;
use alarm_monitor::journal::RecordWriter;
use alarm_monitor::monitor::AlarmMonitor;
use alarm_monitor::open_pipe::PipeWordSource;
use alarm_monitor::read_config::{self, MonitorConfig};
use alarm_monitor::util::error::DynResult;
use clap::{Arg, Command};
use log::{error, info, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_FILE: &str = "alarm_monitor.xml";
const JOURNAL_QUEUE_LEN: usize = 64;

fn read_configuration(path: &Path) -> DynResult<MonitorConfig> {
    let file = File::open(path)?;
    Ok(read_config::read_file(file)?)
}

fn open_journal(conf: &MonitorConfig) -> DynResult<Box<dyn Write + Send>> {
    Ok(match &conf.journal {
        Some(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
        None => Box::new(std::io::stdout()),
    })
}

fn display_event(event: &AlarmEvent) {
    match event {
        AlarmEvent::Triggered {
            index,
            space,
            description,
            severity,
            ..
        } => info!(
            "{} {:?}:{} triggered: {}",
            severity.as_str(),
            space,
            index,
            description
        ),
        AlarmEvent::Acknowledged {
            index,
            space,
            active,
            ..
        } => info!(
            "Alarm {:?}:{} acknowledged ({})",
            space,
            index,
            if *active { "still active" } else { "inactive" }
        ),
        AlarmEvent::Cleared { index, space, .. } => {
            info!("Alarm {:?}:{} cleared", space, index)
        }
    }
}

async fn write_journal(
    mut events: Receiver<AlarmEvent>,
    mut writer: RecordWriter<Box<dyn Write + Send>>,
) {
    while let Some(event) = events.recv().await {
        if let Err(e) = writer.write_event(&event) {
            error!("Failed to write alarm record: {}", e);
        }
    }
}

#[tokio::main]
async fn main() {
    let app_args = Command::new("Alarm monitor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Polls packed alarm words from a Siemens Unified HMI runtime and journals alarm events")
        .arg(
            Arg::new("CONF")
                .default_value(DEFAULT_CONFIG_FILE)
                .help("Configuration file"),
        );
    let app_args = daemon::add_args(app_args);
    let args = app_args.get_matches();
    let conf_path = Path::new(args.value_of("CONF").unwrap_or(DEFAULT_CONFIG_FILE));

    daemon::start(&args);

    let conf = match read_configuration(conf_path) {
        Ok(conf) => conf,
        Err(e) => {
            error!(
                "Failed to read configuration file '{}': {}",
                conf_path.display(),
                e
            );
            return;
        }
    };
    let journal = match open_journal(&conf) {
        Ok(out) => RecordWriter::new(out),
        Err(e) => {
            error!("Failed to open alarm journal: {}", e);
            return;
        }
    };

    let source = Arc::new(PipeWordSource::new(
        &conf.bind,
        &conf.tag_pattern,
        conf.read_timeout,
    ));
    let monitor = Arc::new(
        AlarmMonitor::new(conf.monitor_settings(), source.clone(), conf.alarms.build())
            .with_code_catalog(conf.codes.build()),
    );

    monitor.subscribe(display_event);
    let (journal_handle, journal_events) = monitor.subscribe_queue(JOURNAL_QUEUE_LEN);
    let journal_task = tokio::spawn(write_journal(journal_events, journal));

    let cancel = CancellationToken::new();
    let poller = {
        let monitor = monitor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    };

    daemon::ready(&format!(
        "Polling {} alarm words from {}",
        monitor.word_count(),
        conf.bind
    ));

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to wait for ctrl-c: {}", e);
    }
    cancel.cancel();
    if let Err(e) = poller.await {
        warn!("Poll task failed: {}", e);
    }
    // Ends the journal queue once the pending records are written
    monitor.unsubscribe(journal_handle);
    if let Err(e) = journal_task.await {
        warn!("Journal task failed: {}", e);
    }
    source.close().await;
    info!("{} alarms active at exit", monitor.active_alarm_count());
    daemon::exiting();
}
