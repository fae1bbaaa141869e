use clap::{Arg, ArgMatches, Command};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use systemd::daemon::{notify, STATE_READY, STATE_STATUS, STATE_STOPPING};
use systemd::journal::JournalLog;

// Cleared by --no_systemd
static UNDER_SYSTEMD: AtomicBool = AtomicBool::new(true);

fn under_systemd() -> bool {
    UNDER_SYSTEMD.load(Ordering::Relaxed)
}

fn notify_state(state: &[(&str, &str)]) {
    if let Err(e) = notify(false, state.iter()) {
        warn!("Failed to notify systemd: {}", e);
    }
}

pub fn add_args<'a>(app_args: Command<'a>) -> Command<'a> {
    app_args.arg(
        Arg::new("no_systemd")
            .long("no_systemd")
            .help("Log to stderr instead of the journal and don't notify systemd"),
    )
}

pub fn start(args: &ArgMatches) {
    UNDER_SYSTEMD.store(!args.is_present("no_systemd"), Ordering::Relaxed);
    if under_systemd() {
        if let Err(e) = JournalLog::init() {
            eprintln!("Failed to start journal logging: {}", e);
        }
    } else {
        tracing_subscriber::fmt::init();
    }
    info!("Alarm monitor starting");
}

/// Report that polling has started, `status` is shown by systemctl
pub fn ready(status: &str) {
    if under_systemd() {
        notify_state(&[(STATE_READY, "1"), (STATE_STATUS, status)]);
    }
    info!("Alarm monitor ready: {}", status);
}

pub fn exiting() {
    if under_systemd() {
        notify_state(&[(STATE_STOPPING, "1")]);
    }
    info!("Alarm monitor exiting");
}
