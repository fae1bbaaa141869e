use clap::{ArgMatches, Command};
use log::info;

pub fn add_args<'a>(app_args: Command<'a>) -> Command<'a> {
    app_args
}

pub fn start(_args: &ArgMatches) {
    tracing_subscriber::fmt::init();
    info!("Alarm monitor starting");
}

pub fn ready(status: &str) {
    info!("Alarm monitor ready: {}", status);
}

pub fn exiting() {
    info!("Alarm monitor exiting");
}
