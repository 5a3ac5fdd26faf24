//! A broker with a hand-written policy: devices must present a password to
//! activate, `dev1` is barred from publishing `EVT_TEST`, and `dev1` never
//! receives anything published by `dev2`. WebSocket connections get a
//! tighter header budget than TCP ones via [`CasePolicy`].

use riotp_core::config::{default_config, load_config};
use riotp_core::policy::{Action, CasePolicy, DefaultPolicy, Policy, SecurityEvent};
use riotp_core::{Connection, Event, Runtime};

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,
}

struct GuardedPolicy;

impl Policy for GuardedPolicy {
    fn security_action(&self, _conn: &Connection, event: &SecurityEvent) -> Action {
        match event {
            // a runaway header is the one thing we always cut off
            SecurityEvent::HeaderSizeLimitReached => Action::error_and_halt(),
            _ => Action::warn_and_ignore(),
        }
    }

    fn header_message_max_size(&self, _conn: &Connection) -> usize {
        50
    }

    fn header_max_size(&self, _conn: &Connection) -> usize {
        200
    }

    fn can_activate(&self, conn: &Connection) -> bool {
        conn.property_first("password").as_deref() == Some("1234")
    }

    fn can_trigger_event(&self, conn: &Connection, evt: &str) -> bool {
        !(*conn.name() == "dev1" && evt == "EVT_TEST")
    }

    fn can_receive_event(&self, conn: &Connection, event: &Event) -> bool {
        let from_dev2 = event
            .sender
            .upgrade()
            .map_or(false, |sender| *sender.name() == "dev2");
        !(*conn.name() == "dev1" && from_dev2)
    }

    fn min_trigger_interval(&self, _conn: &Connection) -> Duration {
        Duration::from_millis(500)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path),
        None => default_config(),
    };

    // frame-stream listeners carry server_id 1 in the default config; give
    // them a tighter header budget and fall back to the guarded policy
    let ws_ids: Vec<usize> = config.websocket.iter().map(|l| l.server_id).collect();
    let ws_policy = DefaultPolicy {
        header_max_size: 120,
        ..DefaultPolicy::from_config(&config)
    };
    let policy = CasePolicy::new(Box::new(GuardedPolicy))
        .case(move |c| ws_ids.contains(&c.server_id()), Box::new(ws_policy));

    log::info!("starting guarded broker");
    Runtime::new(config, Box::new(policy)).run()
}
